// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT
#![allow(dead_code)]

use std::collections::BTreeMap;

use cid::Cid;
use fil_miner_runtime::reward::{FilterEstimate, ThisEpochRewardReturn};
use fil_miner_runtime::runtime::DomainSeparationTag;
use fil_miner_runtime::test_utils::*;
use fil_miner_runtime::{
    ActorError, Array, MessageAccumulator, BURNT_FUNDS_ACTOR_ADDR, INIT_ACTOR_ADDR,
    REWARD_ACTOR_ADDR, STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};
use fil_storage_miner::ext::market::{
    ActivateDealsParams, ComputeDataCommitmentParams, VerifyDealsForActivationParams,
    VerifyDealsForActivationReturn, ACTIVATE_DEALS_METHOD, COMPUTE_DATA_COMMITMENT_METHOD,
    VERIFY_DEALS_FOR_ACTIVATION_METHOD,
};
use fil_storage_miner::ext::power::{
    CurrentTotalPowerReturn, EnrollCronEventParams, UpdateClaimedPowerParams,
    CURRENT_TOTAL_POWER_METHOD, ENROLL_CRON_EVENT_METHOD, SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
    UPDATE_CLAIMED_POWER_METHOD, UPDATE_PLEDGE_TOTAL_METHOD,
};
use fil_storage_miner::ext::reward::THIS_EPOCH_REWARD_METHOD;
use fil_storage_miner::testing::StateSummary;
use fil_storage_miner::{
    aggregate_pre_commit_network_fee, aggregate_prove_commit_network_fee, find_sector,
    initial_pledge_for_power, pledge_penalty_for_invalid_windowpost,
    power_for_sectors, qa_power_for_weight, Actor, CompactPartitionsParams,
    ConfirmSectorProofsParams, CronEventPayload, Deadline, DeadlineInfo,
    DeclareFaultsParams, DeclareFaultsRecoveredParams, DeferredCronEventParams,
    DisputeWindowedPoStParams, FaultDeclaration, Method, MinerConstructorParams, Partition,
    PoStPartition, PowerPair, PreCommitSectorBatchParams, PreCommitSectorParams,
    ProveCommitAggregateParams, ProveCommitSectorParams,
    RecoveryDeclaration, SectorOnChainInfo, SectorPreCommitOnChainInfo, State,
    SubmitWindowedPoStParams, WindowedPoSt, reward_for_disputed_window_post,
    CRON_EVENT_PROVING_DEADLINE,
};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    AggregateSealVerifyInfo, PoStProof, RegisteredPoStProof, RegisteredSealProof, SealVerifyInfo, SectorID, SectorInfo,
    SectorNumber, SectorSize, StoragePower, WindowPoStVerifyInfo,
};
use fvm_shared::METHOD_SEND;
use num_traits::Zero;

pub const RECEIVER_ID: u64 = 1000;

/// Default sector lifetime, in proving periods past the end of the current one.
pub const DEFAULT_SECTOR_EXPIRATION: u64 = 220;

pub fn big_balance() -> TokenAmount {
    TokenAmount::from_whole(1_000_000)
}

pub struct ActorHarness {
    pub receiver: Address,
    pub owner: Address,
    pub worker: Address,
    pub control_addrs: Vec<Address>,

    pub seal_proof_type: RegisteredSealProof,
    pub window_post_proof_type: RegisteredPoStProof,
    pub sector_size: SectorSize,
    pub partition_size: u64,
    pub period_offset: ChainEpoch,
    pub next_sector_no: SectorNumber,

    pub network: NetworkStats,
}

/// What the reward and power actors report to the miner when it queries the network.
#[derive(Clone)]
pub struct NetworkStats {
    pub pledge_collateral: TokenAmount,
    pub raw_power: StoragePower,
    pub qa_power: StoragePower,
    pub baseline: StoragePower,
    pub reward_smoothed: FilterEstimate,
    pub qa_power_smoothed: FilterEstimate,
}

impl NetworkStats {
    /// A network with `reward` per epoch and `power` bytes of both raw and QA power.
    pub fn flat(reward: TokenAmount, power: StoragePower) -> Self {
        Self {
            pledge_collateral: &reward * 1000,
            raw_power: power.clone(),
            qa_power: power.clone(),
            baseline: power.clone(),
            reward_smoothed: FilterEstimate::new(reward.atto().clone(), BigInt::zero()),
            qa_power_smoothed: FilterEstimate::new(power, BigInt::zero()),
        }
    }

    pub fn reward_return(&self) -> ThisEpochRewardReturn {
        ThisEpochRewardReturn {
            this_epoch_baseline_power: self.baseline.clone(),
            this_epoch_reward_smoothed: self.reward_smoothed.clone(),
        }
    }

    pub fn power_return(&self) -> CurrentTotalPowerReturn {
        CurrentTotalPowerReturn {
            raw_byte_power: self.raw_power.clone(),
            quality_adj_power: self.qa_power.clone(),
            pledge_collateral: self.pledge_collateral.clone(),
            quality_adj_power_smoothed: self.qa_power_smoothed.clone(),
        }
    }
}

impl ActorHarness {
    pub fn new(proving_period_offset: ChainEpoch) -> ActorHarness {
        let window_post_proof_type = RegisteredPoStProof::StackedDRGWindow32GiBV1;

        ActorHarness {
            receiver: Address::new_id(RECEIVER_ID),
            owner: Address::new_id(100),
            worker: Address::new_id(101),
            control_addrs: vec![Address::new_id(999), Address::new_id(998)],

            seal_proof_type: RegisteredSealProof::StackedDRG32GiBV1P1,
            window_post_proof_type,
            sector_size: window_post_proof_type.sector_size().unwrap(),
            partition_size: window_post_proof_type.window_post_partitions_sector().unwrap(),
            period_offset: proving_period_offset,
            next_sector_no: 0,
            network: NetworkStats::flat(
                TokenAmount::from_whole(10),
                StoragePower::from(1i128 << 50),
            ),
        }
    }

    pub fn new_runtime(&self) -> MockRuntime {
        let mut rt = MockRuntime::default();
        rt.policy.valid_post_proof_type.insert(self.window_post_proof_type);
        rt.policy.valid_pre_commit_proof_type.insert(self.seal_proof_type);
        rt.receiver = self.receiver;
        rt.hash_func = fixed_hasher(self.period_offset);
        rt
    }

    pub fn get_state(&self, rt: &MockRuntime) -> State {
        rt.get_state::<State>()
    }

    pub fn construct_and_verify(&self, rt: &MockRuntime) {
        let params = MinerConstructorParams {
            owner: self.owner,
            worker: self.worker,
            control_addresses: self.control_addrs.clone(),
            window_post_proof_type: self.window_post_proof_type,
            peer_id: vec![0],
            multi_addresses: vec![],
        };

        rt.set_caller(INIT_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);
        let ret = rt
            .call::<Actor>(Method::Constructor as u64, IpldBlock::serialize_cbor(&params).unwrap())
            .unwrap();
        assert!(ret.is_none());
        rt.verify();
    }

    /// Owner, worker and control addresses, in the order the actor checks them.
    pub fn caller_addrs(&self) -> Vec<Address> {
        let mut addrs = vec![self.owner, self.worker];
        addrs.extend(self.control_addrs.iter().copied());
        addrs
    }

    pub fn get_deadline_info(&self, rt: &MockRuntime) -> DeadlineInfo {
        self.get_state(rt).deadline_info(&rt.policy, rt.epoch.get())
    }

    pub fn get_deadline(&self, rt: &MockRuntime, deadline_idx: u64) -> Deadline {
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        deadlines.load_deadline(&rt.store, deadline_idx).unwrap()
    }

    pub fn get_partition(&self, rt: &MockRuntime, deadline_idx: u64, partition_idx: u64) -> Partition {
        self.get_deadline(rt, deadline_idx).load_partition(&rt.store, partition_idx).unwrap()
    }

    pub fn get_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> SectorOnChainInfo {
        self.get_state(rt).get_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn get_precommit(
        &self,
        rt: &MockRuntime,
        sector_number: SectorNumber,
    ) -> SectorPreCommitOnChainInfo {
        self.get_state(rt).get_precommitted_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn find_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> (u64, u64) {
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        find_sector(&rt.store, &deadlines, sector_number).unwrap()
    }

    pub fn check_state_invariants(&self, rt: &MockRuntime) -> (StateSummary, MessageAccumulator) {
        fil_storage_miner::testing::check_state_invariants(
            &rt.policy,
            &self.get_state(rt),
            &rt.store,
            &rt.balance.borrow(),
        )
    }

    pub fn assert_invariants(&self, rt: &MockRuntime) {
        let (_, acc) = self.check_state_invariants(rt);
        acc.assert_empty();
    }

    pub fn power_pair_for_sectors(&self, sectors: &[SectorOnChainInfo]) -> PowerPair {
        power_for_sectors(self.sector_size, sectors)
    }

    pub fn expect_query_network_info(&self, rt: &MockRuntime) {
        rt.expect_send(
            REWARD_ACTOR_ADDR,
            THIS_EPOCH_REWARD_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&self.network.reward_return()).unwrap(),
            ExitCode::OK,
        );
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            CURRENT_TOTAL_POWER_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&self.network.power_return()).unwrap(),
            ExitCode::OK,
        );
    }

    pub fn expect_enroll_cron(&self, rt: &MockRuntime, event_epoch: ChainEpoch) {
        let params = EnrollCronEventParams {
            event_epoch,
            payload: RawBytes::serialize(CronEventPayload {
                event_type: CRON_EVENT_PROVING_DEADLINE,
            })
            .unwrap(),
        };
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            ENROLL_CRON_EVENT_METHOD,
            IpldBlock::serialize_cbor(&params).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );
    }

    pub fn expect_update_power(&self, rt: &MockRuntime, delta: &PowerPair) {
        if delta.is_zero() {
            return;
        }
        let params = UpdateClaimedPowerParams {
            raw_byte_delta: delta.raw.clone(),
            quality_adjusted_delta: delta.qa.clone(),
        };
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            UPDATE_CLAIMED_POWER_METHOD,
            IpldBlock::serialize_cbor(&params).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );
    }

    pub fn expect_update_pledge(&self, rt: &MockRuntime, delta: &TokenAmount) {
        if delta.is_zero() {
            return;
        }
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            UPDATE_PLEDGE_TOTAL_METHOD,
            IpldBlock::serialize_cbor(delta).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );
    }

    pub fn expect_burn(&self, rt: &MockRuntime, amount: &TokenAmount) {
        if !amount.is_positive() {
            return;
        }
        rt.expect_send(
            BURNT_FUNDS_ACTOR_ADDR,
            METHOD_SEND,
            None,
            amount.clone(),
            None,
            ExitCode::OK,
        );
    }

    pub fn make_pre_commit_params(
        &self,
        sector_no: SectorNumber,
        challenge: ChainEpoch,
        expiration: ChainEpoch,
        deal_ids: Vec<DealID>,
    ) -> PreCommitSectorParams {
        PreCommitSectorParams {
            seal_proof: self.seal_proof_type,
            sector_number: sector_no,
            sealed_cid: make_sealed_cid(b"commr"),
            seal_rand_epoch: challenge,
            deal_ids,
            expiration,
        }
    }

    pub fn make_prove_commit_params(&self, sector_no: SectorNumber) -> ProveCommitSectorParams {
        ProveCommitSectorParams { sector_number: sector_no, proof: vec![0u8; 192] }
    }

    /// Expiration `periods` proving periods past the end of the current one.
    pub fn sector_expiration(&self, rt: &MockRuntime, periods: u64) -> ChainEpoch {
        self.get_deadline_info(rt).period_end() + periods as i64 * rt.policy.wpost_proving_period
    }

    pub fn pre_commit_sector_raw(
        &self,
        rt: &MockRuntime,
        params: PreCommitSectorParams,
        cfg: PreCommitConfig,
        first: bool,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());
        self.expect_query_network_info(rt);

        if !params.deal_ids.is_empty() {
            let verify_params = VerifyDealsForActivationParams {
                deal_ids: params.deal_ids.clone(),
                sector_start: rt.epoch.get(),
                sector_expiry: params.expiration,
            };
            rt.expect_send(
                STORAGE_MARKET_ACTOR_ADDR,
                VERIFY_DEALS_FOR_ACTIVATION_METHOD,
                IpldBlock::serialize_cbor(&verify_params).unwrap(),
                TokenAmount::zero(),
                IpldBlock::serialize_cbor(&cfg.deal_weights).unwrap(),
                ExitCode::OK,
            );
        }

        if first {
            let dl_info = self.get_deadline_info(rt);
            self.expect_enroll_cron(rt, dl_info.last());
        }

        rt.call::<Actor>(Method::PreCommitSector as u64, IpldBlock::serialize_cbor(&params).unwrap())
    }

    pub fn pre_commit_sector(
        &self,
        rt: &MockRuntime,
        params: PreCommitSectorParams,
        cfg: PreCommitConfig,
        first: bool,
    ) -> SectorPreCommitOnChainInfo {
        let sector_number = params.sector_number;
        let ret = self.pre_commit_sector_raw(rt, params, cfg, first).unwrap();
        assert!(ret.is_none());
        rt.verify();
        self.get_precommit(rt, sector_number)
    }

    pub fn prove_commit_sector(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
        params: ProveCommitSectorParams,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_any();

        let unsealed_cid = self.expect_compute_unsealed_cid(rt, pc);
        let (randomness, interactive_randomness) = self.seal_randomness(rt, pc);
        let svi = SealVerifyInfo {
            registered_proof: pc.info.seal_proof,
            sector_id: SectorID { miner: RECEIVER_ID, number: pc.info.sector_number },
            deal_ids: pc.info.deal_ids.clone(),
            randomness,
            interactive_randomness,
            proof: params.proof.clone(),
            sealed_cid: pc.info.sealed_cid,
            unsealed_cid,
        };
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&svi).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        rt.call::<Actor>(
            Method::ProveCommitSector as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
    }

    fn expect_compute_unsealed_cid(&self, rt: &MockRuntime, pc: &SectorPreCommitOnChainInfo) -> Cid {
        let unsealed_cid = make_piece_cid(b"unsealed");
        let compute_params = ComputeDataCommitmentParams {
            deal_ids: pc.info.deal_ids.clone(),
            sector_type: pc.info.seal_proof,
        };
        rt.expect_send(
            STORAGE_MARKET_ACTOR_ADDR,
            COMPUTE_DATA_COMMITMENT_METHOD,
            IpldBlock::serialize_cbor(&compute_params).unwrap(),
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&unsealed_cid).unwrap(),
            ExitCode::OK,
        );
        unsealed_cid
    }

    /// Ticket and interactive randomness the mock serves for a pre-commit's seal proof.
    fn seal_randomness(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
    ) -> (Randomness, Randomness) {
        let entropy = fvm_ipld_encoding::to_vec(&self.receiver).unwrap();
        let seal_rand = mock_randomness(
            b"tickets",
            DomainSeparationTag::SealRandomness,
            pc.info.seal_rand_epoch,
            &entropy,
        );
        let interactive_epoch = pc.pre_commit_epoch + rt.policy.pre_commit_challenge_delay;
        let seal_int_rand = mock_randomness(
            b"beacon",
            DomainSeparationTag::InteractiveSealChallengeSeed,
            interactive_epoch,
            &entropy,
        );
        (Randomness(seal_rand.to_vec()), Randomness(seal_int_rand.to_vec()))
    }

    /// Pre-commits deal-free sectors in one batch message, expecting the batch fee to be burnt
    /// when there is more than one.
    pub fn pre_commit_sector_batch_raw(
        &self,
        rt: &MockRuntime,
        sectors: Vec<PreCommitSectorParams>,
        first: bool,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());
        self.expect_query_network_info(rt);

        if sectors.len() > 1 {
            let fee = aggregate_pre_commit_network_fee(sectors.len() as i64, &rt.base_fee.borrow());
            self.expect_burn(rt, &fee);
        }
        if first {
            let dl_info = self.get_deadline_info(rt);
            self.expect_enroll_cron(rt, dl_info.last());
        }

        let params = PreCommitSectorBatchParams { sectors };
        rt.call::<Actor>(
            Method::PreCommitSectorBatch as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
    }

    pub fn pre_commit_sector_batch(
        &self,
        rt: &MockRuntime,
        sectors: Vec<PreCommitSectorParams>,
        first: bool,
    ) -> Vec<SectorPreCommitOnChainInfo> {
        let numbers: Vec<SectorNumber> = sectors.iter().map(|s| s.sector_number).collect();
        let ret = self.pre_commit_sector_batch_raw(rt, sectors, first).unwrap();
        assert!(ret.is_none());
        rt.verify();
        numbers.into_iter().map(|n| self.get_precommit(rt, n)).collect()
    }

    /// Proves `pcs` with one aggregate proof. When `verify_exit` is not OK the verifier rejects
    /// the proof and nothing past verification is expected.
    pub fn prove_commit_aggregate(
        &self,
        rt: &MockRuntime,
        pcs: &[SectorPreCommitOnChainInfo],
        verify_exit: ExitCode,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let mut infos = Vec::with_capacity(pcs.len());
        for pc in pcs {
            let unsealed_cid = self.expect_compute_unsealed_cid(rt, pc);
            let (randomness, interactive_randomness) = self.seal_randomness(rt, pc);
            infos.push(AggregateSealVerifyInfo {
                sector_number: pc.info.sector_number,
                randomness,
                interactive_randomness,
                sealed_cid: pc.info.sealed_cid,
                unsealed_cid,
            });
        }
        let proof = vec![0xa5u8; 1024];
        rt.expect_aggregate_verify_seals(infos, proof.clone(), verify_exit);

        if verify_exit.is_success() {
            self.expect_query_network_info(rt);
            let pledge = pcs.iter().fold(TokenAmount::zero(), |acc, pc| {
                acc + self.expected_initial_pledge(rt, pc)
            });
            self.expect_update_pledge(rt, &pledge);
            let fee = aggregate_prove_commit_network_fee(pcs.len() as i64, &rt.base_fee.borrow());
            self.expect_burn(rt, &fee);
        }

        let numbers: Vec<SectorNumber> = pcs.iter().map(|pc| pc.info.sector_number).collect();
        let params = ProveCommitAggregateParams {
            sector_numbers: make_bitfield(&numbers),
            aggregate_proof: proof,
        };
        rt.call::<Actor>(
            Method::ProveCommitAggregate as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
    }

    /// The pledge the actor will lock for a pre-commit activated at the current epoch.
    pub fn expected_initial_pledge(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
    ) -> TokenAmount {
        let duration = pc.info.expiration - rt.epoch.get();
        let power = qa_power_for_weight(
            self.sector_size,
            duration,
            &pc.deal_weight,
            &pc.verified_deal_weight,
        );
        initial_pledge_for_power(
            &power,
            &self.network.baseline,
            &self.network.reward_smoothed,
            &self.network.qa_power_smoothed,
            &rt.circulating_supply.borrow(),
        )
    }

    pub fn confirm_sector_proofs_valid(
        &self,
        rt: &MockRuntime,
        cfg: ProveCommitConfig,
        pcs: &[SectorPreCommitOnChainInfo],
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(STORAGE_POWER_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
        self.expect_query_network_info(rt);

        let mut expected_pledge = TokenAmount::zero();
        for pc in pcs {
            if !pc.info.deal_ids.is_empty() {
                let exit_code = cfg
                    .activation_failures
                    .get(&pc.info.sector_number)
                    .copied()
                    .unwrap_or(ExitCode::OK);
                let params = ActivateDealsParams {
                    deal_ids: pc.info.deal_ids.clone(),
                    sector_expiry: pc.info.expiration,
                };
                rt.expect_send(
                    STORAGE_MARKET_ACTOR_ADDR,
                    ACTIVATE_DEALS_METHOD,
                    IpldBlock::serialize_cbor(&params).unwrap(),
                    TokenAmount::zero(),
                    None,
                    exit_code,
                );
                if exit_code != ExitCode::OK {
                    continue;
                }
            }
            expected_pledge += self.expected_initial_pledge(rt, pc);
        }
        self.expect_update_pledge(rt, &expected_pledge);

        let params = ConfirmSectorProofsParams {
            sectors: pcs.iter().map(|pc| pc.info.sector_number).collect(),
        };
        rt.call::<Actor>(
            Method::ConfirmSectorProofsValid as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
    }

    pub fn prove_commit_sector_and_confirm(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
        params: ProveCommitSectorParams,
        cfg: ProveCommitConfig,
    ) -> SectorOnChainInfo {
        let sector_number = params.sector_number;
        self.prove_commit_sector(rt, pc, params).unwrap();
        rt.verify();

        self.confirm_sector_proofs_valid(rt, cfg, std::slice::from_ref(pc)).unwrap();
        rt.verify();

        self.get_sector(rt, sector_number)
    }

    /// Pre-commits, proves and confirms `num_sectors` committed-capacity sectors, advancing
    /// the chain (with cron) far enough for the interactive challenge.
    pub fn commit_and_prove_sectors(
        &mut self,
        rt: &MockRuntime,
        num_sectors: usize,
        lifetime_periods: u64,
        first: bool,
    ) -> Vec<SectorOnChainInfo> {
        let precommit_epoch = rt.epoch.get();
        let expiration = self.sector_expiration(rt, lifetime_periods);

        let mut precommits = Vec::with_capacity(num_sectors);
        for i in 0..num_sectors {
            let params = self.make_pre_commit_params(
                self.next_sector_no,
                precommit_epoch - 1,
                expiration,
                vec![],
            );
            precommits.push(self.pre_commit_sector(
                rt,
                params,
                PreCommitConfig::default(),
                first && i == 0,
            ));
            self.next_sector_no += 1;
        }

        self.advance_to_epoch_with_cron(
            rt,
            precommit_epoch + rt.policy.pre_commit_challenge_delay + 1,
        );

        let sectors = precommits
            .iter()
            .map(|pc| {
                self.prove_commit_sector_and_confirm(
                    rt,
                    pc,
                    self.make_prove_commit_params(pc.info.sector_number),
                    ProveCommitConfig::default(),
                )
            })
            .collect();
        rt.reset();
        sectors
    }

    /// Commits one sector, submits its first PoSt and runs the cron that closes its deadline.
    /// Returns the sector, the deadline it was proven at and its partition.
    pub fn commit_and_activate_sector(
        &mut self,
        rt: &MockRuntime,
    ) -> (SectorOnChainInfo, DeadlineInfo, u64) {
        let sector = self.commit_and_prove_sectors(rt, 1, DEFAULT_SECTOR_EXPIRATION, true).remove(0);
        let (dl_idx, p_idx) = self.find_sector(rt, sector.sector_number);
        let dl_info = self.advance_to_deadline(rt, dl_idx);

        let power = self.power_pair_for_sectors(std::slice::from_ref(&sector));
        self.submit_window_post(
            rt,
            &dl_info,
            vec![post_partition(p_idx)],
            vec![sector.clone()],
            PoStConfig::with_expected_power_delta(&power),
        );
        self.advance_deadline(rt, CronConfig::default());
        (sector, dl_info, p_idx)
    }

    pub fn advance_to_epoch_with_cron(&self, rt: &MockRuntime, epoch: ChainEpoch) {
        let mut deadline = self.get_deadline_info(rt);
        while deadline.last() < epoch {
            self.advance_deadline(rt, CronConfig::default());
            deadline = self.get_deadline_info(rt);
        }
        rt.set_epoch(epoch);
    }

    pub fn advance_to_deadline(&self, rt: &MockRuntime, deadline_idx: u64) -> DeadlineInfo {
        let mut dl_info = self.get_deadline_info(rt);
        while dl_info.index != deadline_idx {
            dl_info = self.advance_deadline(rt, CronConfig::default());
        }
        dl_info
    }

    /// Runs the deadline cron at the end of the current deadline, if it is enrolled, and moves
    /// the epoch to the opening of the next deadline.
    pub fn advance_deadline(&self, rt: &MockRuntime, mut cfg: CronConfig) -> DeadlineInfo {
        let state = self.get_state(rt);
        let deadline = state.deadline_info(&rt.policy, rt.epoch.get());

        if state.deadline_cron_active {
            rt.set_epoch(deadline.last());
            cfg.expected_enrollment = deadline.last() + rt.policy.wpost_challenge_window;
            self.on_deadline_cron(rt, cfg);
        }
        rt.set_epoch(deadline.next_open());

        self.get_deadline_info(rt)
    }

    pub fn on_deadline_cron(&self, rt: &MockRuntime, cfg: CronConfig) {
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
        self.expect_query_network_info(rt);

        if let Some(delta) = &cfg.power_delta {
            self.expect_update_power(rt, delta);
        }
        self.expect_burn(rt, &cfg.burnt_funds);
        self.expect_update_pledge(rt, &cfg.pledge_delta);
        if !cfg.no_enrollment {
            self.expect_enroll_cron(rt, cfg.expected_enrollment);
        }

        let params = DeferredCronEventParams {
            event_payload: fvm_ipld_encoding::to_vec(&CronEventPayload {
                event_type: CRON_EVENT_PROVING_DEADLINE,
            })
            .unwrap(),
        };
        rt.set_caller(STORAGE_POWER_ACTOR_ADDR);
        rt.call::<Actor>(
            Method::OnDeferredCronEvent as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
        .unwrap();
        rt.verify();
    }

    pub fn make_post_params(
        &self,
        deadline: &DeadlineInfo,
        partitions: Vec<PoStPartition>,
    ) -> SubmitWindowedPoStParams {
        SubmitWindowedPoStParams {
            deadline: deadline.index,
            partitions,
            proofs: make_post_proofs(self.window_post_proof_type),
            chain_commit_epoch: deadline.challenge,
            chain_commit_rand: chain_commit_rand(deadline.challenge),
        }
    }

    pub fn submit_window_post(
        &self,
        rt: &MockRuntime,
        deadline: &DeadlineInfo,
        partitions: Vec<PoStPartition>,
        infos: Vec<SectorOnChainInfo>,
        cfg: PoStConfig,
    ) {
        let params = self.make_post_params(deadline, partitions);
        self.submit_window_post_raw(rt, deadline, infos, params, cfg).unwrap();
        rt.verify();
    }

    /// Submits a PoSt, expecting proof verification only when it recovers faulty power.
    pub fn submit_window_post_raw(
        &self,
        rt: &MockRuntime,
        deadline: &DeadlineInfo,
        infos: Vec<SectorOnChainInfo>,
        params: SubmitWindowedPoStParams,
        cfg: PoStConfig,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let mut all_ignored = BitField::new();
        let mut all_recovered = BitField::new();
        let dln = self.get_deadline(rt, deadline.index);
        for p in &params.partitions {
            if let Ok(partition) = dln.load_partition(&rt.store, p.index) {
                let expected_faults = &partition.faults - &partition.recoveries;
                all_ignored |= &(&expected_faults | &p.skipped);
                all_ignored |= &partition.terminated;
                all_recovered |= &(&partition.recoveries - &p.skipped);
            }
        }

        if !all_recovered.is_empty() {
            if let Some(good_info) = infos.iter().find(|s| !all_ignored.get(s.sector_number)) {
                let challenge_rand = self.challenge_randomness(deadline.challenge);
                let vi = self.make_window_post_verify_info(
                    &infos,
                    &all_ignored,
                    good_info,
                    challenge_rand,
                    params.proofs.clone(),
                );
                rt.expect_verify_post(vi, cfg.verification_exit.unwrap_or(ExitCode::OK));
            }
        }

        if let Some(delta) = &cfg.expected_power_delta {
            self.expect_update_power(rt, delta);
        }

        rt.call::<Actor>(
            Method::SubmitWindowedPoSt as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
    }

    fn challenge_randomness(&self, challenge: ChainEpoch) -> Randomness {
        let entropy = fvm_ipld_encoding::to_vec(&self.receiver).unwrap();
        Randomness(
            mock_randomness(
                b"beacon",
                DomainSeparationTag::WindowedPoStChallengeSeed,
                challenge,
                &entropy,
            )
            .to_vec(),
        )
    }

    fn make_window_post_verify_info(
        &self,
        infos: &[SectorOnChainInfo],
        all_ignored: &BitField,
        good_info: &SectorOnChainInfo,
        randomness: Randomness,
        proofs: Vec<PoStProof>,
    ) -> WindowPoStVerifyInfo {
        let challenged_sectors = infos
            .iter()
            .map(|ci| {
                let si = if all_ignored.get(ci.sector_number) { good_info } else { ci };
                SectorInfo {
                    proof: si.seal_proof,
                    sector_number: si.sector_number,
                    sealed_cid: si.sealed_cid,
                }
            })
            .collect();

        WindowPoStVerifyInfo { randomness, proofs, challenged_sectors, prover: RECEIVER_ID }
    }

    /// Disputes the `proof_index`-th proof recorded for `deadline`. `expect_success` set
    /// means the proof is found invalid.
    pub fn dispute_window_post(
        &self,
        rt: &MockRuntime,
        deadline: &DeadlineInfo,
        proof_index: u64,
        infos: &[SectorOnChainInfo],
        expect_success: Option<PoStDisputeResult>,
    ) {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_any();
        self.expect_query_network_info(rt);

        let dln = self.get_deadline(rt, deadline.index);
        let post = self.get_submitted_proof(rt, &dln, proof_index);

        let mut all_ignored = BitField::new();
        for idx in post.partitions.iter() {
            let partition = dln.load_partition_snapshot(&rt.store, idx).unwrap();
            all_ignored |= &partition.faults;
            all_ignored |= &partition.terminated;
            all_ignored |= &partition.unproven;
        }

        let good_info = infos.iter().find(|s| !all_ignored.get(s.sector_number)).unwrap();
        let vi = self.make_window_post_verify_info(
            infos,
            &all_ignored,
            good_info,
            self.challenge_randomness(deadline.challenge),
            post.proofs,
        );
        let verify_result = match expect_success {
            Some(_) => ExitCode::USR_ILLEGAL_ARGUMENT,
            None => ExitCode::OK,
        };
        rt.expect_verify_post(vi, verify_result);

        if let Some(result) = &expect_success {
            if let Some(delta) = &result.expected_power_delta {
                self.expect_update_power(rt, delta);
            }
            if let Some(reward) = &result.expected_reward {
                rt.expect_send(self.worker, METHOD_SEND, None, reward.clone(), None, ExitCode::OK);
            }
            if let Some(penalty) = &result.expected_penalty {
                self.expect_burn(rt, penalty);
            }
        }

        let params = DisputeWindowedPoStParams { deadline: deadline.index, post_index: proof_index };
        let result = rt.call::<Actor>(
            Method::DisputeWindowedPoSt as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if expect_success.is_some() {
            result.unwrap();
        } else {
            expect_abort_contains_message(
                ExitCode::USR_ILLEGAL_ARGUMENT,
                "failed to dispute valid post",
                result,
            );
        }
        rt.verify();
    }

    /// The penalty and reporter reward for a successful dispute of `disputed` power, with an
    /// unlocked balance large enough to pay both.
    pub fn dispute_result(&self, disputed: &PowerPair) -> PoStDisputeResult {
        let reward = reward_for_disputed_window_post();
        let penalty = pledge_penalty_for_invalid_windowpost(
            &self.network.reward_smoothed,
            &self.network.qa_power_smoothed,
            &disputed.qa,
        );
        PoStDisputeResult {
            expected_power_delta: Some(-disputed),
            expected_penalty: Some(penalty),
            expected_reward: Some(reward),
        }
    }

    pub fn get_submitted_proof(
        &self,
        rt: &MockRuntime,
        deadline: &Deadline,
        proof_index: u64,
    ) -> WindowedPoSt {
        Array::<_, WindowedPoSt>::load(
            &rt.store,
            &deadline.optimistic_post_submissions_snapshot,
            "proofs",
        )
        .unwrap()
        .get(proof_index)
        .unwrap()
        .cloned()
        .unwrap()
    }

    pub fn declare_faults(
        &self,
        rt: &MockRuntime,
        fault_sector_infos: &[SectorOnChainInfo],
    ) -> PowerPair {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let faults = self
            .sectors_by_location(rt, fault_sector_infos)
            .into_iter()
            .map(|((deadline, partition), sectors)| FaultDeclaration {
                deadline,
                partition,
                sectors,
            })
            .collect();

        let expected_delta = -self.power_pair_for_sectors(fault_sector_infos);
        self.expect_update_power(rt, &expected_delta);

        rt.call::<Actor>(
            Method::DeclareFaults as u64,
            IpldBlock::serialize_cbor(&DeclareFaultsParams { faults }).unwrap(),
        )
        .unwrap();
        rt.verify();
        expected_delta
    }

    pub fn declare_recoveries_raw(
        &self,
        rt: &MockRuntime,
        deadline: u64,
        partition: u64,
        sectors: BitField,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let params = DeclareFaultsRecoveredParams {
            recoveries: vec![RecoveryDeclaration { deadline, partition, sectors }],
        };
        rt.call::<Actor>(
            Method::DeclareFaultsRecovered as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
    }

    pub fn declare_recoveries(
        &self,
        rt: &MockRuntime,
        deadline: u64,
        partition: u64,
        sectors: BitField,
    ) {
        self.declare_recoveries_raw(rt, deadline, partition, sectors).unwrap();
        rt.verify();
    }

    pub fn compact_partitions(
        &self,
        rt: &MockRuntime,
        deadline: u64,
        partitions: BitField,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());
        rt.call::<Actor>(
            Method::CompactPartitions as u64,
            IpldBlock::serialize_cbor(&CompactPartitionsParams { deadline, partitions }).unwrap(),
        )
    }

    fn sectors_by_location(
        &self,
        rt: &MockRuntime,
        sectors: &[SectorOnChainInfo],
    ) -> BTreeMap<(u64, u64), BitField> {
        let mut by_location = BTreeMap::<(u64, u64), BitField>::new();
        for sector in sectors {
            let location = self.find_sector(rt, sector.sector_number);
            by_location.entry(location).or_default().set(sector.sector_number);
        }
        by_location
    }
}

#[derive(Default)]
pub struct PreCommitConfig {
    pub deal_weights: VerifyDealsForActivationReturn,
}

#[derive(Default)]
pub struct ProveCommitConfig {
    /// Exit codes returned by the market when activating the deals of these sectors.
    pub activation_failures: BTreeMap<SectorNumber, ExitCode>,
}

#[derive(Default)]
pub struct PoStConfig {
    pub expected_power_delta: Option<PowerPair>,
    pub verification_exit: Option<ExitCode>,
}

impl PoStConfig {
    pub fn with_expected_power_delta(delta: &PowerPair) -> PoStConfig {
        PoStConfig { expected_power_delta: Some(delta.clone()), verification_exit: None }
    }
}

#[derive(Clone)]
pub struct PoStDisputeResult {
    pub expected_power_delta: Option<PowerPair>,
    pub expected_penalty: Option<TokenAmount>,
    pub expected_reward: Option<TokenAmount>,
}

#[derive(Default)]
pub struct CronConfig {
    pub no_enrollment: bool,
    /// Filled in by `advance_deadline`.
    pub expected_enrollment: ChainEpoch,
    pub power_delta: Option<PowerPair>,
    pub burnt_funds: TokenAmount,
    pub pledge_delta: TokenAmount,
}

/// A hasher whose digest makes the proving period offset come out as `offset`.
pub fn fixed_hasher(offset: ChainEpoch) -> Box<dyn Fn(&[u8]) -> [u8; 32]> {
    Box::new(move |_: &[u8]| {
        let mut result = [0u8; 32];
        result[..8].copy_from_slice(&(offset as u64).to_be_bytes());
        result
    })
}

pub fn make_post_proofs(proof_type: RegisteredPoStProof) -> Vec<PoStProof> {
    vec![PoStProof { post_proof: proof_type, proof_bytes: b"proof1".to_vec() }]
}

pub fn chain_commit_rand(epoch: ChainEpoch) -> Randomness {
    Randomness(mock_randomness(b"tickets", DomainSeparationTag::PoStChainCommit, epoch, &[]).to_vec())
}

pub fn make_bitfield(bits: &[u64]) -> BitField {
    BitField::try_from_bits(bits.iter().copied()).unwrap()
}

pub fn sector_numbers(sectors: &[SectorOnChainInfo]) -> Vec<SectorNumber> {
    sectors.iter().map(|s| s.sector_number).collect()
}

pub fn post_partition(index: u64) -> PoStPartition {
    PoStPartition { index, skipped: BitField::new() }
}

pub fn unused_cid() -> Cid {
    make_sealed_cid(b"unused")
}
