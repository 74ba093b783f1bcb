// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::iter;
use std::ops::Neg;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use cid::multihash::Code::Blake2b256;
use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::{from_slice, CborStore, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::{Randomness, RANDOMNESS_LENGTH};
use fvm_shared::sector::{
    AggregateSealVerifyInfo, AggregateSealVerifyProofAndInfos, PoStProof,
    RegisteredAggregateProof, RegisteredSealProof, SealVerifyInfo, SectorID, SectorInfo,
    WindowPoStVerifyInfo, MAX_SECTOR_NUMBER,
};
use fvm_shared::{ActorID, MethodNum, METHOD_CONSTRUCTOR, METHOD_SEND};
use log::{error, info, warn};
use num_derive::FromPrimitive;
use num_traits::Zero;

pub use bitfield_queue::*;
pub use deadline_assignment::*;
pub use deadline_info::*;
pub use deadline_state::*;
pub use deadlines::*;
use fil_miner_runtime::reward::ThisEpochRewardReturn;
use fil_miner_runtime::runtime::{ActorCode, DomainSeparationTag, Policy, Runtime};
use fil_miner_runtime::{
    actor_dispatch, actor_error, deserialize_block, extract_send_result, ActorContext,
    ActorError, AsActorError, BURNT_FUNDS_ACTOR_ADDR, INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR,
    STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};
pub use monies::*;
pub use partition_state::*;
pub use policy::*;
pub use quantize::*;
pub use sector_map::*;
pub use sectors::*;
pub use state::*;
pub use types::*;

mod bitfield_queue;
mod deadline_assignment;
mod deadline_info;
mod deadline_state;
mod deadlines;
#[doc(hidden)]
pub mod ext;
mod monies;
mod partition_state;
mod policy;
mod quantize;
mod sector_map;
mod sectors;
mod state;
pub mod testing;
mod types;

/// Storage Miner actor methods available
#[derive(FromPrimitive)]
#[repr(u64)]
pub enum Method {
    Constructor = METHOD_CONSTRUCTOR,
    SubmitWindowedPoSt = 5,
    PreCommitSector = 6,
    ProveCommitSector = 7,
    DeclareFaults = 10,
    DeclareFaultsRecovered = 11,
    OnDeferredCronEvent = 12,
    ConfirmSectorProofsValid = 17,
    CompactPartitions = 19,
    DisputeWindowedPoSt = 24,
    PreCommitSectorBatch = 25,
    ProveCommitAggregate = 26,
}

pub const ERR_BALANCE_INVARIANTS_BROKEN: ExitCode = ExitCode::new(1000);

/// Largest seal proof accepted by ProveCommitSector, in bytes.
pub const MAX_PROVE_COMMIT_SIZE: usize = 1024;

/// Miner Actor
pub struct Actor;

impl Actor {
    pub fn constructor(
        rt: &impl Runtime,
        params: MinerConstructorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(iter::once(&INIT_ACTOR_ADDR))?;

        validate_miner_params(rt.policy(), &params)?;

        let owner = resolve_as_id(rt, &params.owner, "owner")?;
        let worker = resolve_as_id(rt, &params.worker, "worker")?;
        let control_addresses = params
            .control_addresses
            .iter()
            .map(|address| resolve_as_id(rt, address, "control"))
            .collect::<Result<Vec<_>, _>>()?;

        let policy = rt.policy();
        let current_epoch = rt.curr_epoch();
        let blake2b = |b: &[u8]| rt.hash_blake2b(b);
        let offset =
            assign_proving_period_offset(policy, rt.message().receiver(), current_epoch, blake2b)
                .map_err(|e| e.wrap("failed to assign proving period offset"))?;

        let period_start = current_proving_period_start(policy, current_epoch, offset);
        if period_start > current_epoch {
            return Err(actor_error!(
                illegal_state,
                "computed proving period start {} after current epoch {}",
                period_start,
                current_epoch
            ));
        }

        let deadline_idx = current_deadline_index(policy, current_epoch, period_start);
        if deadline_idx >= policy.wpost_period_deadlines {
            return Err(actor_error!(
                illegal_state,
                "computed proving deadline index {} invalid",
                deadline_idx
            ));
        }

        let info = MinerInfo::new(
            owner,
            worker,
            control_addresses,
            params.peer_id,
            params.multi_addresses,
            params.window_post_proof_type,
        )?;
        let info_cid = rt
            .store()
            .put_cbor(&info, Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store miner info")?;

        let st = State::new(policy, rt.store(), info_cid, period_start, deadline_idx)
            .context("failed to construct state")?;
        rt.create(&st)?;

        Ok(())
    }

    /// Invoked by miner's worker address to submit their fallback post
    fn submit_windowed_post(
        rt: &impl Runtime,
        mut params: SubmitWindowedPoStParams,
    ) -> Result<(), ActorError> {
        let current_epoch = rt.curr_epoch();

        check_post_params(rt.policy(), &params)?;

        let post_result = rt.transaction(|state: &mut State, rt| {
            let info = state.get_info(rt.store())?;

            rt.validate_immediate_caller_is(info.controlling_addresses().iter())?;

            check_post_against_info(rt.policy(), &info, &params)?;

            let current_deadline = state.deadline_info(rt.policy(), current_epoch);
            check_post_timing(&current_deadline, &params, current_epoch)?;

            let comm_rand = rt.get_randomness_from_tickets(
                DomainSeparationTag::PoStChainCommit,
                params.chain_commit_epoch,
                &[],
            )?;
            if Randomness(comm_rand.into()) != params.chain_commit_rand {
                return Err(actor_error!(illegal_argument, "post commit randomness mismatched"));
            }

            let sectors =
                Sectors::load(rt.store(), &state.sectors).context("failed to load sectors")?;

            let mut deadlines =
                state.load_deadlines(rt.store()).map_err(|e| e.wrap("failed to load deadlines"))?;

            let mut deadline = deadlines.load_deadline(rt.store(), params.deadline)?;

            // The proof itself is not checked here unless power is being recovered. It is kept
            // in the deadline for optimistic acceptance, where anyone may dispute it.
            let policy = rt.policy();
            let fault_expiration = current_deadline.last() + policy.fault_max_age;
            let post_result = deadline
                .record_proven_sectors(
                    rt.store(),
                    &sectors,
                    info.sector_size,
                    current_deadline.quant_spec(),
                    fault_expiration,
                    &mut params.partitions,
                )
                .with_context(|| {
                    format!("failed to process post submission for deadline {}", params.deadline)
                })?;

            let proven_sectors = &post_result.sectors - &post_result.ignored_sectors;
            if proven_sectors.is_empty() {
                return Err(actor_error!(
                    illegal_argument,
                    "cannot prove partitions with no active sectors"
                ));
            }

            if post_result.recovered_power.is_zero() {
                deadline
                    .record_post_proofs(rt.store(), &post_result.partitions, &params.proofs)
                    .context("failed to record proof for optimistic verification")?;
            } else {
                // Faulty sectors are substituted with a known-good one from the same proof.
                let sector_infos = sectors
                    .load_for_proof(&post_result.sectors, &post_result.ignored_sectors)
                    .context("failed to load sectors for post verification")?;
                if !verify_windowed_post(
                    rt,
                    current_deadline.challenge,
                    &sector_infos,
                    params.proofs,
                )
                .map_err(|e| e.wrap("window post failed"))?
                {
                    return Err(actor_error!(illegal_argument, "invalid post was submitted"));
                }
            }

            deadlines
                .update_deadline(policy, rt.store(), params.deadline, &deadline)
                .with_context(|| format!("failed to update deadline {}", params.deadline))?;

            state.save_deadlines(rt.store(), deadlines)?;

            Ok(post_result)
        })?;

        // Restores power for recovered sectors, removes it for skipped ones and grants it
        // to sectors proven for the first time.
        update_claimed_power(rt, post_result.power_delta)?;

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

        Ok(())
    }

    fn dispute_windowed_post(
        rt: &impl Runtime,
        params: DisputeWindowedPoStParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let reporter = rt.message().caller();

        check_deadline_index(rt.policy(), params.deadline)?;
        let current_epoch = rt.curr_epoch();

        // Estimates only: the network has moved on since the PoSt was submitted.
        let (epoch_reward, power_total) = query_network(rt)?;

        let (mut to_burn, power_delta, to_reward) = rt.transaction(|st: &mut State, rt| {
            let policy = rt.policy();
            let dl_info = st.deadline_info(policy, current_epoch);

            if !deadline_available_for_optimistic_post_dispute(
                policy,
                dl_info.period_start,
                params.deadline,
                current_epoch,
            ) {
                return Err(actor_error!(
                    forbidden,
                    "can only dispute window posts during the dispute window \
                    ({} epochs after the challenge window closes)",
                    policy.wpost_dispute_window
                ));
            }

            let info = st.get_info(rt.store())?;

            let target_deadline = nearest_occured_deadline_info(policy, &dl_info, params.deadline);

            let mut deadlines =
                st.load_deadlines(rt.store()).map_err(|e| e.wrap("failed to load deadlines"))?;
            let mut deadline = deadlines.load_deadline(rt.store(), params.deadline)?;

            // Removes the proof from the snapshot so it cannot be disputed twice.
            let (partitions, proofs) = deadline
                .take_post_proofs(rt.store(), params.post_index)
                .context("failed to load proof for dispute")?;

            let mut dispute_info = deadline
                .load_partitions_for_dispute(rt.store(), partitions)
                .context("failed to load partition for dispute")?;

            // Includes power no longer active, so only usable for the penalty.
            let penalised_power = dispute_info.disputed_power.clone();

            let sectors = Sectors::load(rt.store(), &deadline.sectors_snapshot)
                .context("failed to load sectors array")?;
            let sector_infos = sectors
                .load_for_proof(&dispute_info.all_sector_nos, &dispute_info.ignored_sector_nos)
                .context("failed to load sectors to dispute window post")?;

            if verify_windowed_post(rt, target_deadline.challenge, &sector_infos, proofs)? {
                return Err(actor_error!(illegal_argument, "failed to dispute valid post"));
            }
            info!("successfully disputed post, window post was invalid");

            // Compaction is blocked while disputes are possible, so the sectors are still
            // where the proof left them. Terminated ones are skipped.
            let fault_expiration_epoch = target_deadline.last() + policy.fault_max_age;
            let power_delta = deadline
                .record_faults(
                    rt.store(),
                    &sectors,
                    info.sector_size,
                    quant_spec_for_deadline(policy, &target_deadline),
                    fault_expiration_epoch,
                    &mut dispute_info.disputed_sectors,
                )
                .context("failed to declare faults")?;

            deadlines
                .update_deadline(policy, rt.store(), params.deadline, &deadline)
                .with_context(|| format!("failed to update deadline {}", params.deadline))?;
            st.save_deadlines(rt.store(), deadlines)?;

            let penalty_base = pledge_penalty_for_invalid_windowpost(
                &epoch_reward.this_epoch_reward_smoothed,
                &power_total.quality_adj_power_smoothed,
                &penalised_power.qa,
            );
            let reward_target = reward_for_disputed_window_post();

            // The reporter reward is paid on top of the base penalty.
            let penalty_target = &penalty_base + &reward_target;
            st.apply_penalty(&penalty_target)?;
            let to_burn = st.repay_partial_debt(&rt.current_balance())?;

            let to_reward = std::cmp::min(&to_burn, &reward_target).clone();
            let to_burn = &to_burn - &to_reward;

            Ok((to_burn, power_delta, to_reward))
        })?;

        update_claimed_power(rt, power_delta)?;
        if !to_reward.is_zero() {
            if let Err(e) =
                extract_send_result(rt.send(&reporter, METHOD_SEND, None, to_reward.clone()))
            {
                error!("failed to send reward: {}", e);
                to_burn += to_reward;
            }
        }

        burn_funds(rt, to_burn)?;

        let st: State = rt.state()?;
        st.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    /// Pledges to seal and commit a single sector.
    fn pre_commit_sector(
        rt: &impl Runtime,
        precommit: PreCommitSectorParams,
    ) -> Result<(), ActorError> {
        Self::pre_commit_sector_batch(rt, PreCommitSectorBatchParams { sectors: vec![precommit] })
    }

    /// Pledges to seal and commit a batch of sectors. Batches of more than one sector pay an
    /// aggregation fee on top of their deposits.
    fn pre_commit_sector_batch(
        rt: &impl Runtime,
        params: PreCommitSectorBatchParams,
    ) -> Result<(), ActorError> {
        let curr_epoch = rt.curr_epoch();
        {
            let st: State = rt.state()?;
            let info = st.get_info(rt.store())?;
            rt.validate_immediate_caller_is(info.controlling_addresses().iter())?;
        }

        {
            let policy = rt.policy();
            if params.sectors.is_empty() {
                return Err(actor_error!(illegal_argument, "batch empty"));
            }
            if params.sectors.len() > policy.pre_commit_sector_batch_max_size {
                return Err(actor_error!(
                    illegal_argument,
                    "batch of {} too large, max {}",
                    params.sectors.len(),
                    policy.pre_commit_sector_batch_max_size
                ));
            }

            let mut seen = BitField::new();
            for precommit in &params.sectors {
                if seen.get(precommit.sector_number) {
                    return Err(actor_error!(
                        illegal_argument,
                        "duplicate sector number {}",
                        precommit.sector_number
                    ));
                }
                seen.set(precommit.sector_number);
                validate_pre_commit(policy, curr_epoch, precommit)?;
            }
        }

        let (reward_stats, power_total) = query_network(rt)?;

        let mut deal_weights = Vec::with_capacity(params.sectors.len());
        for precommit in &params.sectors {
            deal_weights.push(if precommit.deal_ids.is_empty() {
                ext::market::VerifyDealsForActivationReturn::default()
            } else {
                verify_deals_for_activation(rt, precommit, curr_epoch)?
            });
        }

        let aggregate_fee = if params.sectors.len() > 1 {
            aggregate_pre_commit_network_fee(params.sectors.len() as i64, &rt.base_fee())
        } else {
            TokenAmount::zero()
        };

        let (fee_to_burn, needs_cron, dl_info) = rt.transaction(|state: &mut State, rt| {
            let policy = rt.policy();
            let store = rt.store();
            let info = state.get_info(store)?;
            let deal_count_max = sector_deals_max(policy, info.sector_size);

            let mut total_deposit = TokenAmount::zero();
            let mut chain_infos = Vec::with_capacity(params.sectors.len());
            let mut clean_ups = Vec::with_capacity(params.sectors.len());
            for (precommit, weights) in params.sectors.iter().zip(deal_weights) {
                // Compared by sector size: V1 and V1_1 seal proofs share a window PoSt size.
                let seal_sector_size = precommit.seal_proof.sector_size().map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "invalid seal proof {:?}: {}",
                        precommit.seal_proof,
                        e
                    )
                })?;
                if seal_sector_size != info.sector_size {
                    return Err(actor_error!(
                        illegal_argument,
                        "sector seal proof {:?} must match miner window post proof type {:?}",
                        precommit.seal_proof,
                        info.window_post_proof_type
                    ));
                }
                if precommit.deal_ids.len() as u64 > deal_count_max {
                    return Err(actor_error!(
                        illegal_argument,
                        "too many deals for sector {} > {}",
                        precommit.deal_ids.len(),
                        deal_count_max
                    ));
                }

                let sector_weight = qa_power_for_weight(
                    info.sector_size,
                    precommit.expiration - curr_epoch,
                    &weights.deal_weight,
                    &weights.verified_deal_weight,
                );
                let deposit = pre_commit_deposit_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &sector_weight,
                );
                total_deposit += &deposit;

                state.allocate_sector_number(store, precommit.sector_number)?;
                let msd = max_prove_commit_duration(policy, precommit.seal_proof).ok_or_else(|| {
                    actor_error!(illegal_state, "no max seal duration for {:?}", precommit.seal_proof)
                })?;
                clean_ups.push((
                    curr_epoch + msd + policy.expired_pre_commit_clean_up_delay,
                    precommit.sector_number,
                ));
                chain_infos.push(SectorPreCommitOnChainInfo {
                    info: precommit.clone(),
                    pre_commit_deposit: deposit,
                    pre_commit_epoch: curr_epoch,
                    deal_weight: weights.deal_weight,
                    verified_deal_weight: weights.verified_deal_weight,
                });
            }

            // Charged as debt so it is repaid together with anything already owed.
            state.apply_penalty(&aggregate_fee)?;

            // Available balance already nets out the debt.
            let available_balance = state.get_available_balance(&rt.current_balance())?;
            if available_balance < total_deposit {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds for pre-commit deposit: {}, available: {}",
                    total_deposit,
                    available_balance
                ));
            }

            state.add_pre_commit_deposit(&total_deposit)?;
            state.put_precommitted_sectors(store, chain_infos)?;
            state.add_pre_commit_clean_ups(policy, store, clean_ups)?;

            let fee_to_burn = state.repay_partial_debt(&rt.current_balance())?;
            if state.fee_debt.is_positive() {
                return Err(actor_error!(
                    insufficient_funds,
                    "unlocked balance can not repay fee debt ({} remaining)",
                    state.fee_debt
                ));
            }

            let needs_cron = !state.deadline_cron_active;
            state.deadline_cron_active = true;
            Ok((fee_to_burn, needs_cron, state.deadline_info(policy, curr_epoch)))
        })?;

        burn_funds(rt, fee_to_burn)?;

        let st: State = rt.state()?;
        st.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

        if needs_cron {
            enroll_deadline_cron(rt, dl_info.last())?;
        }

        Ok(())
    }

    /// Checks state of the corresponding sector pre-commitment, then schedules the proof to be verified in bulk
    /// by the power actor.
    /// If valid, the power actor will call ConfirmSectorProofsValid at the end of the same epoch as this message.
    fn prove_commit_sector(
        rt: &impl Runtime,
        params: ProveCommitSectorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument, "sector number greater than maximum"));
        }
        if params.proof.len() > MAX_PROVE_COMMIT_SIZE {
            return Err(actor_error!(
                illegal_argument,
                "sector prove-commit proof of size {} exceeds max size of {}",
                params.proof.len(),
                MAX_PROVE_COMMIT_SIZE
            ));
        }

        let sector_number = params.sector_number;
        let curr_epoch = rt.curr_epoch();

        let st: State = rt.state()?;
        let precommit = st
            .get_precommitted_sector(rt.store(), sector_number)
            .with_context(|| format!("failed to load pre-committed sector {}", sector_number))?
            .ok_or_else(|| actor_error!(not_found, "no pre-committed sector {}", sector_number))?;

        let interactive_epoch = validate_prove_commit_timing(rt.policy(), curr_epoch, &precommit)?;
        let seal = seal_challenge(rt, &precommit, interactive_epoch)?;

        let svi = SealVerifyInfo {
            registered_proof: precommit.info.seal_proof,
            sector_id: SectorID { miner: miner_id(rt)?, number: sector_number },
            deal_ids: precommit.info.deal_ids,
            randomness: seal.randomness,
            interactive_randomness: seal.interactive_randomness,
            proof: params.proof,
            sealed_cid: precommit.info.sealed_cid,
            unsealed_cid: seal.unsealed_cid,
        };

        extract_send_result(rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&svi)?,
            TokenAmount::zero(),
        ))?;

        Ok(())
    }

    /// Proves a set of pre-committed sectors with a single aggregated seal proof. The sectors
    /// are activated in this message rather than at the end of the epoch, and an aggregation
    /// fee is burnt.
    fn prove_commit_aggregate(
        rt: &impl Runtime,
        params: ProveCommitAggregateParams,
    ) -> Result<(), ActorError> {
        check_aggregate_bounds(rt.policy(), &params)?;

        let st: State = rt.state()?;
        let store = rt.store();
        let info = st.get_info(store)?;
        rt.validate_immediate_caller_is(info.controlling_addresses().iter())?;

        let mut precommits = Vec::with_capacity(params.sector_numbers.len() as usize);
        for sector_number in params.sector_numbers.iter() {
            let precommit = st
                .get_precommitted_sector(store, sector_number)
                .with_context(|| format!("failed to load pre-committed sector {}", sector_number))?
                .ok_or_else(|| {
                    actor_error!(not_found, "no pre-committed sector {}", sector_number)
                })?;
            precommits.push(precommit);
        }

        let seal_proof = precommits
            .first()
            .map(|p| p.info.seal_proof)
            .ok_or_else(|| actor_error!(illegal_argument, "no sectors to prove"))?;
        let curr_epoch = rt.curr_epoch();
        let mut infos = Vec::with_capacity(precommits.len());
        for precommit in &precommits {
            if precommit.info.seal_proof != seal_proof {
                return Err(actor_error!(
                    illegal_argument,
                    "aggregate mixes seal proofs {:?} and {:?}",
                    seal_proof,
                    precommit.info.seal_proof
                ));
            }
            let interactive_epoch =
                validate_prove_commit_timing(rt.policy(), curr_epoch, precommit)?;
            let seal = seal_challenge(rt, precommit, interactive_epoch)?;
            infos.push(AggregateSealVerifyInfo {
                sector_number: precommit.info.sector_number,
                randomness: seal.randomness,
                interactive_randomness: seal.interactive_randomness,
                sealed_cid: precommit.info.sealed_cid,
                unsealed_cid: seal.unsealed_cid,
            });
        }

        rt.verify_aggregate_seals(&AggregateSealVerifyProofAndInfos {
            miner: miner_id(rt)?,
            seal_proof,
            aggregate_proof: RegisteredAggregateProof::SnarkPackV2,
            proof: params.aggregate_proof,
            infos,
        })
        .map_err(|e| actor_error!(illegal_argument, "aggregate seal verify failed: {}", e))?;

        let fee_sectors = precommits.len() as i64;
        activate_proven_sectors(rt, precommits, &info)?;

        let aggregate_fee = aggregate_prove_commit_network_fee(fee_sectors, &rt.base_fee());
        let st: State = rt.state()?;
        let unlocked_balance = st.get_unlocked_balance(&rt.current_balance())?;
        if unlocked_balance < aggregate_fee {
            return Err(actor_error!(
                insufficient_funds,
                "remaining unlocked funds after prove-commit {} are insufficient to pay aggregation fee of {}",
                unlocked_balance,
                aggregate_fee
            ));
        }
        burn_funds(rt, aggregate_fee)?;

        let st: State = rt.state()?;
        st.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }

    fn confirm_sector_proofs_valid(
        rt: &impl Runtime,
        params: ConfirmSectorProofsParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        // The power actor enforces this limit. It is only logged here.
        if params.sectors.len() > ext::power::MAX_MINER_PROVE_COMMITS_PER_EPOCH {
            warn!(
                "confirmed more prove commits in an epoch than permitted: {} > {}",
                params.sectors.len(),
                ext::power::MAX_MINER_PROVE_COMMITS_PER_EPOCH
            );
        }

        let st: State = rt.state()?;
        let store = rt.store();
        // This skips missing pre-commits.
        let precommitted_sectors = st
            .find_precommitted_sectors(store, &params.sectors)
            .context("failed to load pre-committed sectors")?;
        let info = st.get_info(store)?;

        activate_proven_sectors(rt, precommitted_sectors, &info)
    }

    fn declare_faults(rt: &impl Runtime, params: DeclareFaultsParams) -> Result<(), ActorError> {
        let mut to_process = declared_sector_map(
            rt.policy(),
            "fault",
            params.faults.iter().map(|d| (d.deadline, d.partition, &d.sectors)),
        )?;

        let power_delta = rt.transaction(|state: &mut State, rt| {
            let info = state.get_info(rt.store())?;
            rt.validate_immediate_caller_is(info.controlling_addresses().iter())?;

            let store = rt.store();
            let policy = rt.policy();
            let curr_epoch = rt.curr_epoch();

            let mut deadlines =
                state.load_deadlines(store).map_err(|e| e.wrap("failed to load deadlines"))?;
            let sectors =
                Sectors::load(store, &state.sectors).context("failed to load sectors array")?;

            let mut new_fault_power_total = PowerPair::zero();
            for (deadline_idx, partition_map) in to_process.iter() {
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.current_proving_period_start(policy, curr_epoch),
                    deadline_idx,
                    curr_epoch,
                )
                .map_err(|e| {
                    e.wrap(format!("invalid fault declaration deadline {}", deadline_idx))
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    e.wrap(format!("failed fault declaration at deadline {}", deadline_idx))
                })?;

                let mut deadline = deadlines.load_deadline(store, deadline_idx)?;

                let fault_expiration_epoch = target_deadline.last() + policy.fault_max_age;
                let deadline_power_delta = deadline
                    .record_faults(
                        store,
                        &sectors,
                        info.sector_size,
                        target_deadline.quant_spec(),
                        fault_expiration_epoch,
                        partition_map,
                    )
                    .with_context(|| {
                        format!("failed to declare faults for deadline {}", deadline_idx)
                    })?;

                deadlines
                    .update_deadline(policy, store, deadline_idx, &deadline)
                    .with_context(|| {
                        format!("failed to store deadline {} partitions", deadline_idx)
                    })?;

                new_fault_power_total += &deadline_power_delta;
            }

            state.save_deadlines(store, deadlines)?;

            Ok(new_fault_power_total)
        })?;

        // The fault fee itself is charged by the deadline cron.
        update_claimed_power(rt, power_delta)?;
        Ok(())
    }

    fn declare_faults_recovered(
        rt: &impl Runtime,
        params: DeclareFaultsRecoveredParams,
    ) -> Result<(), ActorError> {
        let mut to_process = declared_sector_map(
            rt.policy(),
            "recovery",
            params.recoveries.iter().map(|d| (d.deadline, d.partition, &d.sectors)),
        )?;

        rt.transaction(|state: &mut State, rt| {
            let info = state.get_info(rt.store())?;
            rt.validate_immediate_caller_is(info.controlling_addresses().iter())?;

            let store = rt.store();
            let policy = rt.policy();
            let curr_epoch = rt.curr_epoch();

            let mut deadlines =
                state.load_deadlines(store).map_err(|e| e.wrap("failed to load deadlines"))?;
            let sectors =
                Sectors::load(store, &state.sectors).context("failed to load sectors array")?;

            for (deadline_idx, partition_map) in to_process.iter() {
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.current_proving_period_start(policy, curr_epoch),
                    deadline_idx,
                    curr_epoch,
                )
                .map_err(|e| {
                    e.wrap(format!("invalid recovery declaration deadline {}", deadline_idx))
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    e.wrap(format!("failed recovery declaration at deadline {}", deadline_idx))
                })?;

                let mut deadline = deadlines.load_deadline(store, deadline_idx)?;
                deadline
                    .declare_faults_recovered(store, &sectors, info.sector_size, partition_map)
                    .with_context(|| {
                        format!("failed to declare recoveries for deadline {}", deadline_idx)
                    })?;

                deadlines
                    .update_deadline(policy, store, deadline_idx, &deadline)
                    .with_context(|| format!("failed to store deadline {}", deadline_idx))?;
            }

            state.save_deadlines(store, deadlines)?;
            Ok(())
        })?;

        // Power is restored by the next successful PoSt for the recovering sectors.
        Ok(())
    }

    /// Rewrites the addressed partitions of a deadline: terminated sectors are dropped from state
    /// and the live ones are packed into new partitions appended to the deadline.
    /// Partitions holding faulty or unproven sectors cannot be compacted.
    fn compact_partitions(
        rt: &impl Runtime,
        params: CompactPartitionsParams,
    ) -> Result<(), ActorError> {
        if params.deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(illegal_argument, "invalid deadline {}", params.deadline));
        }

        let partition_count = params.partitions.len();
        let params_deadline = params.deadline;

        rt.transaction(|state: &mut State, rt| {
            let info = state.get_info(rt.store())?;
            rt.validate_immediate_caller_is(info.controlling_addresses().iter())?;

            let store = rt.store();
            let policy = rt.policy();

            if !deadline_available_for_compaction(
                policy,
                state.current_proving_period_start(policy, rt.curr_epoch()),
                params_deadline,
                rt.curr_epoch(),
            ) {
                return Err(actor_error!(
                    forbidden,
                    "cannot compact deadline {} during its challenge window, \
                    or the prior challenge window, \
                    or before {} epochs have passed since its last challenge window ended",
                    params_deadline,
                    policy.wpost_dispute_window
                ));
            }

            let submission_partition_limit =
                load_partitions_sectors_max(policy, info.window_post_partition_sectors);
            if partition_count > submission_partition_limit {
                return Err(actor_error!(
                    illegal_argument,
                    "too many partitions {}, limit {}",
                    partition_count,
                    submission_partition_limit
                ));
            }

            let quant = state.quant_spec_for_deadline(policy, params_deadline);
            let mut deadlines =
                state.load_deadlines(store).map_err(|e| e.wrap("failed to load deadlines"))?;

            let mut deadline = deadlines.load_deadline(store, params_deadline)?;

            let RemovedPartitions { live, dead, power: removed_power } = deadline
                .remove_partitions(store, &params.partitions, quant)
                .with_context(|| {
                    format!("failed to remove partitions from deadline {}", params_deadline)
                })?;

            state.delete_sectors(store, &dead).context("failed to delete dead sectors")?;

            let sectors =
                state.load_sector_infos(store, &live).context("failed to load moved sectors")?;
            let proven = true;
            let added_power = deadline
                .add_sectors(
                    store,
                    info.window_post_partition_sectors,
                    proven,
                    &sectors,
                    info.sector_size,
                    quant,
                )
                .context("failed to add back moved sectors")?;

            if removed_power != added_power {
                return Err(actor_error!(
                    illegal_state,
                    "power changed when compacting partitions: was {:?}, is now {:?}",
                    removed_power,
                    added_power
                ));
            }

            deadlines
                .update_deadline(policy, store, params_deadline, &deadline)
                .with_context(|| format!("failed to update deadline {}", params_deadline))?;

            state.save_deadlines(store, deadlines)?;

            Ok(())
        })?;

        Ok(())
    }

    fn on_deferred_cron_event(
        rt: &impl Runtime,
        params: DeferredCronEventParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        let payload: CronEventPayload = from_slice(&params.event_payload).map_err(|e| {
            actor_error!(
                illegal_state,
                format!("failed to unmarshal miner cron payload into expected structure: {}", e)
            )
        })?;

        match payload.event_type {
            CRON_EVENT_PROVING_DEADLINE => handle_proving_deadline(rt)?,
            _ => {
                error!("onDeferredCronEvent invalid event type: {}", payload.event_type);
            }
        };

        let state: State = rt.state()?;
        state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;
        Ok(())
    }
}

/// Closes the deadline ending at the current epoch: expires stale pre-commits, detects
/// missed PoSts, pops expirations and charges penalties. Re-enrolls the cron event for
/// the next deadline while the miner has anything left at stake.
fn handle_proving_deadline(rt: &impl Runtime) -> Result<(), ActorError> {
    let curr_epoch = rt.curr_epoch();

    let (reward_stats, power_total) = query_network(rt)?;

    let mut had_early_terminations = false;
    let mut power_delta_total = PowerPair::zero();
    let mut penalty_total = TokenAmount::zero();
    let mut pledge_delta_total = TokenAmount::zero();

    let state: State = rt.transaction(|state: &mut State, rt| {
        let policy = rt.policy();
        let store = rt.store();

        // Whatever this tick clears, one more tick follows it.
        let had_activity = state.continue_deadline_cron();

        let deposit_to_burn = state.cleanup_expired_pre_commits(policy, store, curr_epoch)?;
        if deposit_to_burn.is_positive() {
            log::debug!("forfeiting expired pre-commit deposits {}", deposit_to_burn);
        }
        state.apply_penalty(&deposit_to_burn)?;

        let info = state.get_info(store)?;
        let result = state.advance_deadline(policy, store, curr_epoch)?;

        // Faults detected this tick pay nothing until they persist to the next one.
        let penalty_target = pledge_penalty_for_continued_fault(
            &reward_stats.this_epoch_reward_smoothed,
            &power_total.quality_adj_power_smoothed,
            &result.previously_faulty_power.qa,
        );
        if penalty_target.is_positive() {
            log::debug!("continued fault penalty {}", penalty_target);
        }
        state.apply_penalty(&penalty_target)?;

        for sector in &result.early_terminated {
            had_early_terminations = true;
            let sector_power = qa_power_for_sector(info.sector_size, sector);
            let fault_fee = pledge_penalty_for_continued_fault(
                &reward_stats.this_epoch_reward_smoothed,
                &power_total.quality_adj_power_smoothed,
                &sector_power,
            );
            let termination_fee = pledge_penalty_for_termination(
                &sector.initial_pledge,
                curr_epoch - sector.activation,
                &fault_fee,
            );
            log::debug!(
                "sector {} terminated early, termination fee {}",
                sector.sector_number,
                termination_fee
            );
            state.apply_penalty(&termination_fee)?;
        }

        penalty_total = state.repay_partial_debt(&rt.current_balance())?;
        power_delta_total += &result.power_delta;
        pledge_delta_total += &result.pledge_delta;

        let continue_cron = had_activity || state.continue_deadline_cron();
        if !continue_cron {
            state.deadline_cron_active = false;
        }

        Ok(state.clone())
    })?;

    if had_early_terminations {
        info!("miner {} terminated sectors that stayed faulty too long", rt.message().receiver());
    }

    update_claimed_power(rt, power_delta_total)?;
    burn_funds(rt, penalty_total)?;
    update_pledge_total(rt, &pledge_delta_total)?;

    if state.deadline_cron_active {
        let new_deadline_info = state.deadline_info(rt.policy(), curr_epoch + 1);
        enroll_deadline_cron(rt, new_deadline_info.last())?;
    } else {
        info!("miner {} going inactive, deadline cron discontinued", rt.message().receiver());
    }

    Ok(())
}

/// Activates sectors whose seal proofs were accepted: activates their deals, moves their
/// deposits into initial pledge and assigns them to deadlines. Sectors whose deals fail to
/// activate are left pre-committed.
fn activate_proven_sectors(
    rt: &impl Runtime,
    precommitted_sectors: Vec<SectorPreCommitOnChainInfo>,
    info: &MinerInfo,
) -> Result<(), ActorError> {
    let (reward_stats, power_total) = query_network(rt)?;
    let circulating_supply = rt.total_fil_circ_supply();

    let activation = rt.curr_epoch();
    let mut new_sectors = Vec::<SectorOnChainInfo>::with_capacity(precommitted_sectors.len());
    let mut deposit_to_unlock = TokenAmount::zero();
    let mut new_sector_numbers = Vec::with_capacity(precommitted_sectors.len());
    let mut total_pledge = TokenAmount::zero();

    for pre_commit in precommitted_sectors {
        // Deals that fail to activate (e.g. expired since pre-commit) drop the sector.
        // Its deposit stays locked until the pre-commit expires.
        if !pre_commit.info.deal_ids.is_empty() {
            let res = rt.send(
                &STORAGE_MARKET_ACTOR_ADDR,
                ext::market::ACTIVATE_DEALS_METHOD,
                IpldBlock::serialize_cbor(&ext::market::ActivateDealsParams {
                    deal_ids: pre_commit.info.deal_ids.clone(),
                    sector_expiry: pre_commit.info.expiration,
                })?,
                TokenAmount::zero(),
            );
            if let Err(e) = extract_send_result(res) {
                info!(
                    "failed to activate deals on sector {}, dropping from prove commit set: {}",
                    pre_commit.info.sector_number,
                    e.msg()
                );
                continue;
            }
        }

        let duration = pre_commit.info.expiration - activation;
        if duration < rt.policy().min_sector_expiration {
            // The pre-commit expiration is validated against the latest possible activation.
            return Err(actor_error!(
                illegal_state,
                "sector {} lifetime {} below minimum {}",
                pre_commit.info.sector_number,
                duration,
                rt.policy().min_sector_expiration
            ));
        }

        let power = qa_power_for_weight(
            info.sector_size,
            duration,
            &pre_commit.deal_weight,
            &pre_commit.verified_deal_weight,
        );
        let initial_pledge = initial_pledge_for_power(
            &power,
            &reward_stats.this_epoch_baseline_power,
            &reward_stats.this_epoch_reward_smoothed,
            &power_total.quality_adj_power_smoothed,
            &circulating_supply,
        );

        deposit_to_unlock += &pre_commit.pre_commit_deposit;
        total_pledge += &initial_pledge;
        new_sector_numbers.push(pre_commit.info.sector_number);

        new_sectors.push(SectorOnChainInfo {
            sector_number: pre_commit.info.sector_number,
            seal_proof: pre_commit.info.seal_proof,
            sealed_cid: pre_commit.info.sealed_cid,
            deal_ids: pre_commit.info.deal_ids,
            activation,
            expiration: pre_commit.info.expiration,
            deal_weight: pre_commit.deal_weight,
            verified_deal_weight: pre_commit.verified_deal_weight,
            initial_pledge,
        });
    }

    if new_sectors.is_empty() {
        return Ok(());
    }

    rt.transaction(|state: &mut State, rt| {
        let policy = rt.policy();
        let store = rt.store();

        state.delete_precommitted_sectors(store, &new_sector_numbers)?;
        state.add_pre_commit_deposit(&deposit_to_unlock.clone().neg())?;

        state.put_sectors(store, new_sectors.clone())?;
        state.assign_sectors_to_deadlines(
            policy,
            store,
            rt.curr_epoch(),
            new_sectors,
            info.window_post_partition_sectors,
            info.sector_size,
        )?;

        // The released deposits count towards the pledge.
        let available_balance = state.get_available_balance(&rt.current_balance())?;
        if available_balance < total_pledge {
            return Err(actor_error!(
                insufficient_funds,
                "insufficient funds for aggregate initial pledge requirement {}, available: {}",
                total_pledge,
                available_balance
            ));
        }

        state.add_initial_pledge(&total_pledge)?;
        Ok(())
    })?;

    update_pledge_total(rt, &total_pledge)?;

    let st: State = rt.state()?;
    st.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

    Ok(())
}

/// Checks a pre-commitment is inside its proving window at `curr_epoch`. Returns the epoch the
/// interactive challenge is drawn at.
fn validate_prove_commit_timing(
    policy: &Policy,
    curr_epoch: ChainEpoch,
    precommit: &SectorPreCommitOnChainInfo,
) -> Result<ChainEpoch, ActorError> {
    let sector_number = precommit.info.sector_number;
    let msd = max_prove_commit_duration(policy, precommit.info.seal_proof).ok_or_else(|| {
        actor_error!(
            illegal_state,
            "no max seal duration for proof type: {:?}",
            precommit.info.seal_proof
        )
    })?;
    let prove_commit_due = precommit.pre_commit_epoch + msd;
    if curr_epoch > prove_commit_due {
        return Err(actor_error!(
            illegal_argument,
            "commitment proof for {} too late at {}, due {}",
            sector_number,
            curr_epoch,
            prove_commit_due
        ));
    }

    let interactive_epoch = precommit.pre_commit_epoch + policy.pre_commit_challenge_delay;
    if curr_epoch <= interactive_epoch {
        return Err(actor_error!(
            forbidden,
            "too early to prove sector {} at {}, must be after {}",
            sector_number,
            curr_epoch,
            interactive_epoch
        ));
    }
    Ok(interactive_epoch)
}

/// Inputs a seal proof is checked against besides the sealed CID.
struct SealChallenge {
    unsealed_cid: Cid,
    randomness: Randomness,
    interactive_randomness: Randomness,
}

fn seal_challenge(
    rt: &impl Runtime,
    precommit: &SectorPreCommitOnChainInfo,
    interactive_epoch: ChainEpoch,
) -> Result<SealChallenge, ActorError> {
    let unsealed_cid =
        compute_unsealed_cid(rt, precommit.info.seal_proof, precommit.info.deal_ids.clone())?;

    let entropy = fvm_ipld_encoding::to_vec(&rt.message().receiver())?;
    let randomness = rt.get_randomness_from_tickets(
        DomainSeparationTag::SealRandomness,
        precommit.info.seal_rand_epoch,
        &entropy,
    )?;
    let interactive_randomness = rt.get_randomness_from_beacon(
        DomainSeparationTag::InteractiveSealChallengeSeed,
        interactive_epoch,
        &entropy,
    )?;

    Ok(SealChallenge {
        unsealed_cid,
        randomness: Randomness(randomness.into()),
        interactive_randomness: Randomness(interactive_randomness.into()),
    })
}

/// Static checks of a pre-commitment that need no state.
fn validate_pre_commit(
    policy: &Policy,
    curr_epoch: ChainEpoch,
    precommit: &SectorPreCommitInfo,
) -> Result<(), ActorError> {
    if !can_pre_commit_seal_proof(policy, precommit.seal_proof) {
        return Err(actor_error!(
            illegal_argument,
            "unsupported seal proof type {:?}",
            precommit.seal_proof
        ));
    }
    if precommit.sector_number > MAX_SECTOR_NUMBER {
        return Err(actor_error!(
            illegal_argument,
            "sector number {} above maximum {}",
            precommit.sector_number,
            MAX_SECTOR_NUMBER
        ));
    }
    if !is_sealed_sector(&precommit.sealed_cid) {
        return Err(actor_error!(illegal_argument, "sealed CID had wrong prefix"));
    }

    let lookback_start = curr_epoch - policy.max_pre_commit_randomness_lookback;
    let rand_epoch = precommit.seal_rand_epoch;
    if rand_epoch >= curr_epoch {
        return Err(actor_error!(
            illegal_argument,
            "seal randomness epoch {} must be before now ({})",
            rand_epoch,
            curr_epoch
        ));
    }
    if rand_epoch < lookback_start {
        return Err(actor_error!(
            illegal_argument,
            "seal randomness epoch {} too old, lookback starts at {}",
            rand_epoch,
            lookback_start
        ));
    }

    let msd = max_prove_commit_duration(policy, precommit.seal_proof).with_context_code(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        || format!("no prove-commit window for {:?}", precommit.seal_proof),
    )?;

    // The sector must outlive the minimum even if proven as late as possible.
    validate_expiration(
        policy,
        curr_epoch,
        curr_epoch + msd,
        precommit.expiration,
        precommit.seal_proof,
    )
}

/// Bounds a sector's lifetime as measured from `activation`, and its expiration as measured
/// from now.
fn validate_expiration(
    policy: &Policy,
    curr_epoch: ChainEpoch,
    activation: ChainEpoch,
    expiration: ChainEpoch,
    seal_proof: RegisteredSealProof,
) -> Result<(), ActorError> {
    if expiration <= activation {
        return Err(actor_error!(
            illegal_argument,
            "expiration {} must be after activation {}",
            expiration,
            activation
        ));
    }

    let lifetime = expiration - activation;
    if lifetime < policy.min_sector_expiration {
        return Err(actor_error!(
            illegal_argument,
            "total sector lifetime {} from {} is below the minimum {}",
            lifetime,
            activation,
            policy.min_sector_expiration
        ));
    }

    let furthest = curr_epoch + policy.max_sector_expiration_extension;
    if expiration > furthest {
        return Err(actor_error!(
            illegal_argument,
            "expiration {} is beyond the furthest allowed {}",
            expiration,
            furthest
        ));
    }

    let max_lifetime = seal_proof_sector_maximum_lifetime(seal_proof).with_context_code(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        || format!("no maximum lifetime for {:?}", seal_proof),
    )?;
    if lifetime > max_lifetime {
        return Err(actor_error!(
            illegal_argument,
            "total sector lifetime {} exceeds {} for {:?}",
            lifetime,
            max_lifetime,
            seal_proof
        ));
    }

    Ok(())
}

/// Constructor parameters checked against the policy before any address is resolved.
fn validate_miner_params(
    policy: &Policy,
    params: &MinerConstructorParams,
) -> Result<(), ActorError> {
    if params.control_addresses.len() > policy.max_control_addresses {
        return Err(actor_error!(
            illegal_argument,
            "{} control addresses given, at most {} allowed",
            params.control_addresses.len(),
            policy.max_control_addresses
        ));
    }

    if params.peer_id.len() > policy.max_peer_id_length {
        return Err(actor_error!(
            illegal_argument,
            "peer ID of {} bytes is longer than {}",
            params.peer_id.len(),
            policy.max_peer_id_length
        ));
    }

    if params.multi_addresses.iter().any(|ma| ma.0.is_empty()) {
        return Err(actor_error!(illegal_argument, "invalid empty multiaddr"));
    }
    let multiaddr_bytes: usize = params.multi_addresses.iter().map(|ma| ma.0.len()).sum();
    if multiaddr_bytes > policy.max_multiaddr_data {
        return Err(actor_error!(
            illegal_argument,
            "{} bytes of multiaddrs exceed the limit of {}",
            multiaddr_bytes,
            policy.max_multiaddr_data
        ));
    }

    if !policy.valid_post_proof_type.contains(params.window_post_proof_type) {
        return Err(actor_error!(
            illegal_argument,
            "proof type {:?} not allowed for new miners",
            params.window_post_proof_type
        ));
    }

    Ok(())
}

/// Sends to a builtin collaborator, naming the request in any failure.
fn send_to(
    rt: &impl Runtime,
    to: &Address,
    method: MethodNum,
    params: Option<IpldBlock>,
    request: &str,
) -> Result<Option<IpldBlock>, ActorError> {
    extract_send_result(rt.send(to, method, params, TokenAmount::zero()))
        .map_err(|e| e.wrap(format!("failed to {}", request)))
}

/// The reward and power actors' current view of the network, in that order.
fn query_network(
    rt: &impl Runtime,
) -> Result<(ThisEpochRewardReturn, ext::power::CurrentTotalPowerReturn), ActorError> {
    let reward = send_to(
        rt,
        &REWARD_ACTOR_ADDR,
        ext::reward::THIS_EPOCH_REWARD_METHOD,
        None,
        "query epoch reward",
    )?;
    let power = send_to(
        rt,
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::CURRENT_TOTAL_POWER_METHOD,
        None,
        "query network power",
    )?;
    Ok((deserialize_block(reward)?, deserialize_block(power)?))
}

fn enroll_deadline_cron(rt: &impl Runtime, event_epoch: ChainEpoch) -> Result<(), ActorError> {
    let payload =
        RawBytes::serialize(CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE })?;
    send_to(
        rt,
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::ENROLL_CRON_EVENT_METHOD,
        IpldBlock::serialize_cbor(&ext::power::EnrollCronEventParams { event_epoch, payload })?,
        "enroll deadline cron",
    )?;
    Ok(())
}

fn update_claimed_power(rt: &impl Runtime, delta: PowerPair) -> Result<(), ActorError> {
    if delta.is_zero() {
        return Ok(());
    }
    let request = format!("update claimed power by {:?}", delta);
    let params = ext::power::UpdateClaimedPowerParams {
        raw_byte_delta: delta.raw,
        quality_adjusted_delta: delta.qa,
    };
    send_to(
        rt,
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::UPDATE_CLAIMED_POWER_METHOD,
        IpldBlock::serialize_cbor(&params)?,
        &request,
    )?;
    Ok(())
}

fn update_pledge_total(rt: &impl Runtime, delta: &TokenAmount) -> Result<(), ActorError> {
    if delta.is_zero() {
        return Ok(());
    }
    send_to(
        rt,
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
        IpldBlock::serialize_cbor(delta)?,
        "update pledge total",
    )?;
    Ok(())
}

fn burn_funds(rt: &impl Runtime, amount: TokenAmount) -> Result<(), ActorError> {
    if !amount.is_positive() {
        return Ok(());
    }
    log::debug!("miner {} burning {}", rt.message().receiver(), amount);
    extract_send_result(rt.send(&BURNT_FUNDS_ACTOR_ADDR, METHOD_SEND, None, amount))
        .map_err(|e| e.wrap("failed to burn funds"))?;
    Ok(())
}

fn verify_deals_for_activation(
    rt: &impl Runtime,
    precommit: &SectorPreCommitInfo,
    sector_start: ChainEpoch,
) -> Result<ext::market::VerifyDealsForActivationReturn, ActorError> {
    let params = ext::market::VerifyDealsForActivationParams {
        deal_ids: precommit.deal_ids.clone(),
        sector_start,
        sector_expiry: precommit.expiration,
    };
    deserialize_block(send_to(
        rt,
        &STORAGE_MARKET_ACTOR_ADDR,
        ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
        IpldBlock::serialize_cbor(&params)?,
        "verify deals for activation",
    )?)
}

/// The unsealed CID committing to a sector's deals, as computed by the market.
fn compute_unsealed_cid(
    rt: &impl Runtime,
    sector_type: RegisteredSealProof,
    deal_ids: Vec<fvm_shared::deal::DealID>,
) -> Result<Cid, ActorError> {
    let params = ext::market::ComputeDataCommitmentParams { deal_ids, sector_type };
    deserialize_block(send_to(
        rt,
        &STORAGE_MARKET_ACTOR_ADDR,
        ext::market::COMPUTE_DATA_COMMITMENT_METHOD,
        IpldBlock::serialize_cbor(&params)?,
        "compute unsealed sector CID",
    )?)
}

/// Checks a window PoSt against the challenge drawn at `challenge_epoch`. Returns whether the
/// verifier accepted it.
fn verify_windowed_post(
    rt: &impl Runtime,
    challenge_epoch: ChainEpoch,
    sectors: &[SectorOnChainInfo],
    proofs: Vec<PoStProof>,
) -> Result<bool, ActorError> {
    let prover = miner_id(rt)?;
    let entropy = fvm_ipld_encoding::to_vec(&rt.message().receiver())?;
    let challenge = rt.get_randomness_from_beacon(
        DomainSeparationTag::WindowedPoStChallengeSeed,
        challenge_epoch,
        &entropy,
    )?;

    let verify_info = WindowPoStVerifyInfo {
        randomness: Randomness(challenge.into()),
        proofs,
        challenged_sectors: sectors
            .iter()
            .map(|s| SectorInfo {
                proof: s.seal_proof,
                sector_number: s.sector_number,
                sealed_cid: s.sealed_cid,
            })
            .collect(),
        prover,
    };
    match rt.verify_post(&verify_info) {
        Ok(()) => Ok(true),
        Err(e) => {
            info!("window post rejected: {}", e);
            Ok(false)
        }
    }
}

fn miner_id(rt: &impl Runtime) -> Result<ActorID, ActorError> {
    let receiver = rt.message().receiver();
    receiver
        .id()
        .map_err(|_| actor_error!(illegal_state, "miner receiver {} is not an ID address", receiver))
}

fn resolve_as_id(rt: &impl Runtime, address: &Address, role: &str) -> Result<Address, ActorError> {
    match rt.resolve_address(address) {
        Some(id) => Ok(Address::new_id(id)),
        None => Err(actor_error!(illegal_argument, "unable to resolve {} address {}", role, address)),
    }
}

/// Derives a miner's proving period offset from its address and the epoch it was created at:
/// the first eight bytes of the digest, big-endian, modulo the proving period.
fn assign_proving_period_offset(
    policy: &Policy,
    addr: Address,
    current_epoch: ChainEpoch,
    blake2b: impl FnOnce(&[u8]) -> [u8; 32],
) -> Result<ChainEpoch, ActorError> {
    let mut seed = fvm_ipld_encoding::to_vec(&addr)?;
    seed.write_i64::<BigEndian>(current_epoch)
        .map_err(|e| actor_error!(serialization, "failed to encode epoch: {}", e))?;

    let digest = blake2b(&seed);
    let offset = BigEndian::read_u64(&digest[..8]) % policy.wpost_proving_period as u64;
    Ok(offset as ChainEpoch)
}

/// The most recent occurrence of a deadline at or before the current one.
fn nearest_occured_deadline_info(
    policy: &Policy,
    current_deadline: &DeadlineInfo,
    target_deadline: u64,
) -> DeadlineInfo {
    let period_start = if target_deadline > current_deadline.index {
        current_deadline.period_start - policy.wpost_proving_period
    } else {
        current_deadline.period_start
    };
    new_deadline_info(policy, period_start, target_deadline, current_deadline.current_epoch)
}

/// The occurrence of a deadline a fault or recovery declaration applies to: this period's
/// if it is still to come or open, the next period's otherwise.
fn declaration_deadline_info(
    policy: &Policy,
    period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> Result<DeadlineInfo, ActorError> {
    if deadline_idx >= policy.wpost_period_deadlines {
        return Err(actor_error!(illegal_argument, "invalid deadline {}", deadline_idx));
    }
    Ok(new_deadline_info(policy, period_start, deadline_idx, current_epoch).next_not_elapsed())
}

/// Bounds an aggregate by sector count and proof size before any state is read.
fn check_aggregate_bounds(
    policy: &Policy,
    params: &ProveCommitAggregateParams,
) -> Result<(), ActorError> {
    let count = params.sector_numbers.len();
    let (min, max) = (policy.min_aggregated_sectors, policy.max_aggregated_sectors);
    if count > max {
        return Err(actor_error!(
            illegal_argument;
            "too many sectors addressed, addressed {} want <= {}",
            count,
            max
        ));
    }
    if count < min {
        return Err(actor_error!(
            illegal_argument;
            "too few sectors addressed, addressed {} want >= {}",
            count,
            min
        ));
    }

    let proof_len = params.aggregate_proof.len();
    if proof_len > policy.max_aggregated_proof_size {
        return Err(actor_error!(
            illegal_argument;
            "sector prove-commit proof of size {} exceeds max size of {}",
            proof_len,
            policy.max_aggregated_proof_size
        ));
    }
    Ok(())
}

fn check_deadline_index(policy: &Policy, deadline: u64) -> Result<(), ActorError> {
    if deadline < policy.wpost_period_deadlines {
        return Ok(());
    }
    Err(actor_error!(
        illegal_argument;
        "invalid deadline {} of {}",
        deadline,
        policy.wpost_period_deadlines
    ))
}

/// Checks a window PoSt submission's shape before any state is read.
fn check_post_params(policy: &Policy, params: &SubmitWindowedPoStParams) -> Result<(), ActorError> {
    let [proof] = params.proofs.as_slice() else {
        return Err(actor_error!(
            illegal_argument;
            "expected exactly one proof, got {}",
            params.proofs.len()
        ));
    };
    if !policy.valid_post_proof_type.contains(proof.post_proof) {
        return Err(actor_error!(illegal_argument; "proof type {:?} not allowed", proof.post_proof));
    }
    check_deadline_index(policy, params.deadline)?;

    let rand_len = params.chain_commit_rand.0.len();
    if rand_len > RANDOMNESS_LENGTH {
        return Err(actor_error!(
            illegal_argument;
            "expected at most {} bytes of randomness, got {}",
            RANDOMNESS_LENGTH,
            rand_len
        ));
    }
    Ok(())
}

/// Checks the submitted proof type and sizes against the miner's registered proof type.
fn check_post_against_info(
    policy: &Policy,
    info: &MinerInfo,
    params: &SubmitWindowedPoStParams,
) -> Result<(), ActorError> {
    let expected = info.window_post_proof_type;
    let proof = &params.proofs[0];
    if proof.post_proof != expected {
        return Err(actor_error!(
            illegal_argument;
            "expected proof of type {:?}, got {:?}",
            expected,
            proof.post_proof
        ));
    }

    let per_partition = expected.proof_size().map_err(|e| {
        actor_error!(illegal_state; "failed to determine max window post proof size: {}", e)
    })?;
    let max_size = per_partition * params.partitions.len();
    if proof.proof_bytes.len() > max_size {
        return Err(actor_error!(
            illegal_argument;
            "expected proof to be smaller than {} bytes",
            max_size
        ));
    }

    let limit = load_partitions_sectors_max(policy, info.window_post_partition_sectors);
    let count = params.partitions.len() as u64;
    if count > limit {
        return Err(actor_error!(
            illegal_argument;
            "too many partitions {}, limit {}",
            count,
            limit
        ));
    }
    Ok(())
}

/// Checks that a submission targets the open deadline with a commitment from its challenge window.
fn check_post_timing(
    current: &DeadlineInfo,
    params: &SubmitWindowedPoStParams,
    epoch: ChainEpoch,
) -> Result<(), ActorError> {
    // Reachable only when cron has not run for this miner.
    if !current.is_open() {
        return Err(actor_error!(
            illegal_state;
            "proving period {} not yet open at {}",
            current.period_start,
            epoch
        ));
    }
    if params.deadline != current.index {
        return Err(actor_error!(
            illegal_argument;
            "invalid deadline {} at epoch {}, expected {}",
            params.deadline,
            epoch,
            current.index
        ));
    }

    let commit = params.chain_commit_epoch;
    if commit < current.challenge {
        return Err(actor_error!(
            illegal_argument;
            "expected chain commit epoch {} to be after {}",
            commit,
            current.challenge
        ));
    }
    if commit >= epoch {
        return Err(actor_error!(
            illegal_argument;
            "chain commit epoch {} must be less than the current epoch {}",
            commit,
            epoch
        ));
    }
    Ok(())
}

/// Groups declared sectors by deadline and partition, within the policy's limits on
/// declarations and on the partitions and sectors one message may address.
fn declared_sector_map<'a>(
    policy: &Policy,
    kind: &str,
    declarations: impl ExactSizeIterator<Item = (u64, u64, &'a BitField)>,
) -> Result<DeadlineSectorMap, ActorError> {
    if declarations.len() as u64 > policy.declarations_max {
        return Err(actor_error!(
            illegal_argument,
            "too many {} declarations for a single message: {} > {}",
            kind,
            declarations.len(),
            policy.declarations_max
        ));
    }

    let mut map = DeadlineSectorMap::new();
    for (deadline, partition, sectors) in declarations {
        map.add(policy, deadline, partition, sectors).map_err(|e| {
            actor_error!(
                illegal_argument,
                "failed to process deadline {}, partition {}: {}",
                deadline,
                partition,
                e.msg()
            )
        })?;
    }
    map.check(policy.addressed_partitions_max, policy.addressed_sectors_max).map_err(|e| {
        actor_error!(illegal_argument, "cannot process requested parameters: {}", e.msg())
    })?;
    Ok(map)
}

fn validate_fr_declaration_deadline(deadline: &DeadlineInfo) -> Result<(), ActorError> {
    if deadline.fault_cutoff_passed() {
        return Err(actor_error!(illegal_argument, "late fault or recovery declaration"));
    }
    Ok(())
}

fn balance_invariants_broken(e: ActorError) -> ActorError {
    ActorError::unchecked(
        ERR_BALANCE_INVARIANTS_BROKEN,
        format!("balance invariants broken: {}", e.msg()),
    )
}

impl ActorCode for Actor {
    type Methods = Method;

    fn name() -> &'static str {
        "StorageMiner"
    }

    actor_dispatch! {
        Constructor => constructor,
        SubmitWindowedPoSt => submit_windowed_post,
        PreCommitSector => pre_commit_sector,
        ProveCommitSector => prove_commit_sector,
        DeclareFaults => declare_faults,
        DeclareFaultsRecovered => declare_faults_recovered,
        OnDeferredCronEvent => on_deferred_cron_event,
        ConfirmSectorProofsValid => confirm_sector_proofs_valid,
        CompactPartitions => compact_partitions,
        DisputeWindowedPoSt => dispute_windowed_post,
        PreCommitSectorBatch => pre_commit_sector_batch,
        ProveCommitAggregate => prove_commit_aggregate,
    }
}
