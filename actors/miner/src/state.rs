// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::ops::Neg;

use cid::multihash::Code;
use cid::Cid;
use fil_miner_runtime::runtime::Policy;
use fil_miner_runtime::{actor_error, ActorContext, ActorError, Array, AsActorError};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::CborStore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::{SectorNumber, SectorSize, MAX_SECTOR_NUMBER};
use num_traits::Zero;

use super::{
    assign_deadlines, deadline_is_mutable, new_deadline_info,
    new_deadline_info_from_offset_and_epoch, quant_spec_for_deadline, BitFieldQueue, Deadline,
    DeadlineInfo, Deadlines, MinerInfo, PowerPair, QuantSpec, SectorOnChainInfo,
    SectorPreCommitOnChainInfo, Sectors, SECTORS_AMT_BITWIDTH,
};

pub const PRECOMMIT_AMT_BITWIDTH: u32 = 5;
pub const PRECOMMIT_EXPIRY_AMT_BITWIDTH: u32 = 6;

/// Balance of Miner Actor should be greater than or equal to
/// the sum of PreCommitDeposits and InitialPledge.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct State {
    /// Contains static info about this miner
    pub info: Cid,

    /// Total funds locked as pre_commit_deposit
    pub pre_commit_deposits: TokenAmount,

    /// Sum of initial pledge requirements of all active sectors
    pub initial_pledge: TokenAmount,

    /// Absolute value of debt this miner owes from unpaid fees
    pub fee_debt: TokenAmount,

    /// Sectors that have been pre-committed but not yet proven.
    pub pre_committed_sectors: Cid, // AMT[SectorNumber]SectorPreCommitOnChainInfo

    /// PreCommittedSectorsCleanUp maintains the state required to cleanup expired PreCommittedSectors.
    pub pre_committed_sectors_cleanup: Cid, // BitFieldQueue (AMT[Epoch]*BitField)

    /// Allocated sector IDs. Sector IDs can never be reused once allocated.
    pub allocated_sectors: Cid, // BitField

    /// Information for all proven and not-yet-garbage-collected sectors.
    ///
    /// Sectors are removed from this AMT when the partition to which the
    /// sector belongs is compacted.
    pub sectors: Cid, // AMT[SectorNumber]SectorOnChainInfo (sparse)

    /// The first epoch in this miner's current proving period. This is the first epoch in which a PoSt for a
    /// partition at the miner's first deadline may arrive. Alternatively, it is after the last epoch at which
    /// a PoSt for the previous window is valid.
    /// Always greater than zero, this may be greater than the current epoch for genesis miners in the first
    /// WPoStProvingPeriod epochs of the chain; the epochs before the first proving period starts are exempt from Window
    /// PoSt requirements.
    /// Updated at the end of every period by a cron callback.
    pub proving_period_start: ChainEpoch,

    /// Index of the deadline within the proving period beginning at ProvingPeriodStart that has not yet been
    /// finalized.
    /// Updated at the end of each deadline window by a cron callback.
    pub current_deadline: u64,

    /// The sector numbers due for PoSt at each deadline in the current proving period, frozen at period start.
    /// New sectors are added and expired ones removed at proving period boundary.
    /// Faults are not subtracted from this in state, but on the fly.
    pub deadlines: Cid,

    /// True when miner cron is active, false otherwise
    pub deadline_cron_active: bool,
}

/// Changes to a miner's power and pledge caused by the close of one deadline.
#[derive(Debug, Default)]
pub struct AdvanceDeadlineResult {
    pub pledge_delta: TokenAmount,
    pub power_delta: PowerPair,
    /// Power that was faulty before this advance (including recovering)
    pub previously_faulty_power: PowerPair,
    /// Power of new faults and failed recoveries
    pub detected_faulty_power: PowerPair,
    /// Total faulty power after detecting faults (before expiring sectors)
    /// Note that failed recovery power is included in both PreviouslyFaultyPower and
    /// DetectedFaultyPower, so TotalFaultyPower is not simply their sum.
    pub total_faulty_power: PowerPair,
    /// Sectors terminated because they stayed faulty for too long, liable for a termination fee.
    pub early_terminated: Vec<SectorOnChainInfo>,
}

impl State {
    pub fn new<BS: Blockstore>(
        policy: &Policy,
        store: &BS,
        info_cid: Cid,
        period_start: ChainEpoch,
        deadline_idx: u64,
    ) -> Result<Self, ActorError> {
        let empty_precommit_map =
            Array::<_, SectorPreCommitOnChainInfo>::flush_empty(store, PRECOMMIT_AMT_BITWIDTH)
                .context("failed to construct empty precommit map")?;
        let empty_precommits_cleanup_array =
            Array::<_, BitField>::flush_empty(store, PRECOMMIT_EXPIRY_AMT_BITWIDTH)
                .context("failed to construct empty precommits array")?;
        let empty_sectors_array =
            Array::<_, SectorOnChainInfo>::flush_empty(store, SECTORS_AMT_BITWIDTH)
                .context("failed to construct sectors array")?;
        let empty_bitfield = store
            .put_cbor(&BitField::new(), Code::Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to construct empty bitfield")?;
        let deadline = Deadline::new(store)?;
        let empty_deadline = store
            .put_cbor(&deadline, Code::Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to construct illegal state")?;

        let empty_deadlines = store
            .put_cbor(&Deadlines::new(policy, empty_deadline), Code::Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to construct illegal state")?;

        Ok(Self {
            info: info_cid,

            pre_commit_deposits: TokenAmount::default(),
            initial_pledge: TokenAmount::default(),
            fee_debt: TokenAmount::default(),

            pre_committed_sectors: empty_precommit_map,
            pre_committed_sectors_cleanup: empty_precommits_cleanup_array,
            allocated_sectors: empty_bitfield,
            sectors: empty_sectors_array,
            proving_period_start: period_start,
            current_deadline: deadline_idx,
            deadlines: empty_deadlines,
            deadline_cron_active: false,
        })
    }

    pub fn get_info<BS: Blockstore>(&self, store: &BS) -> Result<MinerInfo, ActorError> {
        store
            .get_cbor(&self.info)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load miner info")?
            .ok_or_else(|| actor_error!(illegal_state, "failed to get miner info"))
    }

    /// Returns deadline calculations for the current (according to state) proving period.
    pub fn deadline_info(&self, policy: &Policy, current_epoch: ChainEpoch) -> DeadlineInfo {
        new_deadline_info_from_offset_and_epoch(policy, self.proving_period_start, current_epoch)
    }

    // Returns deadline calculations for the state recorded proving period and deadline.
    // This is out of date if the a miner does not have an active miner cron
    pub fn recorded_deadline_info(&self, policy: &Policy, current_epoch: ChainEpoch) -> DeadlineInfo {
        new_deadline_info(policy, self.proving_period_start, self.current_deadline, current_epoch)
    }

    // Returns current proving period start for the current epoch according to the current epoch and constant state offset
    pub fn current_proving_period_start(
        &self,
        policy: &Policy,
        current_epoch: ChainEpoch,
    ) -> ChainEpoch {
        let dl_info = self.deadline_info(policy, current_epoch);
        dl_info.period_start
    }

    /// Returns deadline calculations for the current (according to state) proving period
    pub fn quant_spec_for_deadline(&self, policy: &Policy, deadline_idx: u64) -> QuantSpec {
        new_deadline_info(policy, self.proving_period_start, deadline_idx, 0).quant_spec()
    }

    /// Returns the quantization spec the pre-commit expiry queue is keyed by: one entry
    /// per deadline boundary.
    pub fn quant_spec_every_deadline(&self, policy: &Policy) -> QuantSpec {
        QuantSpec { unit: policy.wpost_challenge_window, offset: self.proving_period_start }
    }

    /// Marks a sector number as allocated. Sector numbers are never reused.
    pub fn allocate_sector_number<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_number: SectorNumber,
    ) -> Result<(), ActorError> {
        // This will likely already have been checked, but this is a good place
        // to catch any mistakes.
        if sector_number > MAX_SECTOR_NUMBER {
            return Err(
                actor_error!(illegal_argument; "sector number out of range: {}", sector_number),
            );
        }

        let mut allocated_sectors: BitField = store
            .get_cbor(&self.allocated_sectors)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load allocated sectors bitfield")?
            .ok_or_else(|| actor_error!(illegal_state, "allocated sectors bitfield not found"))?;

        if allocated_sectors.get(sector_number) {
            return Err(actor_error!(
                illegal_argument;
                "sector number {} has already been allocated", sector_number
            ));
        }

        allocated_sectors.set(sector_number);
        self.allocated_sectors = store
            .put_cbor(&allocated_sectors, Code::Blake2b256)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to store allocated sectors bitfield after adding sector {}", sector_number)
            })?;

        Ok(())
    }

    fn pre_committed_sectors_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<&'db BS, SectorPreCommitOnChainInfo>, ActorError> {
        Array::load(store, &self.pre_committed_sectors, "precommits")
    }

    /// Stores pre-commitments, refusing to overwrite an existing one.
    pub fn put_precommitted_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        precommits: Vec<SectorPreCommitOnChainInfo>,
    ) -> Result<(), ActorError> {
        let mut precommitted = self.pre_committed_sectors_amt(store)?;
        for precommit in precommits.into_iter() {
            let sector_no = precommit.info.sector_number;
            if precommitted.get(sector_no)?.is_some() {
                return Err(actor_error!(illegal_state, "sector {} already pre-commited", sector_no));
            }
            precommitted.set(sector_no, precommit)?;
        }

        self.pre_committed_sectors = precommitted.flush()?;
        Ok(())
    }

    pub fn get_precommitted_sector<BS: Blockstore>(
        &self,
        store: &BS,
        sector_num: SectorNumber,
    ) -> Result<Option<SectorPreCommitOnChainInfo>, ActorError> {
        let precommitted = self.pre_committed_sectors_amt(store)?;
        Ok(precommitted.get(sector_num)?.cloned())
    }

    /// Gets and returns the requested pre-committed sectors, skipping missing sectors.
    pub fn find_precommitted_sectors<BS: Blockstore>(
        &self,
        store: &BS,
        sector_numbers: &[SectorNumber],
    ) -> Result<Vec<SectorPreCommitOnChainInfo>, ActorError> {
        let precommitted = self.pre_committed_sectors_amt(store)?;
        let mut result = Vec::with_capacity(sector_numbers.len());

        for &sector_number in sector_numbers {
            let info = match precommitted.get(sector_number).with_context(|| {
                format!("failed to load precommitment for {}", sector_number)
            })? {
                Some(info) => info.clone(),
                None => continue,
            };

            result.push(info);
        }

        Ok(result)
    }

    pub fn delete_precommitted_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_nums: &[SectorNumber],
    ) -> Result<(), ActorError> {
        let mut precommitted = self.pre_committed_sectors_amt(store)?;
        for &sector_num in sector_nums {
            let prev_entry = precommitted.delete(sector_num)?;
            if prev_entry.is_none() {
                return Err(actor_error!(illegal_state, "sector {} doesn't exist", sector_num));
            }
        }

        self.pre_committed_sectors = precommitted.flush()?;
        Ok(())
    }

    pub fn has_sector_number<BS: Blockstore>(
        &self,
        store: &BS,
        sector_num: SectorNumber,
    ) -> Result<bool, ActorError> {
        let sectors = Sectors::load(store, &self.sectors)?;
        Ok(sectors.get(sector_num)?.is_some())
    }

    pub fn put_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        new_sectors: Vec<SectorOnChainInfo>,
    ) -> Result<(), ActorError> {
        let mut sectors =
            Sectors::load(store, &self.sectors).context("failed to load sectors")?;

        sectors.store(new_sectors)?;

        self.sectors = sectors.amt.flush().context("failed to persist sectors")?;

        Ok(())
    }

    pub fn get_sector<BS: Blockstore>(
        &self,
        store: &BS,
        sector_num: SectorNumber,
    ) -> Result<Option<SectorOnChainInfo>, ActorError> {
        let sectors = Sectors::load(store, &self.sectors)?;
        sectors.get(sector_num)
    }

    pub fn delete_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_nos: &BitField,
    ) -> Result<(), ActorError> {
        let mut sectors = Sectors::load(store, &self.sectors)?;

        for sector_num in sector_nos.iter() {
            let deleted_sector =
                sectors.amt.delete(sector_num).context("could not delete sector number")?;
            if deleted_sector.is_none() {
                return Err(actor_error!(illegal_state, "sector {} doesn't exist", sector_num));
            }
        }

        self.sectors = sectors.amt.flush()?;
        Ok(())
    }

    pub fn load_sector_infos<BS: Blockstore>(
        &self,
        store: &BS,
        sectors: &BitField,
    ) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        Sectors::load(store, &self.sectors)?.load_sector(sectors)
    }

    pub fn load_deadlines<BS: Blockstore>(&self, store: &BS) -> Result<Deadlines, ActorError> {
        store
            .get_cbor::<Deadlines>(&self.deadlines)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to load deadlines")?
            .ok_or_else(
                || actor_error!(illegal_state; "failed to load deadlines {}", self.deadlines),
            )
    }

    pub fn save_deadlines<BS: Blockstore>(
        &mut self,
        store: &BS,
        deadlines: Deadlines,
    ) -> Result<(), ActorError> {
        self.deadlines = store
            .put_cbor(&deadlines, Code::Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store deadlines")?;
        Ok(())
    }

    /// Assign new sectors to deadlines.
    pub fn assign_sectors_to_deadlines<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
        mut sectors: Vec<SectorOnChainInfo>,
        partition_size: u64,
        sector_size: SectorSize,
    ) -> Result<(), ActorError> {
        let mut deadlines = self.load_deadlines(store)?;

        // Sort sectors by number to get better runs in partition bitfields.
        sectors.sort_by_key(|info| info.sector_number);

        let mut deadline_vec: Vec<Option<Deadline>> =
            (0..policy.wpost_period_deadlines).map(|_| None).collect();

        deadlines.for_each(store, |deadline_idx, deadline| {
            // Skip deadlines that aren't currently mutable.
            if deadline_is_mutable(policy, self.proving_period_start, deadline_idx, current_epoch)
            {
                deadline_vec[deadline_idx as usize] = Some(deadline);
            }

            Ok(())
        })?;

        let deadline_to_sectors = assign_deadlines(
            policy.max_partitions_per_deadline,
            partition_size,
            &deadline_vec,
            sectors,
        )?;

        for (deadline_idx, deadline_sectors) in deadline_to_sectors.into_iter().enumerate() {
            if deadline_sectors.is_empty() {
                continue;
            }

            let quant = self.quant_spec_for_deadline(policy, deadline_idx as u64);
            let deadline = deadline_vec[deadline_idx].as_mut().ok_or_else(|| {
                actor_error!(illegal_state; "sectors assigned to immutable deadline {}", deadline_idx)
            })?;

            // The power returned from AddSectors is ignored because it's not activated (proven) yet.
            let proven = false;
            deadline.add_sectors(
                store,
                partition_size,
                proven,
                &deadline_sectors,
                sector_size,
                quant,
            )?;

            deadlines.update_deadline(policy, store, deadline_idx as u64, deadline)?;
        }

        self.save_deadlines(store, deadlines)?;

        Ok(())
    }

    /// Schedules pre-committed sectors for clean-up at the given epochs.
    pub fn add_pre_commit_clean_ups<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        cleanup_events: Vec<(ChainEpoch, u64)>,
    ) -> Result<(), ActorError> {
        // Load BitField Queue for sector expiry
        let quant = self.quant_spec_every_deadline(policy);
        let mut queue = BitFieldQueue::new(store, &self.pre_committed_sectors_cleanup, quant)
            .context("failed to load pre-commit clean up queue")?;

        queue.add_many_to_queue_values(cleanup_events)?;
        self.pre_committed_sectors_cleanup = queue.flush()?;
        Ok(())
    }

    /// Removes pre-commitments whose proving deadline has lapsed, returning their
    /// forfeited deposits.
    pub fn cleanup_expired_pre_commits<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> Result<TokenAmount, ActorError> {
        let mut deposit_to_burn = TokenAmount::zero();

        // cleanup expired pre-committed sectors
        let mut cleanup_queue = BitFieldQueue::new(
            store,
            &self.pre_committed_sectors_cleanup,
            self.quant_spec_every_deadline(policy),
        )?;

        let (sectors, modified) = cleanup_queue.pop_until(current_epoch)?;

        if modified {
            self.pre_committed_sectors_cleanup = cleanup_queue.flush()?;
        }

        let mut precommits_to_delete = Vec::new();
        let precommitted = self.pre_committed_sectors_amt(store)?;

        for i in sectors.iter() {
            let sector_number = i as SectorNumber;
            let sector = match precommitted.get(sector_number)? {
                Some(sector) => sector.clone(),
                // already committed/deleted
                None => continue,
            };

            // mark it for deletion
            precommits_to_delete.push(sector_number);

            // increment deposit to burn
            deposit_to_burn += sector.pre_commit_deposit;
        }

        // Actually delete it.
        if !precommits_to_delete.is_empty() {
            self.delete_precommitted_sectors(store, &precommits_to_delete)?;
        }

        self.pre_commit_deposits -= &deposit_to_burn;
        if self.pre_commit_deposits.is_negative() {
            return Err(actor_error!(
                illegal_state,
                "pre-commit clean up caused negative deposits: {}",
                self.pre_commit_deposits
            ));
        }

        Ok(deposit_to_burn)
    }

    pub fn advance_deadline<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        current_epoch: ChainEpoch,
    ) -> Result<AdvanceDeadlineResult, ActorError> {
        let mut pledge_delta = TokenAmount::zero();
        let mut power_delta = PowerPair::zero();

        let mut total_faulty_power = PowerPair::zero();
        let mut detected_faulty_power = PowerPair::zero();

        // Note: Use dl_info.last() rather than rt.curr_epoch unless certain
        // of the desired semantics.
        let dl_info = self.deadline_info(policy, current_epoch);

        // Return early if the proving period hasn't started.
        if !dl_info.period_started() {
            return Ok(AdvanceDeadlineResult::default());
        }

        self.current_deadline = (dl_info.index + 1) % policy.wpost_period_deadlines;
        if self.current_deadline == 0 {
            self.proving_period_start = dl_info.period_start + policy.wpost_proving_period;
        }

        let mut deadlines = self.load_deadlines(store)?;

        let mut deadline = deadlines.load_deadline(store, dl_info.index)?;

        let previously_faulty_power = deadline.faulty_power.clone();

        if !deadline.is_live() {
            return Ok(AdvanceDeadlineResult {
                pledge_delta,
                power_delta,
                previously_faulty_power,
                detected_faulty_power,
                total_faulty_power: deadline.faulty_power,
                early_terminated: Vec::new(),
            });
        }

        let quant = quant_spec_for_deadline(policy, &dl_info);

        // Detect and penalize missing proofs.
        let fault_expiration = dl_info.last() + policy.fault_max_age;

        let (deadline_power_delta, penalized_power) =
            deadline.process_deadline_end(store, quant, fault_expiration, self.sectors)?;

        power_delta += &deadline_power_delta;
        detected_faulty_power = penalized_power;

        // Capture deadline's faulty power after new faults have been detected, but before it is
        // dropped along with faulty sectors expiring this round.
        total_faulty_power = deadline.faulty_power.clone();

        // Expire sectors that are due, either for on-time expiration or "early" faulty-for-too-long.
        let info = self.get_info(store)?;
        let sectors = Sectors::load(store, &self.sectors)?;
        let expired = deadline.pop_expired_sectors(
            store,
            &sectors,
            dl_info.last(),
            info.sector_size,
            quant,
        )?;

        // Release pledge requirements for every terminated sector. The fee owed for sectors
        // terminated early is charged separately.
        let released_pledge = &expired.on_time_pledge + &expired.early_pledge;
        pledge_delta -= &released_pledge;
        self.add_initial_pledge(&released_pledge.neg())?;

        // Record reduction in power of the amount of expiring active power.
        // Faulty power has already been lost, so the amount expiring can be excluded from the delta.
        power_delta -= &expired.active_power;

        deadlines.update_deadline(policy, store, dl_info.index, &deadline)?;

        self.save_deadlines(store, deadlines)?;

        Ok(AdvanceDeadlineResult {
            pledge_delta,
            power_delta,
            previously_faulty_power,
            detected_faulty_power,
            total_faulty_power,
            early_terminated: expired.early_sector_infos,
        })
    }

    pub fn add_pre_commit_deposit(&mut self, amount: &TokenAmount) -> Result<(), ActorError> {
        let new_total = &self.pre_commit_deposits + amount;
        if new_total.is_negative() {
            return Err(actor_error!(
                illegal_state,
                "negative pre-commit deposit {} after adding {} to prior {}",
                new_total,
                amount,
                self.pre_commit_deposits
            ));
        }
        self.pre_commit_deposits = new_total;
        Ok(())
    }

    pub fn add_initial_pledge(&mut self, amount: &TokenAmount) -> Result<(), ActorError> {
        let new_total = &self.initial_pledge + amount;
        if new_total.is_negative() {
            return Err(actor_error!(
                illegal_state,
                "negative initial pledge requirement {} after adding {} to prior {}",
                new_total,
                amount,
                self.initial_pledge
            ));
        }
        self.initial_pledge = new_total;
        Ok(())
    }

    /// Adds a penalty to the miner's fee debt.
    pub fn apply_penalty(&mut self, penalty: &TokenAmount) -> Result<(), ActorError> {
        if penalty.is_negative() {
            return Err(actor_error!(illegal_state, "applying negative penalty {} not allowed", penalty));
        }
        self.fee_debt += penalty;
        Ok(())
    }

    /// Repays as much fee debt as the unlocked balance allows.
    /// Returns the amount repaid, which the caller must burn.
    pub fn repay_partial_debt(
        &mut self,
        curr_balance: &TokenAmount,
    ) -> Result<TokenAmount, ActorError> {
        let unlocked_balance = self.get_unlocked_balance(curr_balance)?;

        let from_balance = std::cmp::min(&unlocked_balance, &self.fee_debt).clone();
        self.fee_debt -= &from_balance;

        Ok(from_balance)
    }

    /// Balance not locked as deposits or pledge.
    pub fn get_unlocked_balance(&self, actor_balance: &TokenAmount) -> Result<TokenAmount, ActorError> {
        let unlocked_balance = actor_balance - &self.pre_commit_deposits - &self.initial_pledge;
        if unlocked_balance.is_negative() {
            return Err(actor_error!(illegal_state, "negative unlocked balance {}", unlocked_balance));
        }
        Ok(unlocked_balance)
    }

    /// Unlocked funds less outstanding fee debt. This may be negative.
    pub fn get_available_balance(&self, actor_balance: &TokenAmount) -> Result<TokenAmount, ActorError> {
        // (actor_balance - &self.locked_funds) - &self.pre_commit_deposit - &self.initial_pledge
        Ok(self.get_unlocked_balance(actor_balance)? - &self.fee_debt)
    }

    pub fn check_balance_invariants(&self, balance: &TokenAmount) -> Result<(), ActorError> {
        if self.pre_commit_deposits.is_negative() {
            return Err(actor_error!(illegal_state; "pre-commit deposit is negative: {}", self.pre_commit_deposits));
        }
        if self.initial_pledge.is_negative() {
            return Err(actor_error!(illegal_state; "initial pledge is negative: {}", self.initial_pledge));
        }
        if self.fee_debt.is_negative() {
            return Err(actor_error!(illegal_state; "fee debt is negative: {}", self.fee_debt));
        }

        let min_balance = &self.pre_commit_deposits + &self.initial_pledge;
        if balance < &min_balance {
            return Err(actor_error!(
                illegal_state;
                "balance {} below minimum {}", balance, min_balance
            ));
        }

        Ok(())
    }

    /// Whether the miner still has anything for the deadline cron to attend to.
    pub fn continue_deadline_cron(&self) -> bool {
        !self.pre_commit_deposits.is_zero()
            || !self.initial_pledge.is_zero()
            || !self.fee_debt.is_zero()
    }
}
