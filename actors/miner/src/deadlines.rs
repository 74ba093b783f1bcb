// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_miner_runtime::runtime::Policy;
use fil_miner_runtime::{actor_error, ActorContext, ActorError};
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::SectorNumber;

use super::{DeadlineInfo, Deadlines, QuantSpec};

/// Timing of deadline `deadline_idx` in the proving period starting at `proving_period_start`.
pub fn new_deadline_info(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    DeadlineInfo::new(
        proving_period_start,
        deadline_idx,
        current_epoch,
        policy.wpost_period_deadlines,
        policy.wpost_proving_period,
        policy.wpost_challenge_window,
        policy.wpost_challenge_lookback,
        policy.fault_declaration_cutoff,
    )
}

/// Returns the deadline open at `current_epoch` for a miner whose proving periods start at
/// epochs congruent to `period_start_seed` modulo the proving period.
pub fn new_deadline_info_from_offset_and_epoch(
    policy: &Policy,
    period_start_seed: ChainEpoch,
    current_epoch: ChainEpoch,
) -> DeadlineInfo {
    let period = QuantSpec { unit: policy.wpost_proving_period, offset: period_start_seed };
    let period_start = period.quantize_down(current_epoch);
    let deadline_idx = current_deadline_index(policy, current_epoch, period_start);
    new_deadline_info(policy, period_start, deadline_idx, current_epoch)
}

pub fn quant_spec_for_deadline(policy: &Policy, di: &DeadlineInfo) -> QuantSpec {
    QuantSpec { unit: policy.wpost_proving_period, offset: di.last() }
}

/// Start of the proving period containing `current_epoch`, for a period offset in
/// `[0, wpost_proving_period)`.
pub fn current_proving_period_start(
    policy: &Policy,
    current_epoch: ChainEpoch,
    offset: ChainEpoch,
) -> ChainEpoch {
    current_epoch - (current_epoch - offset).rem_euclid(policy.wpost_proving_period)
}

/// Returns the index of the deadline containing `current_epoch`, which must be in the
/// proving period starting at `period_start`.
pub fn current_deadline_index(
    policy: &Policy,
    current_epoch: ChainEpoch,
    period_start: ChainEpoch,
) -> u64 {
    ((current_epoch - period_start) / policy.wpost_challenge_window) as u64
}

/// Returns the deadline and partition holding `sector_number`, or not found if no
/// partition lists it.
pub fn find_sector<BS: Blockstore>(
    store: &BS,
    deadlines: &Deadlines,
    sector_number: SectorNumber,
) -> Result<(u64, u64), ActorError> {
    for deadline_idx in 0..deadlines.due.len() as u64 {
        let deadline = deadlines.load_deadline(store, deadline_idx)?;
        let partitions = deadline
            .partitions_amt(store)
            .with_context(|| format!("failed to load partitions for deadline {}", deadline_idx))?;

        let mut found = None;
        partitions.for_each_while(|partition_idx, partition| {
            found = partition.sectors.get(sector_number).then_some(partition_idx);
            Ok(found.is_none())
        })?;
        if let Some(partition_idx) = found {
            return Ok((deadline_idx, partition_idx));
        }
    }

    Err(actor_error!(not_found; "sector {} not due at any deadline", sector_number))
}

/// Whether sectors may be assigned to the deadline: its next occurrence must open more
/// than one challenge window from now.
pub fn deadline_is_mutable(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    let next = new_deadline_info(policy, proving_period_start, deadline_idx, current_epoch)
        .next_not_elapsed();
    current_epoch < next.open - policy.wpost_challenge_window
}

/// Whether proofs accepted at the deadline's last window can be disputed now. Disputes
/// wait for the window to close and end once the dispute window after it has passed.
pub fn deadline_available_for_optimistic_post_dispute(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    // Nothing has been proven before the first period starts.
    if proving_period_start > current_epoch {
        return false;
    }
    let next = new_deadline_info(policy, proving_period_start, deadline_idx, current_epoch)
        .next_not_elapsed();
    let last_close = next.close - policy.wpost_proving_period;

    !next.is_open() && current_epoch < last_close + policy.wpost_dispute_window
}

/// Whether the deadline's partitions may be compacted now. The deadline must be mutable
/// and its last proofs must be past dispute.
pub fn deadline_available_for_compaction(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    deadline_is_mutable(policy, proving_period_start, deadline_idx, current_epoch)
        && !deadline_available_for_optimistic_post_dispute(
            policy,
            proving_period_start,
            deadline_idx,
            current_epoch,
        )
}
