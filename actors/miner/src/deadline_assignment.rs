// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use fil_miner_runtime::{actor_error, ActorError};

use super::{Deadline, SectorOnChainInfo};

/// Load of a single deadline while new sectors are being handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeadlineAssignmentInfo {
    index: usize,
    live_sectors: u64,
    total_sectors: u64,
}

impl DeadlineAssignmentInfo {
    /// Whether one more sector would need a partition beyond the limit.
    fn max_partitions_reached(&self, partition_size: u64, max_partitions: u64) -> bool {
        self.total_sectors >= partition_size.saturating_mul(max_partitions)
    }
}

impl Ord for DeadlineAssignmentInfo {
    // BinaryHeap is a max-heap, so the "greatest" entry is the least loaded deadline,
    // with ties going to the lowest index.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .live_sectors
            .cmp(&self.live_sectors)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for DeadlineAssignmentInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Assigns sectors to deadlines, one at a time, always choosing the open deadline
/// with the fewest live sectors.
///
/// `deadlines` holds `None` for deadlines that may not receive sectors right now.
/// Returns the sectors assigned to each deadline, indexed like `deadlines`.
pub fn assign_deadlines(
    max_partitions: u64,
    partition_size: u64,
    deadlines: &[Option<Deadline>],
    sectors: Vec<SectorOnChainInfo>,
) -> Result<Vec<Vec<SectorOnChainInfo>>, ActorError> {
    let mut heap: BinaryHeap<DeadlineAssignmentInfo> = deadlines
        .iter()
        .enumerate()
        .filter_map(|(index, deadline)| {
            deadline.as_ref().map(|dl| DeadlineAssignmentInfo {
                index,
                live_sectors: dl.live_sectors,
                total_sectors: dl.total_sectors,
            })
        })
        .filter(|info| !info.max_partitions_reached(partition_size, max_partitions))
        .collect();

    let mut changes = vec![Vec::new(); deadlines.len()];

    for sector in sectors {
        let mut info = heap.pop().ok_or_else(|| {
            actor_error!(
                illegal_state,
                "max partitions limit {} reached for all deadlines",
                max_partitions
            )
        })?;

        changes[info.index].push(sector);
        info.live_sectors += 1;
        info.total_sectors += 1;

        if !info.max_partitions_reached(partition_size, max_partitions) {
            heap.push(info);
        }
    }

    Ok(changes)
}
