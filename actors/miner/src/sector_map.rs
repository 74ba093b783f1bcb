// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fil_miner_runtime::runtime::Policy;
use fil_miner_runtime::{actor_error, ActorError};
use fvm_ipld_bitfield::BitField;

/// Sector numbers grouped by deadline, then by partition.
#[derive(Default, Debug)]
pub struct DeadlineSectorMap(BTreeMap<u64, PartitionSectorMap>);

fn checked_total(
    counts: impl IntoIterator<Item = u64>,
    what: &str,
) -> Result<u64, ActorError> {
    counts.into_iter().try_fold(0_u64, |total, n| {
        total
            .checked_add(n)
            .ok_or_else(|| actor_error!(illegal_argument; "integer overflow when counting {}", what))
    })
}

impl DeadlineSectorMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Fails if the map addresses more than `max_partitions` partitions or
    /// `max_sectors` sectors in total.
    pub fn check(&self, max_partitions: u64, max_sectors: u64) -> Result<(), ActorError> {
        let (partitions, sectors) = self.count()?;
        if partitions > max_partitions {
            return Err(actor_error!(
                illegal_argument,
                "too many partitions {}, max {}",
                partitions,
                max_partitions
            ));
        }
        if sectors > max_sectors {
            return Err(actor_error!(
                illegal_argument,
                "too many sectors {}, max {}",
                sectors,
                max_sectors
            ));
        }
        Ok(())
    }

    /// Returns the number of partitions and of sectors across all deadlines.
    pub fn count(&self) -> Result<(u64, u64), ActorError> {
        let per_deadline = self
            .0
            .iter()
            .map(|(idx, partitions)| {
                partitions.count().map_err(|e| e.wrap(format!("when counting deadline {}", idx)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((
            checked_total(per_deadline.iter().map(|(p, _)| *p), "partitions")?,
            checked_total(per_deadline.iter().map(|(_, s)| *s), "sectors")?,
        ))
    }

    /// Merges `sector_numbers` into the entry for the partition of the deadline.
    pub fn add(
        &mut self,
        policy: &Policy,
        deadline_idx: u64,
        partition_idx: u64,
        sector_numbers: &BitField,
    ) -> Result<(), ActorError> {
        if deadline_idx >= policy.wpost_period_deadlines {
            return Err(actor_error!(illegal_argument, "invalid deadline {}", deadline_idx));
        }
        self.0.entry(deadline_idx).or_default().add(partition_idx, sector_numbers);
        Ok(())
    }

    pub fn add_values(
        &mut self,
        policy: &Policy,
        deadline_idx: u64,
        partition_idx: u64,
        sector_numbers: &[u64],
    ) -> Result<(), ActorError> {
        let sector_numbers = BitField::try_from_bits(sector_numbers.iter().copied())
            .map_err(|e| actor_error!(illegal_argument, "invalid sector numbers: {}", e))?;
        self.add(policy, deadline_idx, partition_idx, &sector_numbers)
    }

    /// Deadline indexes in increasing order.
    pub fn deadlines(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&mut self) -> impl Iterator<Item = (u64, &mut PartitionSectorMap)> + '_ {
        self.0.iter_mut().map(|(&idx, partitions)| (idx, partitions))
    }
}

/// Sector numbers grouped by partition.
#[derive(Default, Debug)]
pub struct PartitionSectorMap(BTreeMap<u64, BitField>);

impl PartitionSectorMap {
    /// Merges `sector_numbers` into the entry for the partition.
    pub fn add(&mut self, partition_idx: u64, sector_numbers: &BitField) {
        *self.0.entry(partition_idx).or_default() |= sector_numbers;
    }

    /// Returns the number of partitions and of sectors.
    pub fn count(&self) -> Result<(u64, u64), ActorError> {
        let sectors = checked_total(self.0.values().map(BitField::len), "sectors")?;
        Ok((self.0.len() as u64, sectors))
    }

    pub fn iter(&mut self) -> impl Iterator<Item = (u64, &mut BitField)> + '_ {
        self.0.iter_mut().map(|(&idx, sectors)| (idx, sectors))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
