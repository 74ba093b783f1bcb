// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::multihash::Code;
use cid::Cid;
use fil_miner_runtime::runtime::Policy;
use fil_miner_runtime::{actor_error, ActorContext, ActorError, Array, AsActorError};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::CborStore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::{PoStProof, SectorSize};

use super::{
    BitFieldQueue, ExpirationSet, Partition, PartitionSectorMap, PoStPartition, PowerPair,
    QuantSpec, SectorOnChainInfo, Sectors,
};

pub const DEADLINE_PARTITIONS_AMT_BITWIDTH: u32 = 3;
pub const DEADLINE_EXPIRATIONS_AMT_BITWIDTH: u32 = 5;
pub const DEADLINE_OPTIMISTIC_POST_SUBMISSIONS_AMT_BITWIDTH: u32 = 2;

/// One deadline root per window of the proving period, indexed by deadline.
#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, PartialEq, Eq)]
pub struct Deadlines {
    pub due: Vec<Cid>,
}

impl Deadlines {
    pub fn new(policy: &Policy, empty_deadline_cid: Cid) -> Self {
        Self { due: vec![empty_deadline_cid; policy.wpost_period_deadlines as usize] }
    }

    pub fn load_deadline<BS: Blockstore>(
        &self,
        store: &BS,
        deadline_idx: u64,
    ) -> Result<Deadline, ActorError> {
        let root = self
            .due
            .get(deadline_idx as usize)
            .ok_or_else(|| actor_error!(illegal_argument; "invalid deadline {}", deadline_idx))?;

        store
            .get_cbor(root)
            .with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to lookup deadline {}", deadline_idx)
            })?
            .ok_or_else(|| actor_error!(illegal_state; "no deadline {}", deadline_idx))
    }

    pub fn for_each<BS: Blockstore>(
        &self,
        store: &BS,
        mut f: impl FnMut(u64, Deadline) -> Result<(), ActorError>,
    ) -> Result<(), ActorError> {
        (0..self.due.len() as u64).try_for_each(|idx| f(idx, self.load_deadline(store, idx)?))
    }

    pub fn update_deadline<BS: Blockstore>(
        &mut self,
        policy: &Policy,
        store: &BS,
        deadline_idx: u64,
        deadline: &Deadline,
    ) -> Result<(), ActorError> {
        if deadline_idx >= policy.wpost_period_deadlines {
            return Err(actor_error!(illegal_argument; "invalid deadline {}", deadline_idx));
        }

        self.due[deadline_idx as usize] = store
            .put_cbor(deadline, Code::Blake2b256)
            .context_code(ExitCode::USR_ILLEGAL_STATE, "failed to store deadline")?;
        Ok(())
    }
}

/// State of the sectors proven in one window of the proving period.
#[derive(Debug, Default, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Deadline {
    /// AMT of partitions, keyed densely from zero.
    pub partitions: Cid,

    /// Queue of partition numbers keyed by the quantized epoch at which some of their
    /// sectors may expire, on time or as long-running faults.
    ///
    /// An entry stays until its epoch passes, even when the sectors that put it there have
    /// since recovered or terminated. Popping a stale entry finds nothing.
    pub expirations_epochs: Cid,

    /// Partitions proven so far in the current challenge window.
    pub partitions_posted: BitField,

    /// Sectors not yet terminated, faulty ones included.
    pub live_sectors: u64,

    /// Sectors in all partitions, terminated ones included.
    pub total_sectors: u64,

    /// Sum of the faulty power of all partitions.
    pub faulty_power: PowerPair,

    /// Proofs accepted without verification during the current challenge window.
    pub optimistic_post_submissions: Cid,

    /// Sectors AMT as it stood when the last challenge window closed.
    pub sectors_snapshot: Cid,

    /// Partitions AMT as it stood when the last challenge window closed.
    pub partitions_snapshot: Cid,

    /// Proofs accepted in the last challenge window. Entries are deleted as they are
    /// successfully disputed.
    pub optimistic_post_submissions_snapshot: Cid,
}

/// A window PoSt accepted without verification, kept for dispute.
#[derive(Serialize_tuple, Deserialize_tuple, Debug, Clone, PartialEq)]
pub struct WindowedPoSt {
    pub partitions: BitField,
    /// One proof per seal proof type among the proven sectors.
    pub proofs: Vec<PoStProof>,
}

#[derive(Debug)]
pub struct DisputeInfo {
    pub all_sector_nos: BitField,
    pub ignored_sector_nos: BitField,
    pub disputed_sectors: PartitionSectorMap,
    pub disputed_power: PowerPair,
}

/// The effects of a window PoSt on a deadline's partitions.
#[derive(Debug, Default, PartialEq)]
pub struct PoStResult {
    /// Change in active power, positive or negative.
    pub power_delta: PowerPair,
    pub new_faulty_power: PowerPair,
    pub retracted_recovery_power: PowerPair,
    pub recovered_power: PowerPair,
    /// Every sector of the proven partitions.
    pub sectors: BitField,
    /// The part of `sectors` the proof does not cover.
    pub ignored_sectors: BitField,
    pub partitions: BitField,
}

/// Sectors and power taken out of a deadline by `remove_partitions`.
#[derive(Debug, Default, PartialEq)]
pub struct RemovedPartitions {
    pub live: BitField,
    pub dead: BitField,
    pub power: PowerPair,
}

/// Loads the partitions at `root`, applies `f` and writes the new root back.
fn update_partitions<'db, BS: Blockstore, R>(
    store: &'db BS,
    root: &mut Cid,
    f: impl FnOnce(&mut Array<&'db BS, Partition>) -> Result<R, ActorError>,
) -> Result<R, ActorError> {
    let mut partitions = Array::load(store, root, "partitions")?;
    let out = f(&mut partitions)?;
    *root = partitions.flush()?;
    Ok(out)
}

/// Loads the expiration queue at `root`, applies `f` and writes the new root back.
fn update_expirations<'db, BS: Blockstore, R>(
    store: &'db BS,
    root: &mut Cid,
    quant: QuantSpec,
    f: impl FnOnce(&mut BitFieldQueue<'db, BS>) -> Result<R, ActorError>,
) -> Result<R, ActorError> {
    let mut queue =
        BitFieldQueue::new(store, root, quant).context("failed to load expiration queue")?;
    let out = f(&mut queue)?;
    *root = queue.flush().context("failed to save expiration queue")?;
    Ok(out)
}

fn partition_at<BS: Blockstore>(
    partitions: &Array<&BS, Partition>,
    partition_idx: u64,
    missing: ExitCode,
) -> Result<Partition, ActorError> {
    partitions
        .get(partition_idx)
        .with_context(|| format!("failed to lookup partition {}", partition_idx))?
        .cloned()
        .ok_or_else(|| ActorError::unchecked(missing, format!("no such partition {}", partition_idx)))
}

impl Deadline {
    pub fn new<BS: Blockstore>(store: &BS) -> Result<Self, ActorError> {
        let partitions =
            Array::<_, Partition>::flush_empty(store, DEADLINE_PARTITIONS_AMT_BITWIDTH)
                .context("failed to create empty partitions array")?;
        let expirations_epochs =
            Array::<_, BitField>::flush_empty(store, DEADLINE_EXPIRATIONS_AMT_BITWIDTH)
                .context("failed to create empty expiration queue")?;
        let proofs = Array::<_, WindowedPoSt>::flush_empty(
            store,
            DEADLINE_OPTIMISTIC_POST_SUBMISSIONS_AMT_BITWIDTH,
        )
        .context("failed to create empty proofs array")?;
        let sectors_snapshot =
            Array::<_, SectorOnChainInfo>::flush_empty(store, super::SECTORS_AMT_BITWIDTH)
                .context("failed to create empty sectors array")?;

        Ok(Self {
            partitions,
            expirations_epochs,
            partitions_posted: BitField::new(),
            live_sectors: 0,
            total_sectors: 0,
            faulty_power: PowerPair::zero(),
            optimistic_post_submissions: proofs,
            sectors_snapshot,
            partitions_snapshot: partitions,
            optimistic_post_submissions_snapshot: proofs,
        })
    }

    /// Whether closing this deadline has anything to do: live sectors to check,
    /// PoSts to reset or a snapshot that is out of date.
    pub fn is_live(&self) -> bool {
        self.live_sectors > 0
            || !self.partitions_posted.is_empty()
            // one last pass refreshes the stale snapshots
            || self.partitions != self.partitions_snapshot
            || self.optimistic_post_submissions != self.optimistic_post_submissions_snapshot
    }

    pub fn partitions_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<&'db BS, Partition>, ActorError> {
        Array::load(store, &self.partitions, "partitions")
    }

    pub fn optimistic_proofs_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<&'db BS, WindowedPoSt>, ActorError> {
        Array::load(store, &self.optimistic_post_submissions, "optimistic proofs")
    }

    pub fn partitions_snapshot_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<&'db BS, Partition>, ActorError> {
        Array::load(store, &self.partitions_snapshot, "partitions snapshot")
    }

    pub fn optimistic_proofs_snapshot_amt<'db, BS: Blockstore>(
        &self,
        store: &'db BS,
    ) -> Result<Array<&'db BS, WindowedPoSt>, ActorError> {
        Array::load(store, &self.optimistic_post_submissions_snapshot, "optimistic proofs snapshot")
    }

    pub fn load_partition<BS: Blockstore>(
        &self,
        store: &BS,
        partition_idx: u64,
    ) -> Result<Partition, ActorError> {
        partition_at(&self.partitions_amt(store)?, partition_idx, ExitCode::USR_NOT_FOUND)
    }

    pub fn load_partition_snapshot<BS: Blockstore>(
        &self,
        store: &BS,
        partition_idx: u64,
    ) -> Result<Partition, ActorError> {
        partition_at(&self.partitions_snapshot_amt(store)?, partition_idx, ExitCode::USR_NOT_FOUND)
    }

    /// Queues `partitions` for an expiration check at `expiration_epoch`.
    pub fn add_expiration_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        expiration_epoch: ChainEpoch,
        partitions: &[u64],
        quant: QuantSpec,
    ) -> Result<(), ActorError> {
        if partitions.is_empty() {
            return Ok(());
        }
        update_expirations(store, &mut self.expirations_epochs, quant, |queue| {
            queue
                .add_to_queue_values(expiration_epoch, partitions.iter().copied())
                .context("failed to mutate expiration queue")
        })
    }

    /// Pops sectors whose expiration or fault expiration is at or before `until`,
    /// terminating them in their partitions.
    pub fn pop_expired_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        until: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<ExpirationSet, ActorError> {
        let Some(due) = self.pop_expired_partitions(store, until, quant)? else {
            return Ok(ExpirationSet::empty());
        };

        let expired = update_partitions(store, &mut self.partitions, |partitions| {
            let mut expired = ExpirationSet::empty();
            for partition_idx in due.iter() {
                let mut partition =
                    partition_at(partitions, partition_idx, ExitCode::USR_ILLEGAL_STATE)?;
                let popped = partition
                    .pop_expired_sectors(store, sectors, until, sector_size, quant)
                    .with_context(|| {
                        format!("failed to pop expired sectors from partition {}", partition_idx)
                    })?;
                expired.add(popped);
                partitions.set(partition_idx, partition)?;
            }
            Ok(expired)
        })?;

        self.live_sectors -= expired.len();
        self.faulty_power -= &expired.faulty_power;
        Ok(expired)
    }

    /// Takes the partitions queued at or before `until`, or `None` if nothing was queued.
    fn pop_expired_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        until: ChainEpoch,
        quant: QuantSpec,
    ) -> Result<Option<BitField>, ActorError> {
        let mut queue = BitFieldQueue::new(store, &self.expirations_epochs, quant)?;
        let (popped, modified) =
            queue.pop_until(until).context("failed to pop expiring partitions")?;
        if !modified {
            return Ok(None);
        }
        self.expirations_epochs = queue.flush()?;
        Ok(Some(popped))
    }

    /// Appends sectors to the deadline, topping up the last partition before opening new
    /// ones of at most `partition_size` sectors. The sectors must not be faulty and the
    /// deadline must not be open for proving.
    ///
    /// Returns the power of the added sectors. That power is not yet active unless
    /// `proven` is set.
    pub fn add_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        partition_size: u64,
        proven: bool,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<PowerPair, ActorError> {
        if sectors.is_empty() {
            return Ok(PowerPair::zero());
        }

        let (power, expirations) = update_partitions(store, &mut self.partitions, |partitions| {
            let mut power = PowerPair::zero();
            let mut expirations = Vec::<(ChainEpoch, u64)>::with_capacity(sectors.len());
            let mut remaining = sectors;
            let mut partition_idx = partitions.count().saturating_sub(1);

            while !remaining.is_empty() {
                let mut partition = match partitions.get(partition_idx)? {
                    Some(existing) => existing.clone(),
                    None => Partition::new(store)?,
                };
                let room = partition_size.saturating_sub(partition.sectors.len());
                if room > 0 {
                    let take = remaining.len().min(room as usize);
                    let (batch, rest) = remaining.split_at(take);
                    power += &partition.add_sectors(store, proven, batch, sector_size, quant)?;
                    partitions.set(partition_idx, partition)?;
                    expirations.extend(batch.iter().map(|s| (s.expiration, partition_idx)));
                    remaining = rest;
                }
                partition_idx += 1;
            }
            Ok((power, expirations))
        })?;

        update_expirations(store, &mut self.expirations_epochs, quant, |queue| {
            queue
                .add_many_to_queue_values(expirations)
                .context("failed to queue expirations of new sectors")
        })?;

        let added = sectors.len() as u64;
        self.live_sectors += added;
        self.total_sectors += added;
        Ok(power)
    }

    /// Removes partitions, renumbering the remaining ones. The removed partitions must
    /// have no faulty or unproven sectors.
    pub fn remove_partitions<BS: Blockstore>(
        &mut self,
        store: &BS,
        to_remove: &BitField,
        quant: QuantSpec,
    ) -> Result<RemovedPartitions, ActorError> {
        let old_partitions = self.partitions_amt(store)?;
        let partition_count = old_partitions.count();

        let Some(last) = to_remove.last() else {
            return Ok(RemovedPartitions::default());
        };
        if last >= partition_count {
            return Err(actor_error!(
                illegal_argument,
                "partition index {} out of range [0, {})",
                last,
                partition_count
            ));
        }

        let mut kept =
            Array::<_, Partition>::empty(store, DEADLINE_PARTITIONS_AMT_BITWIDTH, "partitions");
        let mut removed = RemovedPartitions::default();
        old_partitions.for_each(|partition_idx, partition| {
            if !to_remove.get(partition_idx) {
                return kept.set(kept.count(), partition.clone());
            }
            if !partition.faults.is_empty() {
                return Err(actor_error!(
                    illegal_argument,
                    "cannot remove partition {}: has faults",
                    partition_idx
                ));
            }
            if !partition.unproven.is_empty() {
                return Err(actor_error!(
                    illegal_argument,
                    "cannot remove partition {}: has unproven sectors",
                    partition_idx
                ));
            }
            removed.live |= &partition.live_sectors();
            removed.dead |= &partition.terminated;
            removed.power += &partition.live_power;
            Ok(())
        })?;
        self.partitions = kept.flush()?;

        let live_count = removed.live.len();
        self.live_sectors -= live_count;
        self.total_sectors -= live_count + removed.dead.len();

        update_expirations(store, &mut self.expirations_epochs, quant, |queue| {
            queue.cut(to_remove).context("failed to cut removed partitions from expiration queue")
        })?;

        Ok(removed)
    }

    /// Records newly declared faults in the listed partitions.
    /// Returns the change in active power.
    pub fn record_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration_epoch: ChainEpoch,
        partition_sectors: &mut PartitionSectorMap,
    ) -> Result<PowerPair, ActorError> {
        let (power_delta, new_faulty_power, faulted) =
            update_partitions(store, &mut self.partitions, |partitions| {
                let mut power_delta = PowerPair::zero();
                let mut new_faulty_power = PowerPair::zero();
                let mut faulted = Vec::new();
                for (partition_idx, sector_numbers) in partition_sectors.iter() {
                    let mut partition =
                        partition_at(partitions, partition_idx, ExitCode::USR_NOT_FOUND)?;
                    let (new_faults, delta, faulty) = partition
                        .record_faults(
                            store,
                            sectors,
                            sector_numbers,
                            fault_expiration_epoch,
                            sector_size,
                            quant,
                        )
                        .with_context(|| {
                            format!("failed to declare faults in partition {}", partition_idx)
                        })?;
                    power_delta += &delta;
                    new_faulty_power += &faulty;
                    if !new_faults.is_empty() {
                        faulted.push(partition_idx);
                    }
                    partitions.set(partition_idx, partition)?;
                }
                Ok((power_delta, new_faulty_power, faulted))
            })?;

        self.faulty_power += &new_faulty_power;
        self.add_expiration_partitions(store, fault_expiration_epoch, &faulted, quant)
            .context("failed to update expirations for partitions with faults")?;
        Ok(power_delta)
    }

    /// Marks faulty sectors in the listed partitions as recovering. Their power comes
    /// back only once a later PoSt proves them.
    pub fn declare_faults_recovered<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        partition_sectors: &mut PartitionSectorMap,
    ) -> Result<(), ActorError> {
        update_partitions(store, &mut self.partitions, |partitions| {
            for (partition_idx, sector_numbers) in partition_sectors.iter() {
                let mut partition =
                    partition_at(partitions, partition_idx, ExitCode::USR_NOT_FOUND)?;
                partition.declare_faults_recovered(sectors, sector_size, sector_numbers)?;
                partitions.set(partition_idx, partition)?;
            }
            Ok(())
        })
    }

    /// Closes the challenge window. Live sectors of every partition that was not proven
    /// become faulty and their pending recoveries are dropped. The partitions, sectors and
    /// proofs are then snapshotted for dispute.
    ///
    /// Returns the change in active power and the power to penalize.
    pub fn process_deadline_end<BS: Blockstore>(
        &mut self,
        store: &BS,
        quant: QuantSpec,
        fault_expiration_epoch: ChainEpoch,
        sectors: Cid,
    ) -> Result<(PowerPair, PowerPair), ActorError> {
        let posted = std::mem::take(&mut self.partitions_posted);

        let (power_delta, penalized, new_faulty_power, rescheduled) =
            update_partitions(store, &mut self.partitions, |partitions| {
                let mut power_delta = PowerPair::zero();
                let mut penalized = PowerPair::zero();
                let mut new_faulty_power = PowerPair::zero();
                let mut rescheduled = Vec::new();
                for partition_idx in (0..partitions.count()).filter(|i| !posted.get(*i)) {
                    let mut partition =
                        partition_at(partitions, partition_idx, ExitCode::USR_ILLEGAL_STATE)?;
                    if partition.live_sectors().is_empty() {
                        continue;
                    }

                    let (delta, penalty, faulty) = partition
                        .record_missed_post(store, fault_expiration_epoch, quant)
                        .with_context(|| {
                            format!("failed to record missed PoSt for partition {}", partition_idx)
                        })?;
                    // A partition that only lost recoveries has no new fault expiration.
                    if !faulty.is_zero() {
                        rescheduled.push(partition_idx);
                    }
                    partitions.set(partition_idx, partition)?;

                    power_delta += &delta;
                    penalized += &penalty;
                    new_faulty_power += &faulty;
                }
                Ok((power_delta, penalized, new_faulty_power, rescheduled))
            })?;

        self.faulty_power += &new_faulty_power;
        self.add_expiration_partitions(store, fault_expiration_epoch, &rescheduled, quant)
            .context("failed to update deadline expiration queue")?;

        self.partitions_snapshot = self.partitions;
        self.sectors_snapshot = sectors;
        self.optimistic_post_submissions_snapshot = self.optimistic_post_submissions;
        self.optimistic_post_submissions = Array::<_, WindowedPoSt>::flush_empty(
            store,
            DEADLINE_OPTIMISTIC_POST_SUBMISSIONS_AMT_BITWIDTH,
        )
        .context("failed to clear pending proofs array")?;

        Ok((power_delta, penalized))
    }

    /// Applies a window PoSt to its partitions, ahead of any proof verification. Skipped
    /// sectors become faulty, declared recoveries are restored and unproven sectors are
    /// activated. Partitions already proven in this window are passed over.
    ///
    /// The caller aborts, rolling all of this back, if the proof then fails to verify.
    pub fn record_proven_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        post_partitions: &mut [PoStPartition],
    ) -> Result<PoStResult, ActorError> {
        let requested = BitField::try_from_bits(post_partitions.iter().map(|p| p.index))
            .map_err(|_| actor_error!(illegal_argument; "partition index out of bitfield range"))?;
        if requested.len() != post_partitions.len() as u64 {
            return Err(actor_error!(illegal_argument, "duplicate partitions proven"));
        }

        let posted = &mut self.partitions_posted;
        let (result, rescheduled) = update_partitions(store, &mut self.partitions, |partitions| {
            let mut result = PoStResult::default();
            let mut rescheduled = Vec::new();
            for post in post_partitions.iter() {
                if posted.get(post.index) {
                    continue;
                }
                let mut partition = partition_at(partitions, post.index, ExitCode::USR_NOT_FOUND)?;

                // Skipped faults come first so recovery and activation see them.
                let (skip_delta, new_faulty, retracted, has_new_faults) = partition
                    .record_skipped_faults(
                        store,
                        sectors,
                        sector_size,
                        quant,
                        fault_expiration,
                        &post.skipped,
                    )
                    .with_context(|| {
                        format!("failed to add skipped faults to partition {}", post.index)
                    })?;
                if has_new_faults {
                    rescheduled.push(post.index);
                }
                let recovered = partition
                    .recover_faults(store, sectors, sector_size, quant)
                    .with_context(|| {
                        format!("failed to recover faulty sectors for partition {}", post.index)
                    })?;
                let activated = partition.activate_unproven();

                result.power_delta += &(&(&skip_delta + &activated) + &recovered);
                result.new_faulty_power += &new_faulty;
                result.retracted_recovery_power += &retracted;
                result.recovered_power += &recovered;
                result.sectors |= &partition.sectors;
                result.ignored_sectors |= &(&partition.faults | &partition.terminated);
                result.partitions.set(post.index);

                partitions.set(post.index, partition)?;
                posted.set(post.index);
            }
            Ok((result, rescheduled))
        })?;

        self.faulty_power -= &result.recovered_power;
        self.faulty_power += &result.new_faulty_power;
        self.add_expiration_partitions(store, fault_expiration, &rescheduled, quant)
            .context("failed to update expirations for partitions with faults")?;
        Ok(result)
    }

    /// Appends an optimistically accepted proof for `partitions`.
    pub fn record_post_proofs<BS: Blockstore>(
        &mut self,
        store: &BS,
        partitions: &BitField,
        proofs: &[PoStProof],
    ) -> Result<(), ActorError> {
        let mut submissions =
            self.optimistic_proofs_amt(store).context("failed to load post proofs")?;
        let post = WindowedPoSt { partitions: partitions.clone(), proofs: proofs.to_vec() };
        submissions.set(submissions.count(), post).context("failed to store proof")?;
        self.optimistic_post_submissions = submissions.flush().context("failed to save proofs")?;
        Ok(())
    }

    /// Deletes proof `idx` from the last window's snapshot and returns it with its
    /// partitions. The slot is left empty so other proofs keep their indexes.
    pub fn take_post_proofs<BS: Blockstore>(
        &mut self,
        store: &BS,
        idx: u64,
    ) -> Result<(BitField, Vec<PoStProof>), ActorError> {
        let mut snapshot = self
            .optimistic_proofs_snapshot_amt(store)
            .context("failed to load post proofs snapshot amt")?;
        let post = snapshot
            .delete(idx)
            .with_context(|| format!("failed to retrieve proof {}", idx))?
            .ok_or_else(|| actor_error!(illegal_argument, "proof {} not found", idx))?;
        self.optimistic_post_submissions_snapshot =
            snapshot.flush().context("failed to save proofs")?;
        Ok((post.partitions, post.proofs))
    }

    /// Loads the sectors proved by a snapshotted window PoSt, for checking a dispute.
    ///
    /// The disputed power is the active power of the snapshot, which counts sectors
    /// activated at the close of that window and sectors that have expired since.
    pub fn load_partitions_for_dispute<BS: Blockstore>(
        &self,
        store: &BS,
        partitions: BitField,
    ) -> Result<DisputeInfo, ActorError> {
        let snapshot = self
            .partitions_snapshot_amt(store)
            .context("failed to load partitions snapshot for dispute")?;

        let mut info = DisputeInfo {
            all_sector_nos: BitField::new(),
            ignored_sector_nos: BitField::new(),
            disputed_sectors: PartitionSectorMap::default(),
            disputed_power: PowerPair::zero(),
        };
        for partition_idx in partitions.iter() {
            let partition = partition_at(&snapshot, partition_idx, ExitCode::USR_ILLEGAL_STATE)?;
            info.all_sector_nos |= &partition.sectors;
            info.ignored_sector_nos |=
                &BitField::union([&partition.faults, &partition.terminated, &partition.unproven]);
            info.disputed_sectors.add(partition_idx, &partition.active_sectors());
            info.disputed_power += &partition.active_power();
        }
        Ok(info)
    }
}
