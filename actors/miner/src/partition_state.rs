// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::ops;

use cid::Cid;
use fil_miner_runtime::{actor_error, ActorContext, ActorError, Array};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::bigint::bigint_ser;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorSize, StoragePower};
use num_traits::Zero;

use super::{qa_power_for_sector, BitFieldQueue, QuantSpec, SectorOnChainInfo, Sectors};

pub const PARTITION_EXPIRATION_AMT_BITWIDTH: u32 = 4;

/// A group of sectors proven together by one window PoSt.
///
/// Each sector is in `sectors` for the life of the partition. `faults`, `recoveries`,
/// `unproven` and `terminated` are subsets of it, with `recoveries` inside `faults` and
/// neither of those touching `terminated`.
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct Partition {
    pub sectors: BitField,
    /// Added but not yet covered by a window PoSt. Cleared by the next proof of the
    /// partition, or turned into faults if the deadline closes without one.
    pub unproven: BitField,
    pub faults: BitField,
    /// Faults the owner expects to prove at the next window PoSt.
    pub recoveries: BitField,
    pub terminated: BitField,
    /// Queue of sector numbers by committed expiration, quantized to the deadline.
    pub expirations_epochs: Cid,
    /// Queue of faulty sector numbers by the epoch their fault runs out.
    pub fault_expirations: Cid,

    /// Power of every sector not yet terminated.
    pub live_power: PowerPair,
    pub unproven_power: PowerPair,
    /// Never more than `live_power`.
    pub faulty_power: PowerPair,
    /// Never more than `faulty_power`.
    pub recovering_power: PowerPair,
}

/// Sectors leaving a partition when their expiration, or their fault expiration, comes due.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpirationSet {
    /// Reached their committed expiration.
    pub on_time_sectors: BitField,
    /// Faulty for longer than allowed.
    pub early_sectors: BitField,
    pub on_time_pledge: TokenAmount,
    pub early_pledge: TokenAmount,
    /// Power that was counting towards the miner's claim.
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    /// Infos of the early sectors, for computing termination fees
    pub early_sector_infos: Vec<SectorOnChainInfo>,
}

impl ExpirationSet {
    pub fn empty() -> Self {
        Default::default()
    }

    pub fn add(&mut self, other: ExpirationSet) {
        self.on_time_sectors |= &other.on_time_sectors;
        self.early_sectors |= &other.early_sectors;
        self.on_time_pledge += &other.on_time_pledge;
        self.early_pledge += &other.early_pledge;
        self.active_power += &other.active_power;
        self.faulty_power += &other.faulty_power;
        self.early_sector_infos.extend(other.early_sector_infos);
    }

    pub fn len(&self) -> u64 {
        self.on_time_sectors.len() + self.early_sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.on_time_sectors.is_empty() && self.early_sectors.is_empty()
    }

    /// Total power leaving, regardless of whether it was active.
    pub fn total_power(&self) -> PowerPair {
        &self.active_power + &self.faulty_power
    }
}

/// Loads the queue at `root`, applies `f` and stores the new root.
fn update_queue<'db, BS: Blockstore>(
    store: &'db BS,
    root: &mut Cid,
    quant: QuantSpec,
    name: &'static str,
    f: impl FnOnce(&mut BitFieldQueue<'db, BS>) -> Result<(), ActorError>,
) -> Result<(), ActorError> {
    let mut queue =
        BitFieldQueue::new(store, root, quant).with_context(|| format!("failed to load {}", name))?;
    f(&mut queue).with_context(|| format!("failed to update {}", name))?;
    *root = queue.flush().with_context(|| format!("failed to save {}", name))?;
    Ok(())
}

impl Partition {
    pub fn new<BS: Blockstore>(store: &BS) -> Result<Self, ActorError> {
        let empty_queue =
            Array::<_, BitField>::flush_empty(store, PARTITION_EXPIRATION_AMT_BITWIDTH)
                .context("failed to create empty partition queue")?;

        Ok(Self {
            sectors: BitField::new(),
            unproven: BitField::new(),
            faults: BitField::new(),
            recoveries: BitField::new(),
            terminated: BitField::new(),
            expirations_epochs: empty_queue,
            fault_expirations: empty_queue,
            live_power: PowerPair::zero(),
            unproven_power: PowerPair::zero(),
            faulty_power: PowerPair::zero(),
            recovering_power: PowerPair::zero(),
        })
    }

    /// Sectors not terminated. They may be faulty or unproven.
    pub fn live_sectors(&self) -> BitField {
        &self.sectors - &self.terminated
    }

    /// Live sectors that are neither faulty nor unproven.
    pub fn active_sectors(&self) -> BitField {
        &(&self.live_sectors() - &self.faults) - &self.unproven
    }

    pub fn active_power(&self) -> PowerPair {
        &(&self.live_power - &self.faulty_power) - &self.unproven_power
    }

    fn require_sectors(&self, sector_numbers: &BitField) -> Result<(), ActorError> {
        if !self.sectors.contains_all(sector_numbers) {
            return Err(actor_error!(illegal_argument; "not all sectors are assigned to the partition"));
        }
        Ok(())
    }

    /// Adds healthy new sectors and queues their expirations. Unless `proven` is set they
    /// start out unproven.
    ///
    /// Returns the power of the added sectors.
    pub fn add_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        proven: bool,
        sectors: &[SectorOnChainInfo],
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<PowerPair, ActorError> {
        let added = BitField::try_from_bits(sectors.iter().map(|s| s.sector_number))
            .map_err(|e| actor_error!(illegal_argument; "invalid sector numbers: {}", e))?;
        if added.len() != sectors.len() as u64 {
            return Err(actor_error!(illegal_argument; "duplicate sectors added to partition"));
        }
        if self.sectors.contains_any(&added) {
            return Err(actor_error!(illegal_argument; "not all added sectors are new"));
        }

        update_queue(store, &mut self.expirations_epochs, quant, "sector expirations", |q| {
            q.add_many_to_queue_values(sectors.iter().map(|s| (s.expiration, s.sector_number)))
        })?;

        let power = power_for_sectors(sector_size, sectors);
        self.live_power += &power;
        if !proven {
            self.unproven |= &added;
            self.unproven_power += &power;
        }
        self.sectors |= &added;
        Ok(power)
    }

    /// Moves sectors that are neither faulty nor recovering into the faults and queues
    /// their fault expiration. Unproven sectors among them stop being unproven.
    ///
    /// Returns the change in active power and the newly faulty power.
    fn mark_faulty<BS: Blockstore>(
        &mut self,
        store: &BS,
        sector_numbers: &BitField,
        infos: &[SectorOnChainInfo],
        fault_expiration: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<(PowerPair, PowerPair), ActorError> {
        if sector_numbers.is_empty() {
            return Ok((PowerPair::zero(), PowerPair::zero()));
        }

        update_queue(store, &mut self.fault_expirations, quant, "fault queue", |q| {
            q.add_to_queue(fault_expiration, sector_numbers)
        })?;

        let faulty = power_for_sectors(sector_size, infos);
        let was_unproven = sector_numbers & &self.unproven;
        let unproven_power =
            sum_power(sector_size, infos.iter().filter(|s| was_unproven.get(s.sector_number)));
        // Only sectors that were counting towards power lose any.
        let active_lost = &faulty - &unproven_power;

        self.faults |= sector_numbers;
        self.faulty_power += &faulty;
        self.unproven = &self.unproven - &was_unproven;
        self.unproven_power -= &unproven_power;

        Ok((-active_lost, faulty))
    }

    /// Drops `sector_numbers` from the recoveries, returning the power they carried.
    fn retract_recoveries<BS: Blockstore>(
        &mut self,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        sector_numbers: &BitField,
    ) -> Result<PowerPair, ActorError> {
        if sector_numbers.is_empty() {
            return Ok(PowerPair::zero());
        }
        let infos =
            sectors.load_sector(sector_numbers).context("failed to load retracted recoveries")?;
        let power = power_for_sectors(sector_size, &infos);
        self.recoveries = &self.recoveries - sector_numbers;
        self.recovering_power -= &power;
        Ok(power)
    }

    /// Declares sectors faulty. Sectors already faulty or terminated are left alone, and
    /// a declared recovery among them is withdrawn.
    ///
    /// Returns the new faults, the change in active power and the newly faulty power.
    pub fn record_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_numbers: &BitField,
        fault_expiration_epoch: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<(BitField, PowerPair, PowerPair), ActorError> {
        self.require_sectors(sector_numbers).map_err(|e| e.wrap("failed fault declaration"))?;

        let retracted = &self.recoveries & sector_numbers;
        let new_faults = &(&(sector_numbers - &retracted) - &self.terminated) - &self.faults;

        let infos = sectors.load_sector(&new_faults).context("failed to load fault sectors")?;
        let (power_delta, new_faulty_power) = self.mark_faulty(
            store,
            &new_faults,
            &infos,
            fault_expiration_epoch,
            sector_size,
            quant,
        )?;
        self.retract_recoveries(sectors, sector_size, &retracted)?;

        Ok((new_faults, power_delta, new_faulty_power))
    }

    /// Clears every declared recovery from the faults and cancels its fault expiration.
    /// The committed expirations stay queued.
    ///
    /// Returns the recovered power.
    pub fn recover_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<PowerPair, ActorError> {
        if self.recoveries.is_empty() {
            return Ok(PowerPair::zero());
        }

        let recovering = std::mem::take(&mut self.recoveries);
        let infos =
            sectors.load_sector(&recovering).context("failed to load recovered sectors")?;
        update_queue(store, &mut self.fault_expirations, quant, "fault queue", |q| {
            q.remove(&recovering)
        })?;

        let power = power_for_sectors(sector_size, &infos);
        self.faults = &self.faults - &recovering;
        self.faulty_power -= &power;
        self.recovering_power -= &power;
        Ok(power)
    }

    /// Activates unproven sectors, returning the activated power.
    pub fn activate_unproven(&mut self) -> PowerPair {
        self.unproven = BitField::default();
        std::mem::take(&mut self.unproven_power)
    }

    /// Declares faulty sectors as recovering. Sectors that are not faulty or already
    /// recovering are skipped.
    pub fn declare_faults_recovered<BS: Blockstore>(
        &mut self,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        sector_numbers: &BitField,
    ) -> Result<(), ActorError> {
        self.require_sectors(sector_numbers).map_err(|e| e.wrap("failed fault declaration"))?;

        let recoveries = &(sector_numbers & &self.faults) - &self.recoveries;
        let infos =
            sectors.load_sector(&recoveries).context("failed to load recovery sectors")?;
        self.recovering_power += &power_for_sectors(sector_size, &infos);
        self.recoveries |= &recoveries;
        Ok(())
    }

    /// Faults every live sector after a missed window PoSt and drops the recoveries.
    /// Sectors not already faulty get a fault expiration.
    ///
    /// Returns the change in active power, the power to penalize (new faults plus failed
    /// recoveries) and the newly faulty power.
    pub fn record_missed_post<BS: Blockstore>(
        &mut self,
        store: &BS,
        fault_expiration: ChainEpoch,
        quant: QuantSpec,
    ) -> Result<(PowerPair, PowerPair, PowerPair), ActorError> {
        let live = self.live_sectors();
        let new_faults = &live - &self.faults;
        update_queue(store, &mut self.fault_expirations, quant, "fault queue", |q| {
            q.add_to_queue(fault_expiration, &new_faults)
        })?;

        let new_faulty_power = &self.live_power - &self.faulty_power;
        let penalized = &new_faulty_power + &std::mem::take(&mut self.recovering_power);
        // Unproven sectors had no power to lose.
        let power_delta = &std::mem::take(&mut self.unproven_power) - &new_faulty_power;

        self.faults = live;
        self.faulty_power = self.live_power.clone();
        self.recoveries = BitField::new();
        self.unproven = BitField::new();

        Ok((power_delta, penalized, new_faulty_power))
    }

    /// Terminates sectors whose committed expiration, or fault expiration, falls at or
    /// before `until`, taking each out of both queues.
    ///
    /// Returns the expired sectors, split into on-time and early, with their pledge and power.
    pub fn pop_expired_sectors<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        until: ChainEpoch,
        sector_size: SectorSize,
        quant: QuantSpec,
    ) -> Result<ExpirationSet, ActorError> {
        let mut on_time_queue = BitFieldQueue::new(store, &self.expirations_epochs, quant)
            .context("failed to load expiration queue")?;
        let mut fault_queue = BitFieldQueue::new(store, &self.fault_expirations, quant)
            .context("failed to load fault expiration queue")?;

        let (due_on_time, on_time_changed) =
            on_time_queue.pop_until(until).context("failed to pop expiration queue")?;
        let (due_faults, faults_changed) =
            fault_queue.pop_until(until).context("failed to pop fault expiration queue")?;
        if !on_time_changed && !faults_changed {
            return Ok(ExpirationSet::empty());
        }

        let on_time_sectors = &due_on_time - &self.terminated;
        let early_sectors =
            &(&(&due_faults - &self.terminated) - &on_time_sectors) & &self.faults;

        fault_queue.remove(&on_time_sectors).context("failed to drop on-time fault entries")?;
        on_time_queue.remove(&early_sectors).context("failed to drop early expiration entries")?;
        self.expirations_epochs =
            on_time_queue.flush().context("failed to save expiration queue")?;
        self.fault_expirations =
            fault_queue.flush().context("failed to save fault expiration queue")?;

        let expired = &on_time_sectors | &early_sectors;
        if expired.is_empty() {
            return Ok(ExpirationSet::empty());
        }
        let infos = sectors.load_sector(&expired).context("failed to load expired sectors")?;

        let mut result = ExpirationSet { on_time_sectors, early_sectors, ..Default::default() };
        let mut unproven_power = PowerPair::zero();
        let mut recovering_power = PowerPair::zero();
        for info in infos {
            let number = info.sector_number;
            let power = power_for_sector(sector_size, &info);
            if self.faults.get(number) {
                result.faulty_power += &power;
                if self.recoveries.get(number) {
                    recovering_power += &power;
                }
            } else if self.unproven.get(number) {
                unproven_power += &power;
            } else {
                result.active_power += &power;
            }

            if result.on_time_sectors.get(number) {
                result.on_time_pledge += &info.initial_pledge;
            } else {
                result.early_pledge += &info.initial_pledge;
                result.early_sector_infos.push(info);
            }
        }

        self.terminated |= &expired;
        self.faults = &self.faults - &expired;
        self.recoveries = &self.recoveries - &expired;
        self.unproven = &self.unproven - &expired;

        self.live_power -= &(&result.total_power() + &unproven_power);
        self.faulty_power -= &result.faulty_power;
        self.recovering_power -= &recovering_power;
        self.unproven_power -= &unproven_power;

        Ok(result)
    }

    /// Faults the sectors a window PoSt skipped. Skipped sectors already faulty or
    /// terminated are ignored, and skipped recoveries are withdrawn.
    ///
    /// Returns the change in active power, the newly faulty power, the power of withdrawn
    /// recoveries and whether any new fault was recorded.
    pub fn record_skipped_faults<BS: Blockstore>(
        &mut self,
        store: &BS,
        sectors: &Sectors<'_, BS>,
        sector_size: SectorSize,
        quant: QuantSpec,
        fault_expiration: ChainEpoch,
        skipped: &BitField,
    ) -> Result<(PowerPair, PowerPair, PowerPair, bool), ActorError> {
        if skipped.is_empty() {
            return Ok(Default::default());
        }
        if !self.sectors.contains_all(skipped) {
            return Err(
                actor_error!(illegal_argument; "skipped faults contains sectors outside partition"),
            );
        }

        let retracted = &self.recoveries & skipped;
        let retracted_power = self.retract_recoveries(sectors, sector_size, &retracted)?;

        let new_faults = &(skipped - &self.terminated) - &self.faults;
        let infos = sectors.load_sector(&new_faults).context("failed to load skipped sectors")?;
        let (power_delta, new_fault_power) = self
            .mark_faulty(store, &new_faults, &infos, fault_expiration, sector_size, quant)
            .context("failed to add skipped faults")?;

        Ok((power_delta, new_fault_power, retracted_power, !infos.is_empty()))
    }
}

fn sum_power<'a>(
    sector_size: SectorSize,
    sectors: impl IntoIterator<Item = &'a SectorOnChainInfo>,
) -> PowerPair {
    sectors.into_iter().fold(PowerPair::zero(), |mut total, sector| {
        total += &power_for_sector(sector_size, sector);
        total
    })
}

/// Returns the raw and quality-adjusted power of one sector.
pub fn power_for_sector(sector_size: SectorSize, sector: &SectorOnChainInfo) -> PowerPair {
    PowerPair {
        raw: StoragePower::from(sector_size as u64),
        qa: qa_power_for_sector(sector_size, sector),
    }
}

pub fn power_for_sectors(sector_size: SectorSize, sectors: &[SectorOnChainInfo]) -> PowerPair {
    sum_power(sector_size, sectors)
}

/// Raw byte and quality-adjusted power, always moved together.
#[derive(Serialize_tuple, Deserialize_tuple, Eq, PartialEq, Clone, Debug, Default)]
pub struct PowerPair {
    #[serde(with = "bigint_ser")]
    pub raw: StoragePower,
    #[serde(with = "bigint_ser")]
    pub qa: StoragePower,
}

impl PowerPair {
    pub fn zero() -> Self {
        Default::default()
    }

    pub fn is_zero(&self) -> bool {
        self.raw.is_zero() && self.qa.is_zero()
    }
}

macro_rules! power_pair_arith {
    ($op:ident::$method:ident, $op_assign:ident::$method_assign:ident) => {
        impl ops::$op for &PowerPair {
            type Output = PowerPair;

            fn $method(self, rhs: Self) -> PowerPair {
                PowerPair {
                    raw: ops::$op::$method(&self.raw, &rhs.raw),
                    qa: ops::$op::$method(&self.qa, &rhs.qa),
                }
            }
        }

        impl ops::$op_assign<&PowerPair> for PowerPair {
            fn $method_assign(&mut self, rhs: &PowerPair) {
                ops::$op_assign::$method_assign(&mut self.raw, &rhs.raw);
                ops::$op_assign::$method_assign(&mut self.qa, &rhs.qa);
            }
        }
    };
}

power_pair_arith!(Add::add, AddAssign::add_assign);
power_pair_arith!(Sub::sub, SubAssign::sub_assign);

impl ops::Neg for PowerPair {
    type Output = PowerPair;

    fn neg(self) -> PowerPair {
        PowerPair { raw: -self.raw, qa: -self.qa }
    }
}

impl ops::Neg for &PowerPair {
    type Output = PowerPair;

    fn neg(self) -> PowerPair {
        -self.clone()
    }
}
