// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fil_miner_runtime::runtime::Policy;
use fil_miner_runtime::{Array, MessageAccumulator};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::CborStore;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorNumber, SectorSize};
use num_traits::Zero;

use crate::{
    power_for_sectors, Deadline, Partition, PowerPair, SectorOnChainInfo,
    SectorPreCommitOnChainInfo, State,
};

/// Where each sector lives, and the power totals across all deadlines.
#[derive(Default)]
pub struct StateSummary {
    pub sector_locations: BTreeMap<SectorNumber, (u64, u64)>,
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
}

/// Checks internal invariants of miner state.
pub fn check_state_invariants<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    balance: &TokenAmount,
) -> (StateSummary, MessageAccumulator) {
    let acc = MessageAccumulator::default();
    let mut summary = StateSummary::default();

    check_balances(state, balance, &acc);

    let info = match state.get_info(store) {
        Ok(info) => info,
        Err(e) => {
            acc.add(&format!("error loading miner info: {}", e));
            return (summary, acc);
        }
    };

    let allocated: BitField = match store.get_cbor(&state.allocated_sectors) {
        Ok(Some(bf)) => bf,
        _ => {
            acc.add("error loading allocated sector numbers");
            BitField::new()
        }
    };

    let mut all_sectors = BTreeMap::<SectorNumber, SectorOnChainInfo>::new();
    match Array::<_, SectorOnChainInfo>::load(store, &state.sectors, "sectors") {
        Ok(sectors) => {
            let ret = sectors.for_each(|sector_number, sector| {
                acc.require(
                    sector_number == sector.sector_number,
                    &format!("sector {} stored under key {}", sector.sector_number, sector_number),
                );
                acc.require(
                    allocated.get(sector_number),
                    &format!("sector {} not marked allocated", sector_number),
                );
                all_sectors.insert(sector_number, sector.clone());
                Ok(())
            });
            acc.require_no_error(ret, "error iterating sectors");
        }
        Err(e) => acc.add(&format!("error loading sectors: {}", e)),
    }

    check_pre_commits(state, store, &allocated, &all_sectors, &acc);

    let mut live_pledge = TokenAmount::zero();
    match state.load_deadlines(store) {
        Ok(deadlines) => {
            let ret = deadlines.for_each(store, |deadline_idx, deadline| {
                let acc = acc.with_prefix(&format!("deadline {}: ", deadline_idx));
                check_deadline(
                    policy,
                    store,
                    deadline_idx,
                    &deadline,
                    info.sector_size,
                    &all_sectors,
                    &mut summary,
                    &mut live_pledge,
                    &acc,
                );
                Ok(())
            });
            acc.require_no_error(ret, "error iterating deadlines");
        }
        Err(e) => acc.add(&format!("error loading deadlines: {}", e)),
    }

    acc.require(
        live_pledge == state.initial_pledge,
        &format!(
            "initial pledge {} does not match the sum {} over live sectors",
            state.initial_pledge, live_pledge
        ),
    );

    (summary, acc)
}

fn check_balances(state: &State, balance: &TokenAmount, acc: &MessageAccumulator) {
    acc.require(
        !state.pre_commit_deposits.is_negative(),
        &format!("pre-commit deposit is negative: {}", state.pre_commit_deposits),
    );
    acc.require(
        !state.initial_pledge.is_negative(),
        &format!("initial pledge is negative: {}", state.initial_pledge),
    );
    acc.require(
        !state.fee_debt.is_negative(),
        &format!("fee debt is negative: {}", state.fee_debt),
    );

    let locked = &state.pre_commit_deposits + &state.initial_pledge;
    acc.require(
        balance >= &locked,
        &format!("balance {} below deposits and pledge {}", balance, locked),
    );
}

fn check_pre_commits<BS: Blockstore>(
    state: &State,
    store: &BS,
    allocated: &BitField,
    sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    acc: &MessageAccumulator,
) {
    let precommits = match Array::<_, SectorPreCommitOnChainInfo>::load(
        store,
        &state.pre_committed_sectors,
        "precommits",
    ) {
        Ok(precommits) => precommits,
        Err(e) => {
            acc.add(&format!("error loading pre-committed sectors: {}", e));
            return;
        }
    };

    let mut deposits = TokenAmount::zero();
    let ret = precommits.for_each(|sector_number, precommit| {
        acc.require(
            sector_number == precommit.info.sector_number,
            &format!(
                "pre-commit {} stored under key {}",
                precommit.info.sector_number, sector_number
            ),
        );
        acc.require(
            allocated.get(sector_number),
            &format!("pre-committed sector {} not marked allocated", sector_number),
        );
        acc.require(
            !sectors.contains_key(&sector_number),
            &format!("sector {} both pre-committed and proven", sector_number),
        );
        deposits += &precommit.pre_commit_deposit;
        Ok(())
    });
    acc.require_no_error(ret, "error iterating pre-committed sectors");

    acc.require(
        deposits == state.pre_commit_deposits,
        &format!(
            "pre-commit deposits {} do not match the sum {} over pre-commits",
            state.pre_commit_deposits, deposits
        ),
    );
}

#[allow(clippy::too_many_arguments)]
fn check_deadline<BS: Blockstore>(
    policy: &Policy,
    store: &BS,
    deadline_idx: u64,
    deadline: &Deadline,
    sector_size: SectorSize,
    all_sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    summary: &mut StateSummary,
    live_pledge: &mut TokenAmount,
    acc: &MessageAccumulator,
) {
    let partitions = match deadline.partitions_amt(store) {
        Ok(partitions) => partitions,
        Err(e) => {
            acc.add(&format!("error loading partitions: {}", e));
            return;
        }
    };

    acc.require(
        partitions.count() <= policy.max_partitions_per_deadline,
        &format!(
            "{} partitions exceed the limit {}",
            partitions.count(),
            policy.max_partitions_per_deadline
        ),
    );
    for posted in deadline.partitions_posted.iter() {
        acc.require(
            posted < partitions.count(),
            &format!("posted partition {} does not exist", posted),
        );
    }

    let mut live_sectors = 0;
    let mut total_sectors = 0;
    let mut faulty_power = PowerPair::zero();

    let ret = partitions.for_each(|partition_idx, partition| {
        let acc = acc.with_prefix(&format!("partition {}: ", partition_idx));
        let sectors = check_partition(partition, sector_size, all_sectors, &acc);

        for sector in &sectors {
            if let Some(prev) =
                summary.sector_locations.insert(sector.sector_number, (deadline_idx, partition_idx))
            {
                acc.add(&format!(
                    "sector {} also assigned to deadline {} partition {}",
                    sector.sector_number, prev.0, prev.1
                ));
            }
            *live_pledge += &sector.initial_pledge;
        }

        live_sectors += partition.live_sectors().len();
        total_sectors += partition.sectors.len();
        faulty_power += &partition.faulty_power;

        summary.live_power += &partition.live_power;
        summary.active_power += &partition.active_power();
        summary.faulty_power += &partition.faulty_power;
        Ok(())
    });
    acc.require_no_error(ret, "error iterating partitions");

    acc.require(
        live_sectors == deadline.live_sectors,
        &format!("live sectors {} recorded as {}", live_sectors, deadline.live_sectors),
    );
    acc.require(
        total_sectors == deadline.total_sectors,
        &format!("total sectors {} recorded as {}", total_sectors, deadline.total_sectors),
    );
    acc.require(
        faulty_power == deadline.faulty_power,
        &format!("faulty power {:?} recorded as {:?}", faulty_power, deadline.faulty_power),
    );
}

/// Checks the partition's sector sets and power, returning the infos of its live sectors.
fn check_partition(
    partition: &Partition,
    sector_size: SectorSize,
    all_sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
    acc: &MessageAccumulator,
) -> Vec<SectorOnChainInfo> {
    let live = partition.live_sectors();

    acc.require(partition.sectors.contains_all(&partition.terminated), "terminated not in sectors");
    acc.require(live.contains_all(&partition.faults), "faults not live");
    acc.require(live.contains_all(&partition.unproven), "unproven not live");
    acc.require(partition.faults.contains_all(&partition.recoveries), "recoveries not faulty");
    acc.require(
        !partition.faults.contains_any(&partition.unproven),
        "sectors both faulty and unproven",
    );

    let infos_of = |bf: &BitField| -> Vec<SectorOnChainInfo> {
        bf.iter()
            .filter_map(|n| {
                let info = all_sectors.get(&n).cloned();
                acc.require(info.is_some(), &format!("sector {} missing from sectors", n));
                info
            })
            .collect()
    };

    let live_infos = infos_of(&live);
    let power_of = |bf: &BitField| -> PowerPair {
        let infos: Vec<_> = live_infos.iter().filter(|s| bf.get(s.sector_number)).cloned().collect();
        power_for_sectors(sector_size, &infos)
    };

    acc.require(
        power_for_sectors(sector_size, &live_infos) == partition.live_power,
        &format!("live power does not match live sectors, recorded {:?}", partition.live_power),
    );
    acc.require(
        power_of(&partition.unproven) == partition.unproven_power,
        &format!("unproven power mismatch, recorded {:?}", partition.unproven_power),
    );
    acc.require(
        power_of(&partition.faults) == partition.faulty_power,
        &format!("faulty power mismatch, recorded {:?}", partition.faulty_power),
    );
    acc.require(
        power_of(&partition.recoveries) == partition.recovering_power,
        &format!("recovering power mismatch, recorded {:?}", partition.recovering_power),
    );

    live_infos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_below_locked_funds_is_reported() {
        let acc = MessageAccumulator::default();
        let state = State {
            info: cid::Cid::default(),
            pre_commit_deposits: TokenAmount::from_atto(10),
            initial_pledge: TokenAmount::from_atto(5),
            fee_debt: TokenAmount::zero(),
            pre_committed_sectors: cid::Cid::default(),
            pre_committed_sectors_cleanup: cid::Cid::default(),
            allocated_sectors: cid::Cid::default(),
            sectors: cid::Cid::default(),
            proving_period_start: 0,
            current_deadline: 0,
            deadlines: cid::Cid::default(),
            deadline_cron_active: false,
        };
        check_balances(&state, &TokenAmount::from_atto(15), &acc);
        acc.assert_empty();
        check_balances(&state, &TokenAmount::from_atto(14), &acc);
        acc.assert_expected(&["below deposits and pledge"]);
    }
}
