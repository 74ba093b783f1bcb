// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_miner_runtime::test_utils::*;
use fil_storage_miner::{
    Actor, DeadlineInfo, DisputeWindowedPoStParams, Method, SectorOnChainInfo,
};
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

mod util;
use util::*;

const PERIOD_OFFSET: ChainEpoch = 100;

/// Commits and optimistically proves one sector, leaving the chain just after its deadline.
fn setup_proven_sector() -> (ActorHarness, MockRuntime, SectorOnChainInfo, DeadlineInfo) {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    h.construct_and_verify(&rt);
    rt.set_epoch(1);

    let (sector, dl_info, _) = h.commit_and_activate_sector(&rt);
    (h, rt, sector, dl_info)
}

fn dispute_raw(
    rt: &MockRuntime,
    deadline: u64,
    post_index: u64,
) -> Result<Option<IpldBlock>, fil_miner_runtime::ActorError> {
    rt.expect_validate_caller_any();
    rt.call::<Actor>(
        Method::DisputeWindowedPoSt as u64,
        IpldBlock::serialize_cbor(&DisputeWindowedPoStParams { deadline, post_index }).unwrap(),
    )
}

#[test]
fn invalid_post_is_disputed() {
    init_logging();
    let (h, rt, sector, dl_info) = setup_proven_sector();
    let power = h.power_pair_for_sectors(&[sector.clone()]);
    let (_, p_idx) = h.find_sector(&rt, sector.sector_number);

    let result = h.dispute_result(&power);
    let penalty = result.expected_penalty.clone().unwrap();
    let reward = result.expected_reward.clone().unwrap();
    assert!(penalty > reward);

    let balance_before = rt.balance.borrow().clone();
    h.dispute_window_post(&rt, &dl_info, 0, &[sector.clone()], Some(result));

    // The reporter's reward and the burnt penalty left the actor's balance.
    assert_eq!(balance_before - &penalty - &reward, *rt.balance.borrow());

    let partition = h.get_partition(&rt, dl_info.index, p_idx);
    assert!(partition.faults.get(sector.sector_number));
    assert_eq!(power, partition.faulty_power);
    let st = h.get_state(&rt);
    assert!(st.fee_debt.is_zero());

    let (summary, acc) = h.check_state_invariants(&rt);
    acc.assert_empty();
    assert!(summary.active_power.is_zero());

    // The proof was consumed by the dispute.
    rt.set_caller(h.worker);
    h.expect_query_network_info(&rt);
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "proof 0 not found",
        dispute_raw(&rt, dl_info.index, 0),
    );
    rt.verify();
}

#[test]
fn valid_post_cannot_be_disputed() {
    let (h, rt, sector, dl_info) = setup_proven_sector();
    h.dispute_window_post(&rt, &dl_info, 0, &[sector.clone()], None);

    // Nothing changed, and the proof may be disputed again.
    let (_, p_idx) = h.find_sector(&rt, sector.sector_number);
    let partition = h.get_partition(&rt, dl_info.index, p_idx);
    assert!(partition.faults.is_empty());
    let deadline = h.get_deadline(&rt, dl_info.index);
    assert!(h.get_submitted_proof(&rt, &deadline, 0).partitions.get(p_idx));
    h.assert_invariants(&rt);
}

#[test]
fn dispute_only_within_dispute_window() {
    let (h, rt, _, dl_info) = setup_proven_sector();

    // Past the dispute window, counted from the close of the challenge window.
    rt.set_epoch(dl_info.close + rt.policy.wpost_dispute_window);
    rt.set_caller(h.worker);
    h.expect_query_network_info(&rt);
    expect_abort_contains_message(
        ExitCode::USR_FORBIDDEN,
        "can only dispute window posts during the dispute window",
        dispute_raw(&rt, dl_info.index, 0),
    );
    rt.verify();

    // While the deadline is open again in the next period.
    rt.set_epoch(dl_info.open + rt.policy.wpost_proving_period);
    h.expect_query_network_info(&rt);
    expect_abort(ExitCode::USR_FORBIDDEN, dispute_raw(&rt, dl_info.index, 0));
    rt.verify();
}

#[test]
fn dispute_of_missing_proof_fails() {
    let (h, rt, _, dl_info) = setup_proven_sector();
    rt.set_caller(h.worker);
    h.expect_query_network_info(&rt);
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "proof 3 not found",
        dispute_raw(&rt, dl_info.index, 3),
    );
    rt.verify();
}

#[test]
fn rejects_dispute_of_invalid_deadline() {
    let (_, rt, _, _) = setup_proven_sector();
    let deadlines = rt.policy.wpost_period_deadlines;
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "invalid deadline",
        dispute_raw(&rt, deadlines, 0),
    );
    rt.verify();
}
