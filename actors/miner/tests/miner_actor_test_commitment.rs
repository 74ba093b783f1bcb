// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fil_miner_runtime::network::EPOCHS_IN_DAY;
use fil_miner_runtime::test_utils::*;
use fil_miner_runtime::STORAGE_POWER_ACTOR_ADDR;
use fil_storage_miner::ext::market::VerifyDealsForActivationReturn;
use fil_storage_miner::{
    Actor, ConfirmSectorProofsParams, Method, PreCommitSectorParams, ProveCommitSectorParams,
};
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::RegisteredSealProof;
use num_traits::Zero;
use test_case::test_case;

mod util;
use util::*;

const PERIOD_OFFSET: ChainEpoch = 100;

fn setup() -> (ActorHarness, MockRuntime) {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    h.construct_and_verify(&rt);
    rt.set_epoch(1);
    (h, rt)
}

#[test]
fn precommit_then_prove_commit_and_confirm() {
    init_logging();
    let (h, rt) = setup();
    let precommit_epoch = rt.epoch.get();
    let expiration = h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION);

    let params = h.make_pre_commit_params(100, precommit_epoch - 1, expiration, vec![]);
    let precommit = h.pre_commit_sector(&rt, params, PreCommitConfig::default(), true);

    assert_eq!(precommit_epoch, precommit.pre_commit_epoch);
    assert!(precommit.pre_commit_deposit.is_positive());
    let st = h.get_state(&rt);
    assert_eq!(precommit.pre_commit_deposit, st.pre_commit_deposits);
    assert!(st.deadline_cron_active);
    h.assert_invariants(&rt);

    let prove_epoch = precommit_epoch + rt.policy.pre_commit_challenge_delay + 1;
    h.advance_to_epoch_with_cron(&rt, prove_epoch);

    let expected_pledge = h.expected_initial_pledge(&rt, &precommit);
    let sector = h.prove_commit_sector_and_confirm(
        &rt,
        &precommit,
        h.make_prove_commit_params(100),
        ProveCommitConfig::default(),
    );

    assert_eq!(prove_epoch, sector.activation);
    assert_eq!(expiration, sector.expiration);
    assert_eq!(expected_pledge, sector.initial_pledge);
    assert!(sector.deal_weight.is_zero());

    let st = h.get_state(&rt);
    assert!(st.pre_commit_deposits.is_zero());
    assert_eq!(expected_pledge, st.initial_pledge);
    assert!(st.get_precommitted_sector(&rt.store, 100).unwrap().is_none());

    // The new sector waits, unproven, on a deadline until its first PoSt.
    let (dl_idx, p_idx) = h.find_sector(&rt, 100);
    let deadline = h.get_deadline(&rt, dl_idx);
    assert_eq!(1, deadline.live_sectors);
    assert_eq!(1, deadline.total_sectors);
    let partition = h.get_partition(&rt, dl_idx, p_idx);
    assert!(partition.sectors.get(100));
    assert!(partition.unproven.get(100));
    assert!(partition.faults.is_empty());
    assert_eq!(h.power_pair_for_sectors(&[sector]), partition.unproven_power);

    let (summary, acc) = h.check_state_invariants(&rt);
    acc.assert_empty();
    assert_eq!(Some(&(dl_idx, p_idx)), summary.sector_locations.get(&100));
    assert!(summary.active_power.is_zero());
}

#[test]
fn sectors_spread_across_deadlines() {
    let (mut h, rt) = setup();
    let sectors = h.commit_and_prove_sectors(&rt, 3, DEFAULT_SECTOR_EXPIRATION, true);

    // Each sector fills the least loaded deadline, so three sectors land on three deadlines.
    let mut deadlines: Vec<u64> =
        sectors.iter().map(|s| h.find_sector(&rt, s.sector_number).0).collect();
    deadlines.sort_unstable();
    deadlines.dedup();
    assert_eq!(3, deadlines.len());

    // The current and next deadlines are never assigned.
    let current = h.get_deadline_info(&rt).index;
    let next = (current + 1) % rt.policy.wpost_period_deadlines;
    assert!(!deadlines.contains(&current));
    assert!(!deadlines.contains(&next));

    h.assert_invariants(&rt);
}

#[test]
fn rejects_duplicate_sector_number() {
    let (h, rt) = setup();
    let expiration = h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION);
    let epoch = rt.epoch.get();

    h.pre_commit_sector(
        &rt,
        h.make_pre_commit_params(100, epoch - 1, expiration, vec![]),
        PreCommitConfig::default(),
        true,
    );

    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "already been allocated",
        h.pre_commit_sector_raw(
            &rt,
            h.make_pre_commit_params(100, epoch - 1, expiration, vec![]),
            PreCommitConfig::default(),
            false,
        ),
    );
    rt.verify();
    h.assert_invariants(&rt);
}

#[test]
fn rejects_precommit_without_funds_for_deposit() {
    let (h, rt) = setup();
    rt.set_balance(TokenAmount::zero());
    let expiration = h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION);

    expect_abort_contains_message(
        ExitCode::USR_INSUFFICIENT_FUNDS,
        "insufficient funds for pre-commit deposit",
        h.pre_commit_sector_raw(
            &rt,
            h.make_pre_commit_params(100, rt.epoch.get() - 1, expiration, vec![]),
            PreCommitConfig::default(),
            false,
        ),
    );
    rt.verify();

    let st = h.get_state(&rt);
    assert!(st.pre_commit_deposits.is_zero());
    assert!(!st.deadline_cron_active);
}

#[test_case(|p, epoch| p.seal_rand_epoch = epoch, "must be before now"; "seal randomness from now")]
#[test_case(|p, epoch| p.seal_rand_epoch = epoch - (2880 + 900) - 1, "too old"; "seal randomness too old")]
#[test_case(|p, epoch| p.expiration = epoch + 100, "must be after activation"; "expires before activation")]
#[test_case(|p, epoch| p.expiration = epoch + 30 * EPOCHS_IN_DAY + 150 + 179 * EPOCHS_IN_DAY, "total sector lifetime"; "lifetime too short")]
#[test_case(|p, _| p.seal_proof = RegisteredSealProof::StackedDRG2KiBV1P1, "unsupported seal proof"; "unsupported proof")]
#[test_case(|p, _| p.sealed_cid = make_piece_cid(b"not sealed"), "wrong prefix"; "unsealed commitment")]
fn rejects_invalid_precommit(
    mutate: fn(&mut PreCommitSectorParams, ChainEpoch),
    expected_message: &str,
) {
    let (h, rt) = setup();
    rt.set_epoch(10_000);
    let epoch = rt.epoch.get();
    let mut params = h.make_pre_commit_params(
        100,
        epoch - 1,
        h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION),
        vec![],
    );
    mutate(&mut params, epoch);

    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        expected_message,
        h.pre_commit_sector_raw(&rt, params, PreCommitConfig::default(), false),
    );
    // Static checks fail before any network query is sent.
    rt.reset();

    let st = h.get_state(&rt);
    assert!(st.get_precommitted_sector(&rt.store, 100).unwrap().is_none());
}

#[test]
fn rejects_precommit_from_unknown_caller() {
    let (h, rt) = setup();
    let params = h.make_pre_commit_params(
        100,
        rt.epoch.get() - 1,
        h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION),
        vec![],
    );

    rt.set_caller(fvm_shared::address::Address::new_id(5555));
    rt.expect_validate_caller_addr(h.caller_addrs());
    expect_abort(
        ExitCode::USR_FORBIDDEN,
        rt.call::<Actor>(
            Method::PreCommitSector as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        ),
    );
    rt.verify();
}

#[test]
fn prove_commit_timing() {
    let (h, rt) = setup();
    let precommit_epoch = rt.epoch.get();
    let expiration = h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION);
    let precommit = h.pre_commit_sector(
        &rt,
        h.make_pre_commit_params(100, precommit_epoch - 1, expiration, vec![]),
        PreCommitConfig::default(),
        true,
    );

    // Not before the interactive challenge epoch has passed.
    h.advance_to_epoch_with_cron(&rt, precommit_epoch + rt.policy.pre_commit_challenge_delay);
    rt.set_caller(h.worker);
    rt.expect_validate_caller_any();
    expect_abort_contains_message(
        ExitCode::USR_FORBIDDEN,
        "too early",
        rt.call::<Actor>(
            Method::ProveCommitSector as u64,
            IpldBlock::serialize_cbor(&h.make_prove_commit_params(100)).unwrap(),
        ),
    );
    rt.verify();

    // Not after the maximum seal duration.
    rt.set_epoch(precommit_epoch + 30 * EPOCHS_IN_DAY + rt.policy.pre_commit_challenge_delay + 1);
    rt.expect_validate_caller_any();
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "too late",
        rt.call::<Actor>(
            Method::ProveCommitSector as u64,
            IpldBlock::serialize_cbor(&h.make_prove_commit_params(100)).unwrap(),
        ),
    );
    rt.verify();

    // The last epoch of the proving window is still accepted.
    rt.set_epoch(precommit_epoch + 30 * EPOCHS_IN_DAY + rt.policy.pre_commit_challenge_delay);
    h.prove_commit_sector(&rt, &precommit, h.make_prove_commit_params(100)).unwrap();
    rt.verify();
}

#[test]
fn prove_commit_requires_precommit() {
    let (h, rt) = setup();
    rt.set_caller(h.worker);
    rt.expect_validate_caller_any();
    expect_abort(
        ExitCode::USR_NOT_FOUND,
        rt.call::<Actor>(
            Method::ProveCommitSector as u64,
            IpldBlock::serialize_cbor(&h.make_prove_commit_params(42)).unwrap(),
        ),
    );
    rt.verify();
}

#[test]
fn rejects_oversized_commitment_proof() {
    let (h, rt) = setup();
    let params = ProveCommitSectorParams { sector_number: 1, proof: vec![0; 1025] };
    rt.set_caller(h.worker);
    rt.expect_validate_caller_any();
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "exceeds max size",
        rt.call::<Actor>(
            Method::ProveCommitSector as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        ),
    );
    rt.verify();
}

#[test]
fn only_power_actor_confirms_proofs() {
    let (h, rt) = setup();
    let params = ConfirmSectorProofsParams { sectors: vec![100] };

    rt.set_caller(h.worker);
    rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
    expect_abort(
        ExitCode::USR_FORBIDDEN,
        rt.call::<Actor>(
            Method::ConfirmSectorProofsValid as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        ),
    );
    rt.verify();
}

#[test]
fn deal_weight_raises_pledge() {
    let (h, rt) = setup();
    let precommit_epoch = rt.epoch.get();
    let expiration = h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION);
    let duration = expiration - precommit_epoch;

    let deal_weights = VerifyDealsForActivationReturn {
        deal_weight: BigInt::zero(),
        verified_deal_weight: BigInt::from(h.sector_size as u64) * duration / 2,
        deal_space: h.sector_size as u64,
    };
    let cc = h.pre_commit_sector(
        &rt,
        h.make_pre_commit_params(100, precommit_epoch - 1, expiration, vec![]),
        PreCommitConfig::default(),
        true,
    );
    let verified = h.pre_commit_sector(
        &rt,
        h.make_pre_commit_params(101, precommit_epoch - 1, expiration, vec![1, 2]),
        PreCommitConfig { deal_weights: deal_weights.clone() },
        false,
    );
    assert_eq!(deal_weights.verified_deal_weight, verified.verified_deal_weight);
    assert!(verified.pre_commit_deposit > cc.pre_commit_deposit);

    h.advance_to_epoch_with_cron(&rt, precommit_epoch + rt.policy.pre_commit_challenge_delay + 1);
    let cc_sector = h.prove_commit_sector_and_confirm(
        &rt,
        &cc,
        h.make_prove_commit_params(100),
        ProveCommitConfig::default(),
    );
    let verified_sector = h.prove_commit_sector_and_confirm(
        &rt,
        &verified,
        h.make_prove_commit_params(101),
        ProveCommitConfig::default(),
    );

    assert_eq!(vec![1, 2], verified_sector.deal_ids);
    assert!(verified_sector.initial_pledge > cc_sector.initial_pledge);
    h.assert_invariants(&rt);
}

#[test]
fn failed_deal_activation_drops_sector() {
    let (h, rt) = setup();
    let precommit_epoch = rt.epoch.get();
    let expiration = h.sector_expiration(&rt, DEFAULT_SECTOR_EXPIRATION);

    let precommit = h.pre_commit_sector(
        &rt,
        h.make_pre_commit_params(100, precommit_epoch - 1, expiration, vec![7]),
        PreCommitConfig::default(),
        true,
    );
    h.advance_to_epoch_with_cron(&rt, precommit_epoch + rt.policy.pre_commit_challenge_delay + 1);

    h.prove_commit_sector(&rt, &precommit, h.make_prove_commit_params(100)).unwrap();
    rt.verify();

    let cfg = ProveCommitConfig {
        activation_failures: BTreeMap::from([(100, ExitCode::USR_ILLEGAL_ARGUMENT)]),
    };
    h.confirm_sector_proofs_valid(&rt, cfg, &[precommit.clone()]).unwrap();
    rt.verify();

    // The pre-commit and its deposit remain until the pre-commit expires.
    let st = h.get_state(&rt);
    assert!(st.get_sector(&rt.store, 100).unwrap().is_none());
    assert_eq!(Some(precommit.clone()), st.get_precommitted_sector(&rt.store, 100).unwrap());
    assert_eq!(precommit.pre_commit_deposit, st.pre_commit_deposits);
    assert!(st.initial_pledge.is_zero());
    h.assert_invariants(&rt);
}

#[test]
fn confirm_skips_unknown_sectors() {
    let (h, rt) = setup();
    h.confirm_sector_proofs_valid(&rt, ProveCommitConfig::default(), &[]).unwrap();
    rt.verify();

    let params = ConfirmSectorProofsParams { sectors: vec![3, 4] };
    rt.set_caller(STORAGE_POWER_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
    h.expect_query_network_info(&rt);
    rt.call::<Actor>(
        Method::ConfirmSectorProofsValid as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    )
    .unwrap();
    rt.verify();
    assert!(h.get_state(&rt).initial_pledge.is_zero());
}
