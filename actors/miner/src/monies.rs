// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use fil_miner_runtime::network::EPOCHS_IN_DAY;
use fil_miner_runtime::reward::FilterEstimate;
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::StoragePower;
use lazy_static::lazy_static;
use num_traits::Zero;

/// A fraction applied to token amounts, rounding down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ratio {
    pub num: u32,
    pub denom: u32,
}

impl Ratio {
    pub const fn new(num: u32, denom: u32) -> Self {
        Self { num, denom }
    }

    pub fn of(&self, amount: &TokenAmount) -> TokenAmount {
        (amount * self.num).div_floor(self.denom)
    }
}

/// Days of expected reward locked as a pre-commit deposit.
pub const PRE_COMMIT_DEPOSIT_DAYS: ChainEpoch = 20;
/// Days of expected reward locked as the base of a sector's initial pledge.
pub const INITIAL_PLEDGE_DAYS: ChainEpoch = 20;
/// Share of circulating supply targeted for locking as consensus pledge.
pub const LOCK_TARGET: Ratio = Ratio::new(3, 10);

/// Share of initial pledge charged for a termination at full lifetime.
pub const TERMINATION_PLEDGE_SHARE: Ratio = Ratio::new(85, 1000);
/// Floor of any termination fee, as a share of initial pledge.
pub const TERMINATION_FLOOR_SHARE: Ratio = Ratio::new(2, 100);
/// Share of the fault fee a termination fee must at least reach.
pub const TERMINATION_FAULT_FEE_SHARE: Ratio = Ratio::new(5, 100);
/// Age in days after which the termination fee stops growing.
pub const TERMINATION_LIFETIME_CAP: ChainEpoch = 140;

/// Epochs of expected reward charged per proving period a fault persists (3.51 days).
pub const CONTINUED_FAULT_PROJECTION_PERIOD: ChainEpoch = EPOCHS_IN_DAY * 351 / 100;
/// Epochs of expected reward charged for a successfully disputed proof: the fault fee plus two days.
pub const INVALID_WINDOW_POST_PROJECTION_PERIOD: ChainEpoch =
    CONTINUED_FAULT_PROJECTION_PERIOD + 2 * EPOCHS_IN_DAY;

/// Share of the estimated network gas cost charged for sectors committed in aggregate.
pub const BATCH_DISCOUNT: Ratio = Ratio::new(1, 20);
/// Gas a single pre-commit message is estimated to consume.
pub const ESTIMATED_SINGLE_PRE_COMMIT_GAS_USAGE: i64 = 16_433_324;
/// Gas a single interactive prove-commit is estimated to consume.
pub const ESTIMATED_SINGLE_PROVE_COMMIT_GAS_USAGE: i64 = 49_299_973;

lazy_static! {
    /// Floor on the base fee used to price aggregation fees.
    pub static ref BATCH_BALANCER: TokenAmount = TokenAmount::from_nano(5);

    /// Initial pledge never exceeds 1 FIL per 32GiB of quality-adjusted power.
    static ref INITIAL_PLEDGE_MAX_PER_BYTE: TokenAmount =
        TokenAmount::from_whole(1).div_floor(32i64 << 30);

    /// Flat amount paid to whoever disputes an invalid window PoSt.
    pub static ref BASE_REWARD_FOR_DISPUTED_WINDOW_POST: TokenAmount = TokenAmount::from_whole(4);

    /// Flat amount burnt from a miner whose window PoSt is disputed.
    pub static ref BASE_PENALTY_FOR_DISPUTED_WINDOW_POST: TokenAmount = TokenAmount::from_whole(20);
}

/// Reward a sector of `qa_sector_power` is expected to earn over `projection_duration` epochs,
/// given its share of the network's smoothed power. Estimates are read at their current
/// position without extrapolating velocity.
pub fn expected_reward_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
    projection_duration: ChainEpoch,
) -> TokenAmount {
    let network_power = network_qa_power_estimate.estimate();
    if network_power.is_zero() {
        return TokenAmount::from_atto(reward_estimate.estimate());
    }

    let projected = reward_estimate.estimate() * qa_sector_power * projection_duration;
    let share = projected.div_floor(&network_power);
    if share < BigInt::zero() {
        TokenAmount::zero()
    } else {
        TokenAmount::from_atto(share)
    }
}

/// As `expected_reward_for_power`, but never less than one attoFIL so deposits and pledges
/// stay non-zero for any sector.
fn expected_reward_at_least_atto(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
    projection_duration: ChainEpoch,
) -> TokenAmount {
    let reward = expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        projection_duration,
    );
    cmp::max(reward, TokenAmount::from_atto(1))
}

/// Fee charged each proving period a sector stays faulty.
pub fn pledge_penalty_for_continued_fault(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        CONTINUED_FAULT_PROJECTION_PERIOD,
    )
}

/// Fee for terminating a sector ahead of its expiration.
///
/// The base is the larger of a share of the pledge and a share of the sector's fault fee. It
/// grows linearly with the sector's age in days up to the lifetime cap, and never falls below
/// the floor share of the pledge.
pub fn pledge_penalty_for_termination(
    initial_pledge: &TokenAmount,
    sector_age: ChainEpoch,
    fault_fee: &TokenAmount,
) -> TokenAmount {
    let base = cmp::max(
        TERMINATION_PLEDGE_SHARE.of(initial_pledge),
        TERMINATION_FAULT_FEE_SHARE.of(fault_fee),
    );

    let age_days = cmp::min(sector_age / EPOCHS_IN_DAY, TERMINATION_LIFETIME_CAP);
    let ramped = (&base * age_days).div_floor(TERMINATION_LIFETIME_CAP);

    cmp::max(ramped, TERMINATION_FLOOR_SHARE.of(initial_pledge))
}

/// Amount burnt when an optimistically accepted window PoSt turns out to be invalid.
pub fn pledge_penalty_for_invalid_windowpost(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    let projected = expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        INVALID_WINDOW_POST_PROJECTION_PERIOD,
    );
    projected + &*BASE_PENALTY_FOR_DISPUTED_WINDOW_POST
}

/// Paid to whoever successfully disputes a window PoSt, out of the penalty charged for it.
/// Flat regardless of the disputed power.
pub fn reward_for_disputed_window_post() -> TokenAmount {
    BASE_REWARD_FOR_DISPUTED_WINDOW_POST.clone()
}

/// Deposit locked by a pre-commitment until the sector is proven or the pre-commit expires.
pub fn pre_commit_deposit_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_at_least_atto(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        PRE_COMMIT_DEPOSIT_DAYS * EPOCHS_IN_DAY,
    )
}

/// Pledge locked when a sector's power is committed.
///
/// It is the sum of a storage pledge, the reward expected over the initial pledge period, and
/// a consensus pledge, the sector's share of the lock target. The share is taken against the
/// largest of network power, baseline power and the sector itself. The sum is capped per
/// byte of power.
pub fn initial_pledge_for_power(
    qa_power: &StoragePower,
    baseline_power: &StoragePower,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    circulating_supply: &TokenAmount,
) -> TokenAmount {
    let storage_pledge = expected_reward_at_least_atto(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        INITIAL_PLEDGE_DAYS * EPOCHS_IN_DAY,
    );

    let network_power = network_qa_power_estimate.estimate();
    let share_denom = cmp::max(cmp::max(&network_power, baseline_power), qa_power);
    let lock_num: BigInt = circulating_supply.atto() * LOCK_TARGET.num * qa_power;
    let lock_denom: BigInt = share_denom * LOCK_TARGET.denom;
    let consensus_pledge =
        if lock_denom.is_zero() { BigInt::zero() } else { lock_num.div_floor(&lock_denom) };

    let cap = TokenAmount::from_atto(INITIAL_PLEDGE_MAX_PER_BYTE.atto() * qa_power);
    cmp::min(storage_pledge + TokenAmount::from_atto(consensus_pledge), cap)
}

/// Burnt for committing `aggregate_size` sectors in one message, in place of the gas the
/// network would have spent on separate messages.
pub fn aggregate_network_fee(
    aggregate_size: i64,
    gas_usage: i64,
    base_fee: &TokenAmount,
) -> TokenAmount {
    let effective_gas_fee = cmp::max(base_fee, &*BATCH_BALANCER);
    BATCH_DISCOUNT.of(&(effective_gas_fee * (gas_usage * aggregate_size)))
}

pub fn aggregate_pre_commit_network_fee(
    aggregate_size: i64,
    base_fee: &TokenAmount,
) -> TokenAmount {
    aggregate_network_fee(aggregate_size, ESTIMATED_SINGLE_PRE_COMMIT_GAS_USAGE, base_fee)
}

pub fn aggregate_prove_commit_network_fee(
    aggregate_size: i64,
    base_fee: &TokenAmount,
) -> TokenAmount {
    aggregate_network_fee(aggregate_size, ESTIMATED_SINGLE_PROVE_COMMIT_GAS_USAGE, base_fee)
}
