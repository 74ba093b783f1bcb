// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::sector::StoragePower;

/// Fractional bits of the fixed-point values held in a [`FilterEstimate`].
pub const PRECISION: u64 = 128;

/// Alpha-beta filtered estimate of a network quantity, as published by the reward and power
/// actors. Both fields are Q.128 fixed point.
#[derive(Default, Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
pub struct FilterEstimate {
    #[serde(with = "bigint_ser")]
    pub position: BigInt,
    #[serde(with = "bigint_ser")]
    pub velocity: BigInt,
}

impl FilterEstimate {
    /// Builds an estimate from integer position and velocity.
    pub fn new(position: BigInt, velocity: BigInt) -> Self {
        Self { position: position << PRECISION, velocity: velocity << PRECISION }
    }

    /// The integer part of the current position.
    pub fn estimate(&self) -> BigInt {
        &self.position >> PRECISION
    }
}

/// Reply of the reward actor's current-epoch reward query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ThisEpochRewardReturn {
    pub this_epoch_reward_smoothed: FilterEstimate,
    #[serde(with = "bigint_ser")]
    pub this_epoch_baseline_power: StoragePower,
}
