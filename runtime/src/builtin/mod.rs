// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::address::Address;
use fvm_shared::ActorID;

pub mod reward;

/// Chain time, assuming fixed 30 second epochs.
pub mod network {
    pub const EPOCH_DURATION_SECONDS: i64 = 30;
    pub const EPOCHS_IN_DAY: i64 = 24 * 60 * 60 / EPOCH_DURATION_SECONDS;
    /// 365.24 days, rounded to the second.
    pub const EPOCHS_IN_YEAR: i64 = 31_556_925 / EPOCH_DURATION_SECONDS;
}

pub use network::*;

const fn singleton(id: ActorID) -> Address {
    Address::new_id(id)
}

// Builtin collaborators the miner sends to or accepts calls from, at their fixed IDs.
pub const INIT_ACTOR_ADDR: Address = singleton(1);
pub const REWARD_ACTOR_ADDR: Address = singleton(2);
pub const STORAGE_POWER_ACTOR_ADDR: Address = singleton(4);
pub const STORAGE_MARKET_ACTOR_ADDR: Address = singleton(5);
pub const BURNT_FUNDS_ACTOR_ADDR: Address = singleton(99);
