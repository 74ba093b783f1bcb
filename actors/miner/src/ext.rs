// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Methods and messages of the builtin actors the miner talks to.

use fil_miner_runtime::reward::FilterEstimate;
use fil_miner_runtime::DealWeight;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::bigint::bigint_ser;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{RegisteredSealProof, StoragePower};
use fvm_shared::MethodNum;

pub mod market {
    use super::*;

    pub const VERIFY_DEALS_FOR_ACTIVATION_METHOD: MethodNum = 5;
    pub const ACTIVATE_DEALS_METHOD: MethodNum = 6;
    pub const COMPUTE_DATA_COMMITMENT_METHOD: MethodNum = 8;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
    pub struct VerifyDealsForActivationParams {
        pub deal_ids: Vec<DealID>,
        pub sector_start: ChainEpoch,
        pub sector_expiry: ChainEpoch,
    }

    /// Space-time the deals will occupy, split by verification.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
    pub struct VerifyDealsForActivationReturn {
        #[serde(with = "bigint_ser")]
        pub deal_weight: DealWeight,
        #[serde(with = "bigint_ser")]
        pub verified_deal_weight: DealWeight,
        pub deal_space: u64,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
    pub struct ActivateDealsParams {
        pub deal_ids: Vec<DealID>,
        pub sector_expiry: ChainEpoch,
    }

    /// Replied to with the unsealed CID (CommD) of the deals' pieces.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
    pub struct ComputeDataCommitmentParams {
        pub deal_ids: Vec<DealID>,
        pub sector_type: RegisteredSealProof,
    }
}

pub mod power {
    use super::*;

    pub const UPDATE_CLAIMED_POWER_METHOD: MethodNum = 3;
    pub const ENROLL_CRON_EVENT_METHOD: MethodNum = 4;
    pub const UPDATE_PLEDGE_TOTAL_METHOD: MethodNum = 6;
    pub const SUBMIT_POREP_FOR_BULK_VERIFY_METHOD: MethodNum = 8;
    pub const CURRENT_TOTAL_POWER_METHOD: MethodNum = 9;

    /// Seal proofs the power actor batches for one miner in a single epoch.
    pub const MAX_MINER_PROVE_COMMITS_PER_EPOCH: usize = 200;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
    pub struct CurrentTotalPowerReturn {
        #[serde(with = "bigint_ser")]
        pub raw_byte_power: StoragePower,
        #[serde(with = "bigint_ser")]
        pub quality_adj_power: StoragePower,
        pub pledge_collateral: TokenAmount,
        pub quality_adj_power_smoothed: FilterEstimate,
    }

    /// Asks for `payload` to be handed back through the miner's deferred cron method at
    /// `event_epoch`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
    pub struct EnrollCronEventParams {
        pub event_epoch: ChainEpoch,
        pub payload: RawBytes,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
    pub struct UpdateClaimedPowerParams {
        #[serde(with = "bigint_ser")]
        pub raw_byte_delta: StoragePower,
        #[serde(with = "bigint_ser")]
        pub quality_adjusted_delta: StoragePower,
    }
}

pub mod reward {
    use fvm_shared::MethodNum;

    /// Replied to with a `ThisEpochRewardReturn`.
    pub const THIS_EPOCH_REWARD_METHOD: MethodNum = 3;
}
