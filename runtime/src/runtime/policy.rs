// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::{RegisteredPoStProof, RegisteredSealProof};

pub trait RuntimePolicy {
    fn policy(&self) -> &Policy;
}

/// Network parameters governing the miner's proving schedule and sector lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    /// Maximum number of control addresses a miner may register.
    pub max_control_addresses: usize,
    /// Maximum length of a peer ID.
    pub max_peer_id_length: usize,
    /// Maximum total size of the encoded multiaddrs.
    pub max_multiaddr_data: usize,

    /// The period over which a miner's active sectors are expected to be proven via WindowPoSt.
    pub wpost_proving_period: ChainEpoch,
    /// The duration of a deadline's challenge window, the period before a deadline when the
    /// challenge is available.
    pub wpost_challenge_window: ChainEpoch,
    /// The number of non-overlapping PoSt deadlines in each proving period.
    pub wpost_period_deadlines: u64,
    /// The maximum distance back that a valid Window PoSt must commit to the current chain.
    pub wpost_max_chain_commit_age: ChainEpoch,
    /// WPoStDisputeWindow is the period after a challenge window ends during which
    /// PoSts submitted during that period may be disputed.
    pub wpost_dispute_window: ChainEpoch,
    /// Lookback from the deadline's challenge window opening from which to sample chain randomness
    /// for the challenge seed.
    pub wpost_challenge_lookback: ChainEpoch,

    /// The maximum number of partitions that can be loaded in a single invocation.
    pub addressed_partitions_max: u64,
    /// Maximum number of unique "declarations" in batch operations.
    pub declarations_max: u64,
    /// The maximum number of sector infos that can be loaded in a single invocation.
    pub addressed_sectors_max: u64,
    /// The maximum number of partitions that may exist in a single deadline.
    pub max_partitions_per_deadline: u64,

    /// Minimum period between fault declaration and the next deadline opening.
    pub fault_declaration_cutoff: ChainEpoch,
    /// The maximum age of a fault before the sector is terminated.
    pub fault_max_age: ChainEpoch,

    /// Number of epochs between publishing the precommit and when the challenge for interactive
    /// PoRep is drawn.
    pub pre_commit_challenge_delay: ChainEpoch,
    /// Maximum number of epochs before the current epoch that the seal randomness may be drawn.
    pub max_pre_commit_randomness_lookback: ChainEpoch,
    /// Minimum number of epochs past the current epoch a sector may be set to expire.
    pub min_sector_expiration: ChainEpoch,
    /// Maximum number of epochs past the current epoch a sector may be set to expire.
    pub max_sector_expiration_extension: ChainEpoch,
    /// Epochs after a pre-commit's proving deadline lapses before its deposit is burnt.
    pub expired_pre_commit_clean_up_delay: ChainEpoch,
    /// Ratio of sector size to maximum deals per sector.
    pub deal_limit_denominator: u64,

    /// Maximum number of pre-commits in a single batch.
    pub pre_commit_sector_batch_max_size: usize,
    /// Bounds on the number of sectors confirmed by one aggregate proof.
    pub min_aggregated_sectors: u64,
    pub max_aggregated_sectors: u64,
    /// Maximum size in bytes of an aggregated seal proof.
    pub max_aggregated_proof_size: usize,

    /// Epochs after which chain state is final with overwhelming probability.
    pub chain_finality: ChainEpoch,

    /// Allowed post proof types for new miners
    pub valid_post_proof_type: ProofSet,
    /// Allowed pre commit proof types for new miners
    pub valid_pre_commit_proof_type: ProofSet,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            max_control_addresses: policy_constants::MAX_CONTROL_ADDRESSES,
            max_peer_id_length: policy_constants::MAX_PEER_ID_LENGTH,
            max_multiaddr_data: policy_constants::MAX_MULTIADDR_DATA,
            wpost_proving_period: policy_constants::WPOST_PROVING_PERIOD,
            wpost_challenge_window: policy_constants::WPOST_CHALLENGE_WINDOW,
            wpost_period_deadlines: policy_constants::WPOST_PERIOD_DEADLINES,
            wpost_max_chain_commit_age: policy_constants::WPOST_MAX_CHAIN_COMMIT_AGE,
            wpost_dispute_window: policy_constants::WPOST_DISPUTE_WINDOW,
            wpost_challenge_lookback: policy_constants::WPOST_CHALLENGE_LOOKBACK,
            addressed_partitions_max: policy_constants::ADDRESSED_PARTITIONS_MAX,
            declarations_max: policy_constants::DECLARATIONS_MAX,
            addressed_sectors_max: policy_constants::ADDRESSED_SECTORS_MAX,
            max_partitions_per_deadline: policy_constants::MAX_PARTITIONS_PER_DEADLINE,
            fault_declaration_cutoff: policy_constants::FAULT_DECLARATION_CUTOFF,
            fault_max_age: policy_constants::FAULT_MAX_AGE,
            pre_commit_challenge_delay: policy_constants::PRE_COMMIT_CHALLENGE_DELAY,
            max_pre_commit_randomness_lookback:
                policy_constants::MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK,
            min_sector_expiration: policy_constants::MIN_SECTOR_EXPIRATION,
            max_sector_expiration_extension: policy_constants::MAX_SECTOR_EXPIRATION_EXTENSION,
            expired_pre_commit_clean_up_delay:
                policy_constants::EXPIRED_PRE_COMMIT_CLEAN_UP_DELAY,
            deal_limit_denominator: policy_constants::DEAL_LIMIT_DENOMINATOR,
            pre_commit_sector_batch_max_size: policy_constants::PRE_COMMIT_SECTOR_BATCH_MAX_SIZE,
            min_aggregated_sectors: policy_constants::MIN_AGGREGATED_SECTORS,
            max_aggregated_sectors: policy_constants::MAX_AGGREGATED_SECTORS,
            max_aggregated_proof_size: policy_constants::MAX_AGGREGATED_PROOF_SIZE,
            chain_finality: policy_constants::CHAIN_FINALITY,
            valid_post_proof_type: ProofSet::default_post_proofs(),
            valid_pre_commit_proof_type: ProofSet::default_precommit_seal_proofs(),
        }
    }
}

pub mod policy_constants {
    use fvm_shared::clock::ChainEpoch;

    use crate::network::{EPOCHS_IN_DAY, EPOCH_DURATION_SECONDS};

    pub const MAX_CONTROL_ADDRESSES: usize = 10;

    pub const MAX_PEER_ID_LENGTH: usize = 128;

    pub const MAX_MULTIADDR_DATA: usize = 1024;

    /// 24 hours
    pub const WPOST_PROVING_PERIOD: ChainEpoch = EPOCHS_IN_DAY;

    /// 30 minutes (48 per day)
    pub const WPOST_CHALLENGE_WINDOW: ChainEpoch = 30 * 60 / EPOCH_DURATION_SECONDS;

    pub const WPOST_PERIOD_DEADLINES: u64 = 48;

    pub const WPOST_MAX_CHAIN_COMMIT_AGE: ChainEpoch = WPOST_CHALLENGE_WINDOW;

    pub const WPOST_DISPUTE_WINDOW: ChainEpoch = 2 * CHAIN_FINALITY;

    pub const WPOST_CHALLENGE_LOOKBACK: ChainEpoch = 20;

    pub const ADDRESSED_PARTITIONS_MAX: u64 = 25;

    pub const DECLARATIONS_MAX: u64 = 3000;

    pub const ADDRESSED_SECTORS_MAX: u64 = 25_000;

    pub const MAX_PARTITIONS_PER_DEADLINE: u64 = 3000;

    pub const FAULT_DECLARATION_CUTOFF: ChainEpoch = WPOST_CHALLENGE_LOOKBACK + 50;

    /// 42 days
    pub const FAULT_MAX_AGE: ChainEpoch = WPOST_PROVING_PERIOD * 42;

    pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 150;

    pub const MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK: ChainEpoch = EPOCHS_IN_DAY + CHAIN_FINALITY;

    pub const MIN_SECTOR_EXPIRATION: ChainEpoch = 180 * EPOCHS_IN_DAY;

    pub const MAX_SECTOR_EXPIRATION_EXTENSION: ChainEpoch = 540 * EPOCHS_IN_DAY;

    pub const EXPIRED_PRE_COMMIT_CLEAN_UP_DELAY: ChainEpoch = 1;

    pub const DEAL_LIMIT_DENOMINATOR: u64 = 134217728;

    pub const PRE_COMMIT_SECTOR_BATCH_MAX_SIZE: usize = 256;

    pub const MIN_AGGREGATED_SECTORS: u64 = 4;

    pub const MAX_AGGREGATED_SECTORS: u64 = 819;

    pub const MAX_AGGREGATED_PROOF_SIZE: usize = 81960;

    pub const CHAIN_FINALITY: ChainEpoch = 900;
}

/// A set of proof types, indexed by their numeric registration value.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct ProofSet(Vec<bool>);

impl ProofSet {
    /// Window PoSt proof types accepted for new miners.
    pub fn default_post_proofs() -> Self {
        let mut set = ProofSet::default();
        set.insert(RegisteredPoStProof::StackedDRGWindow32GiBV1);
        set.insert(RegisteredPoStProof::StackedDRGWindow64GiBV1);
        set
    }

    /// Seal proof types accepted for new pre-commitments.
    pub fn default_precommit_seal_proofs() -> Self {
        let mut set = ProofSet::default();
        set.insert(RegisteredSealProof::StackedDRG32GiBV1P1);
        set.insert(RegisteredSealProof::StackedDRG64GiBV1P1);
        set
    }

    /// Checks if the requested proof type exists in the set
    pub fn contains<P: Into<i64>>(&self, proof: P) -> bool {
        let index: i64 = proof.into();
        if index < 0 {
            return false;
        }
        self.0.get(index as usize).copied().unwrap_or(false)
    }

    /// Adds the proof type to the set
    pub fn insert<P: Into<i64>>(&mut self, proof: P) {
        let index: i64 = proof.into();
        if index < 0 {
            return;
        }
        let index = index as usize;
        if self.0.len() <= index {
            self.0.resize(index + 1, false);
        }
        self.0[index] = true;
    }
}
