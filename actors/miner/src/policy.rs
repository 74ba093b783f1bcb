// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use cid::{Cid, Version};
use fil_miner_runtime::network::{EPOCHS_IN_DAY, EPOCHS_IN_YEAR};
use fil_miner_runtime::runtime::Policy;
use fil_miner_runtime::DealWeight;
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::commcid::{FIL_COMMITMENT_SEALED, POSEIDON_BLS12_381_A1_FC1};
use fvm_shared::sector::{RegisteredSealProof, SectorQuality, SectorSize, StoragePower};

use super::types::SectorOnChainInfo;

/// Fixed-point bits of a `SectorQuality`.
pub const SECTOR_QUALITY_PRECISION: i64 = 20;

/// Power multipliers, in tenths, for the three kinds of space a sector can hold.
const COMMITTED_CAPACITY_MULTIPLIER: u32 = 10;
const DEAL_MULTIPLIER: u32 = 10;
const VERIFIED_DEAL_MULTIPLIER: u32 = 100;

/// Generation of a seal proof. Later generations may be proven and kept for longer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SealGeneration {
    V1,
    V1P1,
}

fn seal_generation(proof: RegisteredSealProof) -> Option<SealGeneration> {
    use RegisteredSealProof::*;
    match proof {
        StackedDRG2KiBV1 | StackedDRG8MiBV1 | StackedDRG512MiBV1 | StackedDRG32GiBV1
        | StackedDRG64GiBV1 => Some(SealGeneration::V1),
        StackedDRG2KiBV1P1 | StackedDRG8MiBV1P1 | StackedDRG512MiBV1P1 | StackedDRG32GiBV1P1
        | StackedDRG64GiBV1P1 => Some(SealGeneration::V1P1),
        _ => None,
    }
}

/// Partitions a single message may address when every sector in them gets loaded.
pub fn load_partitions_sectors_max(policy: &Policy, partition_sector_count: u64) -> u64 {
    let by_sectors = policy.addressed_sectors_max / partition_sector_count;
    cmp::min(by_sectors, policy.addressed_partitions_max)
}

/// Whether a CID has the shape of a sealed sector commitment (CommR).
pub fn is_sealed_sector(c: &Cid) -> bool {
    let hash = c.hash();
    c.version() == Version::V1
        && c.codec() == FIL_COMMITMENT_SEALED
        && hash.code() == POSEIDON_BLS12_381_A1_FC1
        && hash.size() == 32
}

pub fn can_pre_commit_seal_proof(policy: &Policy, proof: RegisteredSealProof) -> bool {
    policy.valid_pre_commit_proof_type.contains(proof)
}

/// Longest a pre-commitment may wait for its proof, including the challenge delay.
pub fn max_prove_commit_duration(
    policy: &Policy,
    proof: RegisteredSealProof,
) -> Option<ChainEpoch> {
    let sealing_days = match seal_generation(proof)? {
        SealGeneration::V1 => 1,
        SealGeneration::V1P1 => 30,
    };
    Some(sealing_days * EPOCHS_IN_DAY + policy.pre_commit_challenge_delay)
}

/// Longest a sector sealed with `proof` may live after activation.
pub fn seal_proof_sector_maximum_lifetime(proof: RegisteredSealProof) -> Option<ChainEpoch> {
    Some(match seal_generation(proof)? {
        SealGeneration::V1 => 540 * EPOCHS_IN_DAY,
        SealGeneration::V1P1 => 5 * EPOCHS_IN_YEAR,
    })
}

/// Quality of a sector as a fixed-point weighted average of the space-time multipliers.
/// Deal weights are the space-time their deals occupy, and together may not exceed the
/// sector's own space-time.
pub fn quality_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> SectorQuality {
    let space_time = BigInt::from(size as u64) * duration;
    let unoccupied = &space_time - deal_weight - verified_weight;

    let weighted = unoccupied * COMMITTED_CAPACITY_MULTIPLIER
        + deal_weight * DEAL_MULTIPLIER
        + verified_weight * VERIFIED_DEAL_MULTIPLIER;

    let scaled: SectorQuality = weighted << SECTOR_QUALITY_PRECISION;
    scaled.div_floor(&space_time).div_floor(&BigInt::from(COMMITTED_CAPACITY_MULTIPLIER))
}

/// Power of a sector filled entirely with verified deals.
pub fn qa_power_max(size: SectorSize) -> StoragePower {
    (BigInt::from(size as u64) * VERIFIED_DEAL_MULTIPLIER)
        .div_floor(&BigInt::from(COMMITTED_CAPACITY_MULTIPLIER))
}

pub fn qa_power_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> StoragePower {
    let quality = quality_for_weight(size, duration, deal_weight, verified_weight);
    (BigInt::from(size as u64) * quality) >> SECTOR_QUALITY_PRECISION
}

pub fn qa_power_for_sector(size: SectorSize, sector: &SectorOnChainInfo) -> StoragePower {
    qa_power_for_weight(
        size,
        sector.expiration - sector.activation,
        &sector.deal_weight,
        &sector.verified_deal_weight,
    )
}

/// Deals a single sector may carry.
pub fn sector_deals_max(policy: &Policy, size: SectorSize) -> u64 {
    cmp::max(256, size as u64 / policy.deal_limit_denominator)
}
