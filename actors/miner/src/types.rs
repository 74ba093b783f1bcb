// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fil_miner_runtime::{actor_error, ActorError, DealWeight};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{strict_bytes, BytesDe};
use fvm_shared::address::Address;
use fvm_shared::bigint::bigint_ser;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    PoStProof, RegisteredPoStProof, RegisteredSealProof, SectorNumber, SectorSize,
};

/// Deferred cron payload kind. The miner only schedules the end-of-deadline event.
pub const CRON_EVENT_PROVING_DEADLINE: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct MinerConstructorParams {
    pub owner: Address,
    pub worker: Address,
    pub control_addresses: Vec<Address>,
    pub window_post_proof_type: RegisteredPoStProof,
    #[serde(with = "strict_bytes")]
    pub peer_id: Vec<u8>,
    pub multi_addresses: Vec<BytesDe>,
}

/// Miner identity and proof parameters. Fixed at construction and kept under its own root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct MinerInfo {
    pub owner: Address,
    pub worker: Address,
    pub control_addresses: Vec<Address>,
    #[serde(with = "strict_bytes")]
    pub peer_id: Vec<u8>,
    pub multi_address: Vec<BytesDe>,
    pub window_post_proof_type: RegisteredPoStProof,
    /// Derived from the PoSt proof type.
    pub sector_size: SectorSize,
    /// Sectors per partition, derived from the PoSt proof type.
    pub window_post_partition_sectors: u64,
}

impl MinerInfo {
    /// Builds the info for a new miner. Addresses must already be resolved to IDs.
    pub fn new(
        owner: Address,
        worker: Address,
        control_addresses: Vec<Address>,
        peer_id: Vec<u8>,
        multi_address: Vec<BytesDe>,
        window_post_proof_type: RegisteredPoStProof,
    ) -> Result<Self, ActorError> {
        let sector_size = window_post_proof_type.sector_size().map_err(|e| {
            actor_error!(illegal_argument, "no sector size for {:?}: {}", window_post_proof_type, e)
        })?;
        let window_post_partition_sectors =
            window_post_proof_type.window_post_partitions_sector().map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "no partition size for {:?}: {}",
                    window_post_proof_type,
                    e
                )
            })?;

        Ok(Self {
            owner,
            worker,
            control_addresses,
            peer_id,
            multi_address,
            window_post_proof_type,
            sector_size,
            window_post_partition_sectors,
        })
    }

    /// Callers allowed to operate the miner: owner, worker, then control addresses.
    pub fn controlling_addresses(&self) -> Vec<Address> {
        [self.owner, self.worker].into_iter().chain(self.control_addresses.iter().copied()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct CronEventPayload {
    pub event_type: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DeferredCronEventParams {
    /// An encoded [`CronEventPayload`].
    #[serde(with = "strict_bytes")]
    pub event_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PoStPartition {
    pub index: u64,
    /// Sectors the proof leaves out. Those not already faulty become faults.
    pub skipped: BitField,
}

#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SubmitWindowedPoStParams {
    pub deadline: u64,
    pub partitions: Vec<PoStPartition>,
    /// Exactly one proof, covering every listed partition.
    pub proofs: Vec<PoStProof>,
    /// Epoch of the ticket the submission commits to, which must match the chain it lands on.
    pub chain_commit_epoch: ChainEpoch,
    pub chain_commit_rand: Randomness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ProveCommitSectorParams {
    pub sector_number: SectorNumber,
    #[serde(with = "strict_bytes")]
    pub proof: Vec<u8>,
}

/// Proves many pre-committed sectors with one aggregated seal proof.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ProveCommitAggregateParams {
    pub sector_numbers: BitField,
    #[serde(with = "strict_bytes")]
    pub aggregate_proof: Vec<u8>,
}

/// Sent by the power actor with the sectors whose seal proofs passed batch verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ConfirmSectorProofsParams {
    pub sectors: Vec<SectorNumber>,
}

/// Sectors of one partition, addressed by deadline and partition index.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PartitionSectors {
    pub deadline: u64,
    pub partition: u64,
    pub sectors: BitField,
}

pub type FaultDeclaration = PartitionSectors;
pub type RecoveryDeclaration = PartitionSectors;

#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DeclareFaultsParams {
    pub faults: Vec<FaultDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DeclareFaultsRecoveredParams {
    pub recoveries: Vec<RecoveryDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct CompactPartitionsParams {
    pub deadline: u64,
    pub partitions: BitField,
}

/// Names one proof in a deadline's optimistic snapshot. One dispute per message.
#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize_tuple, Deserialize_tuple)]
pub struct DisputeWindowedPoStParams {
    pub deadline: u64,
    pub post_index: u64,
}

/// A sector the miner commits to seal. Sent as-is in a pre-commit message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct SectorPreCommitInfo {
    pub seal_proof: RegisteredSealProof,
    pub sector_number: SectorNumber,
    /// CommR
    pub sealed_cid: Cid,
    pub seal_rand_epoch: ChainEpoch,
    pub deal_ids: Vec<DealID>,
    pub expiration: ChainEpoch,
}

pub type PreCommitSectorParams = SectorPreCommitInfo;

#[derive(Debug, PartialEq, Eq, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct PreCommitSectorBatchParams {
    pub sectors: Vec<SectorPreCommitInfo>,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct SectorPreCommitOnChainInfo {
    pub info: SectorPreCommitInfo,
    pub pre_commit_deposit: TokenAmount,
    pub pre_commit_epoch: ChainEpoch,
    /// Space-time of the sector's deals, zero for committed capacity.
    #[serde(with = "bigint_ser")]
    pub deal_weight: DealWeight,
    #[serde(with = "bigint_ser")]
    pub verified_deal_weight: DealWeight,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct SectorOnChainInfo {
    pub sector_number: SectorNumber,
    pub seal_proof: RegisteredSealProof,
    /// CommR
    pub sealed_cid: Cid,
    pub deal_ids: Vec<DealID>,
    /// Epoch the seal proof was confirmed.
    pub activation: ChainEpoch,
    pub expiration: ChainEpoch,
    #[serde(with = "bigint_ser")]
    pub deal_weight: DealWeight,
    #[serde(with = "bigint_ser")]
    pub verified_deal_weight: DealWeight,
    pub initial_pledge: TokenAmount,
}
