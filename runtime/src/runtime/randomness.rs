// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::randomness::RANDOMNESS_LENGTH;
use num_derive::FromPrimitive;

/// Domain a randomness draw is personalised for. Only the domains the miner draws from are
/// listed; the discriminants are the chain's.
#[derive(PartialEq, Eq, Copy, Clone, FromPrimitive, Debug, Hash)]
#[repr(i64)]
pub enum DomainSeparationTag {
    WindowedPoStChallengeSeed = 4,
    SealRandomness = 5,
    InteractiveSealChallengeSeed = 6,
    PoStChainCommit = 9,
}

/// Hashes `tag || base || round || entropy`, with integers big-endian.
pub fn draw_randomness(
    hasher: impl FnOnce(&[u8]) -> [u8; 32],
    base: &[u8; RANDOMNESS_LENGTH],
    tag: DomainSeparationTag,
    round: ChainEpoch,
    entropy: &[u8],
) -> [u8; RANDOMNESS_LENGTH] {
    let buf: Vec<u8> = (tag as i64)
        .to_be_bytes()
        .iter()
        .chain(base.iter())
        .chain(round.to_be_bytes().iter())
        .chain(entropy.iter())
        .copied()
        .collect();
    hasher(&buf)
}
