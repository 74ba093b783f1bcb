// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::{CborStore, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::randomness::RANDOMNESS_LENGTH;
use fvm_shared::sector::{AggregateSealVerifyProofAndInfos, WindowPoStVerifyInfo};
use fvm_shared::{ActorID, MethodNum};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::policy::*;
pub use self::randomness::{draw_randomness, DomainSeparationTag};
use crate::{actor_error, ActorError, Response, SendError};

pub mod policy;
mod randomness;

lazy_static! {
    /// State root of an actor before construction: the CBOR encoding of an empty list.
    pub static ref EMPTY_ARR_CID: Cid = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&[0x80]));
}

/// The host environment an actor method executes in.
///
/// Everything outside the method's parameters is reached through here: the chain clock, the
/// actor's own state root and balance, sends to other actors, randomness and proof
/// verification.
pub trait Runtime: Primitives + Verifier + RuntimePolicy {
    type Blockstore: Blockstore;

    fn message(&self) -> &dyn MessageInfo;

    /// Epoch of the block holding the message being executed.
    fn curr_epoch(&self) -> ChainEpoch;

    /// Every exported method validates its caller exactly once, before doing anything that
    /// depends on who called.
    fn validate_immediate_caller_accept_any(&self) -> Result<(), ActorError>;
    fn validate_immediate_caller_is<'a, I>(&self, addresses: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Address>;

    fn current_balance(&self) -> TokenAmount;

    /// ID an address is bound to, if any. ID addresses resolve to themselves.
    fn resolve_address(&self, address: &Address) -> Option<ActorID>;

    /// Ticket-chain randomness at `rand_epoch`. Depends on the fork being executed.
    fn get_randomness_from_tickets(
        &self,
        personalization: DomainSeparationTag,
        rand_epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError>;

    /// Beacon randomness at `rand_epoch`. The same on every fork.
    fn get_randomness_from_beacon(
        &self,
        personalization: DomainSeparationTag,
        rand_epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError>;

    /// Writes the actor's first state. Fails once any state exists.
    fn create<T: Serialize>(&self, obj: &T) -> Result<(), ActorError> {
        let root = self.get_state_root()?;
        if root != *EMPTY_ARR_CID {
            return Err(actor_error!(illegal_state; "state already constructed at {}", root));
        }
        let new_root = self
            .store()
            .put_cbor(obj, Code::Blake2b256)
            .map_err(|e| actor_error!(illegal_argument; "failed to store initial state: {}", e))?;
        self.set_state_root(&new_root)
    }

    /// A read-only copy of the actor's state.
    fn state<T: DeserializeOwned>(&self) -> Result<T, ActorError> {
        let root = self.get_state_root()?;
        match self.store().get_cbor(&root) {
            Ok(Some(st)) => Ok(st),
            Ok(None) => Err(actor_error!(illegal_state; "no state at root {}", root)),
            Err(e) => Err(actor_error!(illegal_state; "failed to load state: {}", e)),
        }
    }

    fn get_state_root(&self) -> Result<Cid, ActorError>;
    fn set_state_root(&self, root: &Cid) -> Result<(), ActorError>;

    /// Runs `f` over a mutable copy of the state and stores the result as the new root if `f`
    /// succeeds. Sends are forbidden while `f` runs.
    fn transaction<S, RT, F>(&self, f: F) -> Result<RT, ActorError>
    where
        S: Serialize + DeserializeOwned,
        F: FnOnce(&mut S, &Self) -> Result<RT, ActorError>;

    fn store(&self) -> &Self::Blockstore;

    /// Invokes `method` on `to`, transferring `value`. A recipient that aborts has its
    /// effects rolled back and reports its exit code in the response.
    fn send(
        &self,
        to: &Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
    ) -> Result<Response, SendError>;

    /// Circulating supply at the start of the current epoch.
    fn total_fil_circ_supply(&self) -> TokenAmount;

    /// Base fee of the current tipset.
    fn base_fee(&self) -> TokenAmount;
}

/// The message being executed.
pub trait MessageInfo {
    /// Immediate caller, as an ID address.
    fn caller(&self) -> Address;
    /// This actor, as an ID address.
    fn receiver(&self) -> Address;
    /// Value sent with the message, already included in the receiver's balance.
    fn value_received(&self) -> TokenAmount;
}

pub trait Primitives {
    fn hash_blake2b(&self, data: &[u8]) -> [u8; 32];
}

pub trait Verifier {
    fn verify_post(&self, verify_info: &WindowPoStVerifyInfo) -> Result<(), anyhow::Error>;

    /// Verifies a single proof covering the seals of many sectors.
    fn verify_aggregate_seals(
        &self,
        aggregate: &AggregateSealVerifyProofAndInfos,
    ) -> Result<(), anyhow::Error>;
}

/// An actor's method table.
pub trait ActorCode {
    type Methods;

    /// Actor name, for diagnostics.
    fn name() -> &'static str;

    /// Decodes `args` for `method` and runs it.
    fn invoke_method<RT>(
        rt: &RT,
        method: MethodNum,
        args: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError>
    where
        RT: Runtime;
}
