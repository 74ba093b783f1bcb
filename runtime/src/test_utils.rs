// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use core::fmt;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use anyhow::anyhow;
use cid::multihash::{Code, Multihash};
use cid::Cid;
use fvm_ipld_encoding::de::DeserializeOwned;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::CborStore;
use fvm_shared::address::{Address, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::commcid::{
    FIL_COMMITMENT_SEALED, FIL_COMMITMENT_UNSEALED, POSEIDON_BLS12_381_A1_FC1,
    SHA2_256_TRUNC254_PADDED,
};
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::RANDOMNESS_LENGTH;
use fvm_shared::sector::{
    AggregateSealVerifyInfo, AggregateSealVerifyProofAndInfos, WindowPoStVerifyInfo,
};
use fvm_shared::{ActorID, MethodNum};
use serde::Serialize;

use crate::runtime::{
    draw_randomness, ActorCode, DomainSeparationTag, MessageInfo, Policy, Primitives, Runtime,
    RuntimePolicy, Verifier, EMPTY_ARR_CID,
};
use crate::test_blockstores::MemoryBlockstore;
use crate::{actor_error, ActorError, Response, SendError};

/// A single-actor runtime for unit tests.
///
/// Tests queue up what the actor is expected to do (caller validation, sends in order,
/// proof verification) before each call and check it afterwards with [`MockRuntime::verify`].
/// Randomness is derived deterministically from the epoch, so it needs no expectation.
pub struct MockRuntime {
    pub epoch: Cell<ChainEpoch>,
    pub receiver: Address,
    pub caller: RefCell<Address>,
    pub value_received: RefCell<TokenAmount>,
    pub id_addresses: RefCell<HashMap<Address, ActorID>>,
    pub hash_func: Box<dyn Fn(&[u8]) -> [u8; 32]>,
    pub state: RefCell<Cid>,
    pub balance: RefCell<TokenAmount>,
    pub circulating_supply: RefCell<TokenAmount>,
    pub base_fee: RefCell<TokenAmount>,
    pub policy: Policy,
    pub store: MemoryBlockstore,
    pub in_call: Cell<bool>,
    pub in_transaction: Cell<bool>,
    pub expectations: RefCell<Expectations>,
}

/// A send the actor is expected to make, and what the mock answers with.
#[derive(Clone, Debug)]
pub struct ExpectedMessage {
    pub to: Address,
    pub method: MethodNum,
    pub params: Option<IpldBlock>,
    pub value: TokenAmount,
    pub send_return: Option<IpldBlock>,
    pub exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectVerifyPoSt {
    post: WindowPoStVerifyInfo,
    exit_code: ExitCode,
}

/// The sealed and unsealed commitments an aggregate proof must cover, in order.
#[derive(Clone, Debug)]
pub struct ExpectAggregateVerifySeals {
    infos: Vec<AggregateSealVerifyInfo>,
    proof: Vec<u8>,
    exit_code: ExitCode,
}

#[derive(Default)]
pub struct Expectations {
    pub expect_validate_caller_any: bool,
    pub expect_validate_caller_addr: Option<Vec<Address>>,
    pub expect_sends: VecDeque<ExpectedMessage>,
    pub expect_verify_post: Option<ExpectVerifyPoSt>,
    pub expect_aggregate_verify_seals: Option<ExpectAggregateVerifySeals>,
}

impl Expectations {
    fn assert_met(&self) {
        assert!(!self.expect_validate_caller_any, "caller was never validated as any");
        if let Some(addrs) = &self.expect_validate_caller_addr {
            panic!("caller was never validated against {:?}", addrs);
        }
        if !self.expect_sends.is_empty() {
            panic!("{} expected sends not made: {:?}", self.expect_sends.len(), self.expect_sends);
        }
        if let Some(v) = &self.expect_verify_post {
            panic!("PoSt was never verified: {:?}", v);
        }
        if let Some(v) = &self.expect_aggregate_verify_seals {
            panic!("aggregate seal proof was never verified: {:?}", v);
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            epoch: Cell::new(0),
            receiver: Address::new_id(0),
            caller: RefCell::new(Address::new_id(0)),
            value_received: Default::default(),
            id_addresses: Default::default(),
            hash_func: Box::new(blake2b_256),
            state: RefCell::new(*EMPTY_ARR_CID),
            balance: Default::default(),
            circulating_supply: Default::default(),
            base_fee: Default::default(),
            policy: Policy::default(),
            store: MemoryBlockstore::new(),
            in_call: Cell::new(false),
            in_transaction: Cell::new(false),
            expectations: Default::default(),
        }
    }
}

/// Asserts that `res` failed with `expect_exit_code` and a message containing `expect_msg`.
pub fn expect_abort_contains_message<T: fmt::Debug>(
    expect_exit_code: ExitCode,
    expect_msg: &str,
    res: Result<T, ActorError>,
) {
    let err = match res {
        Ok(v) => panic!("expected abort with {:?}, call returned {:?}", expect_exit_code, v),
        Err(e) => e,
    };
    assert_eq!(
        expect_exit_code,
        err.exit_code(),
        "wrong exit code for failure: {}",
        err.msg()
    );
    assert!(
        err.msg().contains(expect_msg),
        "error message '{}' does not mention '{}'",
        err.msg(),
        expect_msg
    );
}

pub fn expect_abort<T: fmt::Debug>(exit_code: ExitCode, res: Result<T, ActorError>) {
    expect_abort_contains_message(exit_code, "", res);
}

impl MockRuntime {
    pub fn get_state<T: DeserializeOwned>(&self) -> T {
        let root = *self.state.borrow();
        self.store.get_cbor(&root).unwrap().unwrap()
    }

    pub fn set_balance(&self, amount: TokenAmount) {
        self.balance.replace(amount);
    }

    pub fn set_caller(&self, address: Address) {
        self.caller.replace(address);
    }

    pub fn set_epoch(&self, epoch: ChainEpoch) {
        self.epoch.set(epoch);
    }

    pub fn add_id_address(&self, source: Address, id: ActorID) {
        self.id_addresses.borrow_mut().insert(source, id);
    }

    /// Invokes a method of actor `A` as the current caller. A failed call leaves the state
    /// root where it was.
    pub fn call<A: ActorCode>(
        &self,
        method_num: MethodNum,
        params: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError> {
        let root_before = *self.state.borrow();
        self.in_call.set(true);
        let res = A::invoke_method(self, method_num, params);
        self.in_call.set(false);
        if res.is_err() {
            self.state.replace(root_before);
        }
        res
    }

    /// Panics unless every queued expectation was consumed.
    pub fn verify(&self) {
        self.expectations.borrow().assert_met();
        self.reset();
    }

    /// Drops any expectations left over, e.g. after a call that aborted early.
    pub fn reset(&self) {
        self.expectations.replace(Expectations::default());
    }

    pub fn expect_validate_caller_addr(&self, addrs: Vec<Address>) {
        assert!(!addrs.is_empty(), "caller validation needs at least one address");
        self.expectations.borrow_mut().expect_validate_caller_addr = Some(addrs);
    }

    pub fn expect_validate_caller_any(&self) {
        self.expectations.borrow_mut().expect_validate_caller_any = true;
    }

    /// Queues a send. Sends must be made in the order they were queued.
    pub fn expect_send(
        &self,
        to: Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
        send_return: Option<IpldBlock>,
        exit_code: ExitCode,
    ) {
        self.expectations.borrow_mut().expect_sends.push_back(ExpectedMessage {
            to,
            method,
            params,
            value,
            send_return,
            exit_code,
        });
    }

    pub fn expect_verify_post(&self, post: WindowPoStVerifyInfo, exit_code: ExitCode) {
        self.expectations.borrow_mut().expect_verify_post = Some(ExpectVerifyPoSt { post, exit_code });
    }

    pub fn expect_aggregate_verify_seals(
        &self,
        infos: Vec<AggregateSealVerifyInfo>,
        proof: Vec<u8>,
        exit_code: ExitCode,
    ) {
        self.expectations.borrow_mut().expect_aggregate_verify_seals =
            Some(ExpectAggregateVerifySeals { infos, proof, exit_code });
    }

    fn require_in_call(&self) {
        assert!(self.in_call.get(), "runtime used outside of a method call");
    }
}

impl MessageInfo for MockRuntime {
    fn caller(&self) -> Address {
        *self.caller.borrow()
    }
    fn receiver(&self) -> Address {
        self.receiver
    }
    fn value_received(&self) -> TokenAmount {
        self.value_received.borrow().clone()
    }
}

impl Runtime for MockRuntime {
    type Blockstore = MemoryBlockstore;

    fn message(&self) -> &dyn MessageInfo {
        self.require_in_call();
        self
    }

    fn curr_epoch(&self) -> ChainEpoch {
        self.require_in_call();
        self.epoch.get()
    }

    fn validate_immediate_caller_accept_any(&self) -> Result<(), ActorError> {
        self.require_in_call();
        let mut exp = self.expectations.borrow_mut();
        assert!(exp.expect_validate_caller_any, "unexpected validation of any caller");
        exp.expect_validate_caller_any = false;
        Ok(())
    }

    fn validate_immediate_caller_is<'a, I>(&self, addresses: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Address>,
    {
        self.require_in_call();
        let allowed: Vec<Address> = addresses.into_iter().copied().collect();
        let expected = self.expectations.borrow_mut().expect_validate_caller_addr.take();
        assert_eq!(Some(&allowed), expected.as_ref(), "unexpected caller validation");

        let caller = *self.caller.borrow();
        if allowed.contains(&caller) {
            Ok(())
        } else {
            Err(actor_error!(forbidden; "caller {} is not one of {:?}", caller, allowed))
        }
    }

    fn current_balance(&self) -> TokenAmount {
        self.require_in_call();
        self.balance.borrow().clone()
    }

    fn resolve_address(&self, address: &Address) -> Option<ActorID> {
        self.require_in_call();
        match address.protocol() {
            Protocol::ID => address.id().ok(),
            _ => self.id_addresses.borrow().get(address).copied(),
        }
    }

    fn get_randomness_from_tickets(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        assert!(epoch <= self.epoch.get(), "ticket randomness requested from the future");
        Ok(mock_randomness(b"tickets", tag, epoch, entropy))
    }

    fn get_randomness_from_beacon(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        assert!(epoch <= self.epoch.get(), "beacon randomness requested from the future");
        Ok(mock_randomness(b"beacon", tag, epoch, entropy))
    }

    fn get_state_root(&self) -> Result<Cid, ActorError> {
        Ok(*self.state.borrow())
    }

    fn set_state_root(&self, root: &Cid) -> Result<(), ActorError> {
        self.state.replace(*root);
        Ok(())
    }

    fn transaction<S, RT, F>(&self, f: F) -> Result<RT, ActorError>
    where
        S: Serialize + DeserializeOwned,
        F: FnOnce(&mut S, &Self) -> Result<RT, ActorError>,
    {
        if self.in_transaction.replace(true) {
            return Err(actor_error!(assertion_failed; "nested transaction"));
        }
        let ret = self.state().and_then(|mut st: S| {
            let ret = f(&mut st, self)?;
            let root = self.store.put_cbor(&st, Code::Blake2b256).map_err(
                |e| actor_error!(illegal_state; "failed to store transaction state: {}", e),
            )?;
            self.state.replace(root);
            Ok(ret)
        });
        self.in_transaction.set(false);
        ret
    }

    fn store(&self) -> &MemoryBlockstore {
        &self.store
    }

    fn send(
        &self,
        to: &Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
    ) -> Result<Response, SendError> {
        self.require_in_call();
        if self.in_transaction.get() {
            return Ok(Response { exit_code: ExitCode::USR_ASSERTION_FAILED, return_data: None });
        }

        let expected = self.expectations.borrow_mut().expect_sends.pop_front();
        let Some(expected) = expected else {
            panic!("unexpected send to {} method {} value {} params {:?}", to, method, value, params)
        };
        assert_eq!(
            (&expected.to, expected.method, &expected.value, &expected.params),
            (to, method, &value, &params),
            "send does not match the next expectation"
        );

        {
            let mut balance = self.balance.borrow_mut();
            if value > *balance {
                return Err(SendError(ExitCode::SYS_INSUFFICIENT_FUNDS));
            }
            *balance -= value;
        }
        Ok(Response { exit_code: expected.exit_code, return_data: expected.send_return })
    }

    fn total_fil_circ_supply(&self) -> TokenAmount {
        self.circulating_supply.borrow().clone()
    }

    fn base_fee(&self) -> TokenAmount {
        self.base_fee.borrow().clone()
    }
}

impl Primitives for MockRuntime {
    fn hash_blake2b(&self, data: &[u8]) -> [u8; 32] {
        (self.hash_func)(data)
    }
}

impl Verifier for MockRuntime {
    fn verify_post(&self, post: &WindowPoStVerifyInfo) -> anyhow::Result<()> {
        let Some(exp) = self.expectations.borrow_mut().expect_verify_post.take() else {
            panic!("unexpected PoSt verification of {:?}", post)
        };
        assert_eq!(exp.post, *post, "PoSt verified with unexpected inputs");
        if exp.exit_code.is_success() {
            Ok(())
        } else {
            Err(anyhow!("PoSt verification failed with {:?}", exp.exit_code))
        }
    }

    fn verify_aggregate_seals(
        &self,
        aggregate: &AggregateSealVerifyProofAndInfos,
    ) -> anyhow::Result<()> {
        let Some(exp) = self.expectations.borrow_mut().expect_aggregate_verify_seals.take() else {
            panic!("unexpected aggregate seal verification for miner {}", aggregate.miner)
        };
        assert_eq!(exp.infos.len(), aggregate.infos.len(), "aggregate covers wrong sector count");
        for (want, got) in exp.infos.iter().zip(aggregate.infos.iter()) {
            assert_eq!(want.sector_number, got.sector_number, "aggregate sector order");
            assert_eq!(want.sealed_cid, got.sealed_cid, "sector {} sealed CID", want.sector_number);
            assert_eq!(want.unsealed_cid, got.unsealed_cid, "sector {} unsealed CID", want.sector_number);
        }
        assert_eq!(exp.proof, aggregate.proof, "aggregate proof bytes");
        if exp.exit_code.is_success() {
            Ok(())
        } else {
            Err(anyhow!("aggregate verification failed with {:?}", exp.exit_code))
        }
    }
}

impl RuntimePolicy for MockRuntime {
    fn policy(&self) -> &Policy {
        &self.policy
    }
}

/// The randomness the mock runtime serves for a draw, derived from the source, epoch and entropy.
pub fn mock_randomness(
    source: &[u8],
    tag: DomainSeparationTag,
    epoch: ChainEpoch,
    entropy: &[u8],
) -> [u8; RANDOMNESS_LENGTH] {
    let seed = [source, &epoch.to_be_bytes()].concat();
    draw_randomness(blake2b_256, &blake2b_256(&seed), tag, epoch, entropy)
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let hash = blake2b_simd::Params::new().hash_length(32).hash(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

fn make_cid(input: &[u8], codec: u64, hash_code: u64) -> Cid {
    let digest = Multihash::wrap(hash_code, &blake2b_256(input)).unwrap();
    Cid::new_v1(codec, digest)
}

/// An unsealed (CommD-shaped) CID for test data.
pub fn make_piece_cid(input: &[u8]) -> Cid {
    make_cid(input, FIL_COMMITMENT_UNSEALED, SHA2_256_TRUNC254_PADDED)
}

/// A sealed (CommR-shaped) CID for test data.
pub fn make_sealed_cid(input: &[u8]) -> Cid {
    make_cid(input, FIL_COMMITMENT_SEALED, POSEIDON_BLS12_381_A1_FC1)
}

/// Routes `log` output to stderr once per test binary, honouring `RUST_LOG`.
pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}
