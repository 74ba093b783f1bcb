// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::marker::PhantomData;

use castaway::cast;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use serde::{Deserialize, Serialize};

use crate::ActorError;

/// Generates `ActorCode::invoke_method` from a table of method variants and handlers.
///
/// ```ignore
/// impl ActorCode for Actor {
///     type Methods = Method;
///     fn name() -> &'static str { "StorageMiner" }
///     actor_dispatch! {
///         Constructor => constructor,
///         DeclareFaults => declare_faults,
///     }
/// }
/// ```
///
/// Handlers take the runtime and at most one decoded parameter, and return any serializable
/// value. Unknown method numbers abort with `USR_UNHANDLED_MESSAGE`.
#[macro_export]
macro_rules! actor_dispatch {
    ($($method:ident => $func:ident,)*) => {
        fn invoke_method<RT>(
            rt: &RT,
            method: fvm_shared::MethodNum,
            args: Option<fvm_ipld_encoding::ipld_block::IpldBlock>,
        ) -> Result<Option<fvm_ipld_encoding::ipld_block::IpldBlock>, $crate::ActorError>
        where
            RT: $crate::runtime::Runtime,
        {
            match <Self::Methods as num_traits::FromPrimitive>::from_u64(method) {
                $(Some(Self::Methods::$method) => $crate::dispatch(rt, Self::$func, &args),)*
                None => Err($crate::actor_error!(unhandled_message; "invalid method: {}", method)),
            }
        }
    };
}

/// A handler that can be driven from raw method arguments. Implemented for handlers taking
/// no parameter and for handlers taking one.
pub trait Dispatch<'de, RT> {
    fn call(self, rt: &RT, args: &'de Option<IpldBlock>) -> Result<Option<IpldBlock>, ActorError>;
}

/// Wraps a handler, with its parameter tuple recorded in the type so the two `Dispatch`
/// impls don't overlap.
pub struct Handler<F, A> {
    func: F,
    _params: PhantomData<fn(A)>,
}

#[doc(hidden)]
pub fn dispatch<'de, F, A, RT>(
    rt: &RT,
    func: F,
    args: &'de Option<IpldBlock>,
) -> Result<Option<IpldBlock>, ActorError>
where
    Handler<F, A>: Dispatch<'de, RT>,
{
    Handler { func, _params: PhantomData }.call(rt, args)
}

// Unit returns encode as no return block.
fn encode_return<T: Serialize>(v: T) -> Result<Option<IpldBlock>, ActorError> {
    match cast!(&v, &()) {
        Ok(_) => Ok(None),
        Err(_) => Ok(IpldBlock::serialize_cbor(&v)?),
    }
}

impl<'de, F, R, RT> Dispatch<'de, RT> for Handler<F, ()>
where
    F: FnOnce(&RT) -> Result<R, ActorError>,
    R: Serialize,
{
    fn call(self, rt: &RT, args: &'de Option<IpldBlock>) -> Result<Option<IpldBlock>, ActorError> {
        if args.is_some() {
            return Err(ActorError::illegal_argument("method takes no parameters".into()));
        }
        encode_return((self.func)(rt)?)
    }
}

impl<'de, F, A, R, RT> Dispatch<'de, RT> for Handler<F, (A,)>
where
    F: FnOnce(&RT, A) -> Result<R, ActorError>,
    A: Deserialize<'de>,
    R: Serialize,
{
    fn call(self, rt: &RT, args: &'de Option<IpldBlock>) -> Result<Option<IpldBlock>, ActorError> {
        let block = args
            .as_ref()
            .ok_or_else(|| ActorError::illegal_argument("method requires parameters".into()))?;
        encode_return((self.func)(rt, block.deserialize()?)?)
    }
}
