// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::bigint::BigInt;
use fvm_shared::error::ExitCode;
use serde::de::DeserializeOwned;

pub use self::actor_error::*;
pub use self::builtin::*;
pub use self::dispatch::*;
pub use self::util::*;

pub mod actor_error;
pub mod builtin;
mod dispatch;
pub mod runtime;
pub mod util;

#[cfg(feature = "test_utils")]
pub mod test_blockstores;
#[cfg(feature = "test_utils")]
pub mod test_utils;

/// Sum over deals of piece size times duration.
pub type DealWeight = BigInt;

/// Result of a message send to another actor, as surfaced by the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub exit_code: ExitCode,
    pub return_data: Option<IpldBlock>,
}

/// A send that could not be delivered at all, as opposed to one the recipient rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("send failed with exit code {0:?}")]
pub struct SendError(pub ExitCode);

/// Converts a send result into an actor error, treating a non-zero exit code from the
/// recipient as a failure.
pub fn extract_send_result(
    res: Result<Response, SendError>,
) -> Result<Option<IpldBlock>, ActorError> {
    let ret = res.map_err(|e| {
        ActorError::unchecked(e.0, format!("send failed with exit code {:?}", e.0))
    })?;
    if ret.exit_code.is_success() {
        Ok(ret.return_data)
    } else {
        Err(ActorError::unchecked(
            ret.exit_code,
            format!("send aborted with code {:?}", ret.exit_code),
        ))
    }
}

/// Deserializes the return value of a send, which must be present.
pub fn deserialize_block<T>(ret: Option<IpldBlock>) -> Result<T, ActorError>
where
    T: DeserializeOwned,
{
    ret.context_code(ExitCode::USR_ASSERTION_FAILED, "return expected")?
        .deserialize()
        .exit_code(ExitCode::USR_SERIALIZATION)
}
