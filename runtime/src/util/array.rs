// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_amt::Amt;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::error::ExitCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{ActorError, AsActorError};

/// Wraps an AMT to provide a convenient array API keyed by `u64`.
/// Any errors are returned with exit code indicating illegal state.
/// The name is not persisted in state, but adorns any error messages.
pub struct Array<BS, V>
where
    BS: Blockstore,
    V: DeserializeOwned + Serialize,
{
    amt: Amt<V, BS>,
    name: &'static str,
}

impl<BS, V> Array<BS, V>
where
    BS: Blockstore,
    V: DeserializeOwned + Serialize,
{
    /// Creates a new, empty array.
    pub fn empty(store: BS, bit_width: u32, name: &'static str) -> Self {
        Self { amt: Amt::new_with_bit_width(store, bit_width), name }
    }

    /// Creates a new empty array and flushes it to the store.
    /// Returns the CID of the empty array root.
    pub fn flush_empty(store: BS, bit_width: u32) -> Result<Cid, ActorError> {
        Self::empty(store, bit_width, "empty").flush()
    }

    /// Loads an array from the store. The bit width is read from the root.
    pub fn load(store: BS, root: &Cid, name: &'static str) -> Result<Self, ActorError> {
        Ok(Self {
            amt: Amt::load(root, store).with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
                format!("failed to load AMT '{}'", name)
            })?,
            name,
        })
    }

    /// Flushes the array's contents to the store.
    /// Returns the root node CID.
    pub fn flush(&mut self) -> Result<Cid, ActorError> {
        self.amt.flush().with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
            format!("failed to flush AMT '{}'", self.name)
        })
    }

    /// Number of values held.
    pub fn count(&self) -> u64 {
        self.amt.count()
    }

    pub fn is_empty(&self) -> bool {
        self.amt.count() == 0
    }

    /// Returns a reference to the value at an index, if present.
    pub fn get(&self, index: u64) -> Result<Option<&V>, ActorError> {
        self.amt.get(index).with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
            format!("failed to get index {} from AMT '{}'", index, self.name)
        })
    }

    /// Sets the value at an index, replacing any previous value.
    pub fn set(&mut self, index: u64, value: V) -> Result<(), ActorError> {
        self.amt.set(index, value).with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
            format!("failed to set index {} in AMT '{}'", index, self.name)
        })
    }

    /// Removes the value at an index, returning it if present.
    pub fn delete(&mut self, index: u64) -> Result<Option<V>, ActorError> {
        self.amt.delete(index).with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
            format!("failed to delete index {} from AMT '{}'", index, self.name)
        })
    }

    /// Removes every listed index. With `strict`, a missing index is an error.
    pub fn batch_delete(
        &mut self,
        indices: impl IntoIterator<Item = u64>,
        strict: bool,
    ) -> Result<(), ActorError> {
        self.amt.batch_delete(indices, strict).with_context_code(
            ExitCode::USR_ILLEGAL_STATE,
            || format!("failed to batch delete from AMT '{}'", self.name),
        )?;
        Ok(())
    }

    /// Iterates over all values in index order.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), ActorError>
    where
        F: FnMut(u64, &V) -> Result<(), ActorError>,
    {
        self.for_each_while(|i, v| f(i, v).map(|()| true))
    }

    /// Iterates over values in index order until the callback returns `false`.
    /// An error from the callback is returned unchanged.
    pub fn for_each_while<F>(&self, mut f: F) -> Result<(), ActorError>
    where
        F: FnMut(u64, &V) -> Result<bool, ActorError>,
    {
        let mut callback_err: Option<ActorError> = None;
        let res = self.amt.for_each_while(|i, v| match f(i, v) {
            Ok(keep_going) => Ok(keep_going),
            Err(e) => {
                callback_err = Some(e);
                Ok(false)
            }
        });
        if let Some(e) = callback_err {
            return Err(e);
        }
        res.with_context_code(ExitCode::USR_ILLEGAL_STATE, || {
            format!("failed to iterate AMT '{}'", self.name)
        })
    }
}
