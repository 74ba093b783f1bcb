// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fil_miner_runtime::{actor_error, ActorContext, ActorError, Array};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;
use itertools::Itertools;

use crate::quantize::QuantSpec;

/// Sets of numbers keyed by epoch, stored as an AMT of bitfields.
///
/// Epochs are rounded up by the queue's quantization before use as keys, so nearby epochs
/// share an entry.
pub struct BitFieldQueue<'db, BS: Blockstore> {
    pub amt: Array<&'db BS, BitField>,
    quant: QuantSpec,
}

impl<'db, BS: Blockstore> BitFieldQueue<'db, BS> {
    pub fn new(store: &'db BS, root: &Cid, quant: QuantSpec) -> Result<Self, ActorError> {
        let amt = Array::load(store, root, "bitfield queue")?;
        Ok(Self { amt, quant })
    }

    fn key(&self, epoch: ChainEpoch) -> Result<u64, ActorError> {
        let quantized = self.quant.quantize_up(epoch);
        u64::try_from(quantized)
            .map_err(|_| actor_error!(illegal_argument; "queue epoch {} is negative", epoch))
    }

    /// Merges `values` into the entry for `raw_epoch`.
    pub fn add_to_queue(
        &mut self,
        raw_epoch: ChainEpoch,
        values: &BitField,
    ) -> Result<(), ActorError> {
        if values.is_empty() {
            return Ok(());
        }
        let key = self.key(raw_epoch)?;
        let merged = match self.amt.get(key).with_context(|| format!("reading queue entry {}", key))? {
            Some(existing) => existing | values,
            None => values.clone(),
        };
        self.amt.set(key, merged).with_context(|| format!("writing queue entry {}", key))
    }

    pub fn add_to_queue_values(
        &mut self,
        epoch: ChainEpoch,
        values: impl IntoIterator<Item = u64>,
    ) -> Result<(), ActorError> {
        let bf = BitField::try_from_bits(values)
            .map_err(|e| actor_error!(illegal_argument; "bad queue values: {}", e))?;
        self.add_to_queue(epoch, &bf)
    }

    /// Adds each `(epoch, value)` pair, writing every touched entry once.
    pub fn add_many_to_queue_values(
        &mut self,
        values: impl IntoIterator<Item = (ChainEpoch, u64)>,
    ) -> Result<(), ActorError> {
        let by_epoch = values
            .into_iter()
            .map(|(epoch, value)| (self.quant.quantize_up(epoch), value))
            .into_group_map();
        for (epoch, group) in by_epoch.into_iter().sorted_by_key(|(epoch, _)| *epoch) {
            self.add_to_queue_values(epoch, group.into_iter().sorted().dedup())?;
        }
        Ok(())
    }

    /// Clears `to_remove` from every entry, deleting entries left empty. Other values keep
    /// their numbers.
    pub fn remove(&mut self, to_remove: &BitField) -> Result<(), ActorError> {
        if to_remove.is_empty() {
            return Ok(());
        }
        self.rewrite_entries(|bf| bf.contains_any(to_remove).then(|| bf - to_remove))
            .context("failed to remove from bitfield queue")
    }

    /// Removes the numbers in `to_cut` and shifts the ones above them down to close the gaps.
    /// Used when partitions are dropped from a deadline.
    pub fn cut(&mut self, to_cut: &BitField) -> Result<(), ActorError> {
        self.rewrite_entries(|bf| Some(bf.cut(to_cut)))
            .context("failed to cut from bitfield queue")
    }

    // Replaces each entry for which `f` returns a value, deleting those that come out empty.
    fn rewrite_entries(
        &mut self,
        mut f: impl FnMut(&BitField) -> Option<BitField>,
    ) -> Result<(), ActorError> {
        let mut changed = Vec::new();
        let mut emptied = Vec::new();
        self.amt.for_each(|key, bf| {
            match f(bf) {
                Some(rest) if rest.is_empty() => emptied.push(key),
                Some(rest) if rest != *bf => changed.push((key, rest)),
                _ => {}
            }
            Ok(())
        })?;

        for (key, bf) in changed {
            self.amt.set(key, bf)?;
        }
        self.amt.batch_delete(emptied, true)
    }

    /// Takes every entry keyed at or before `until`, returning the union of their values and
    /// whether anything was taken.
    pub fn pop_until(&mut self, until: ChainEpoch) -> Result<(BitField, bool), ActorError> {
        let mut popped = BitField::new();
        let mut keys = Vec::new();
        self.amt.for_each_while(|key, bf| {
            if key as ChainEpoch > until {
                return Ok(false);
            }
            keys.push(key);
            popped |= bf;
            Ok(true)
        })?;

        if keys.is_empty() {
            return Ok((popped, false));
        }
        self.amt.batch_delete(keys, true)?;
        Ok((popped, true))
    }

    pub fn flush(&mut self) -> Result<Cid, ActorError> {
        self.amt.flush()
    }
}
