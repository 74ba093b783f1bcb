// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use anyhow::Result;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;

/// Block traffic seen by a [`MemoryBlockstore`] since creation or the last reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: usize,
    pub writes: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
}

/// Blockstore held in memory by the mock runtime.
#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: RefCell<HashMap<Cid, Vec<u8>>>,
    stats: Cell<StoreStats>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.get()
    }

    pub fn reset_stats(&self) {
        self.stats.set(StoreStats::default());
    }

    pub fn len(&self) -> usize {
        self.blocks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, f: impl FnOnce(&mut StoreStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl Blockstore for MemoryBlockstore {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        let found = self.blocks.borrow().get(cid).cloned();
        let len = found.as_ref().map_or(0, Vec::len);
        self.record(|s| {
            s.reads += 1;
            s.bytes_read += len;
        });
        Ok(found)
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        self.record(|s| s.reads += 1);
        Ok(self.blocks.borrow().contains_key(cid))
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> Result<()> {
        self.record(|s| {
            s.writes += 1;
            s.bytes_written += block.len();
        });
        self.blocks.borrow_mut().insert(*k, block.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_blockstore::Block;
    use multihash::Code;

    #[test]
    fn counts_block_traffic() {
        let store = MemoryBlockstore::new();
        let block = Block::new(0x55, &b"deadline"[..]);

        assert_eq!(None, store.get(&block.cid(Code::Blake2b256)).unwrap());
        assert_eq!(StoreStats { reads: 1, ..Default::default() }, store.stats());

        let cid = store.put(Code::Blake2b256, &block).unwrap();
        assert_eq!(Some(block.data), store.get(&cid).unwrap().as_deref());
        let n = block.len();
        assert_eq!(
            StoreStats { reads: 2, writes: 1, bytes_read: n, bytes_written: n },
            store.stats()
        );
        assert_eq!(1, store.len());

        store.reset_stats();
        assert!(store.has(&cid).unwrap());
        assert_eq!(StoreStats { reads: 1, ..Default::default() }, store.stats());
    }
}
