// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fil_miner_runtime::{actor_error, ActorContext, ActorError, Array};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::sector::{SectorNumber, MAX_SECTOR_NUMBER};

use super::SectorOnChainInfo;

pub const SECTORS_AMT_BITWIDTH: u32 = 5;

/// The set of proven sectors, keyed by sector number.
pub struct Sectors<'db, BS: Blockstore> {
    pub amt: Array<&'db BS, SectorOnChainInfo>,
}

impl<'db, BS: Blockstore> Sectors<'db, BS> {
    pub fn load(store: &'db BS, root: &Cid) -> Result<Self, ActorError> {
        Ok(Self { amt: Array::load(store, root, "sectors")? })
    }

    /// Loads the infos of every listed sector. A missing sector is an error.
    pub fn load_sector(
        &self,
        sector_numbers: &BitField,
    ) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        sector_numbers.iter().map(|number| self.must_get(number)).collect()
    }

    pub fn get(
        &self,
        sector_number: SectorNumber,
    ) -> Result<Option<SectorOnChainInfo>, ActorError> {
        let info = self
            .amt
            .get(sector_number)
            .with_context(|| format!("failed to get sector {}", sector_number))?;
        Ok(info.cloned())
    }

    pub fn must_get(&self, sector_number: SectorNumber) -> Result<SectorOnChainInfo, ActorError> {
        self.get(sector_number)?
            .ok_or_else(|| actor_error!(not_found; "sector {} not found", sector_number))
    }

    /// Writes each info under its own sector number, replacing any earlier entry.
    pub fn store(&mut self, infos: Vec<SectorOnChainInfo>) -> Result<(), ActorError> {
        infos.into_iter().try_for_each(|info| {
            let number = info.sector_number;
            if number > MAX_SECTOR_NUMBER {
                return Err(actor_error!(illegal_argument; "sector number {} out of range", number));
            }
            self.amt.set(number, info).with_context(|| format!("failed to store sector {}", number))
        })
    }

    /// Loads the infos a window PoSt over `proven_sectors` is verified against.
    ///
    /// Each sector in `expected_faults` is replaced by the first sector not in it, so the
    /// proof keeps its shape. Returns nothing when every sector is an expected fault.
    pub fn load_for_proof(
        &self,
        proven_sectors: &BitField,
        expected_faults: &BitField,
    ) -> Result<Vec<SectorOnChainInfo>, ActorError> {
        let Some(stand_in) = (proven_sectors - expected_faults).first() else {
            return Ok(Vec::new());
        };
        let stand_in = self.must_get(stand_in)?;

        proven_sectors
            .iter()
            .map(|number| {
                if expected_faults.get(number) {
                    Ok(stand_in.clone())
                } else {
                    self.must_get(number)
                }
            })
            .collect()
    }
}
