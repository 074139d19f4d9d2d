// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sector storage index and local store.
//!
//! The index tracks which attached storage holds which sector file; the
//! local store maps storage ids to filesystem paths, allocates space for new
//! sector files and moves finished sectors to long-term storage.

mod error;
mod index;
mod local_store;
mod sector_file;

pub use error::StoreError;
pub use index::{FsStat, SectorIndex, StorageInfo};
pub use local_store::{
    AcquireSectorResponse, LocalStorage, LocalStorageMeta, LocalStore, META_FILE_NAME,
};
pub use sector_file::{
    FileTypes, SectorFileType, SectorPaths, SectorStorageIds, SECTOR_FILE_TYPES,
};

use fvm_shared::sector::SectorNumber;
use fvm_shared::ActorID;
use once_cell::sync::Lazy;
use regex::Regex;

/// Identifier of an attached storage, unique per fleet.
pub type StorageId = String;

/// Sector ID, scoped to a single miner actor.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct SectorId {
    pub miner: ActorID,
    pub sector: SectorNumber,
}

static SECTOR_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^s-t0([0-9]+)-([0-9]+)$").expect("static regex"));

/// On-disk file name of a sector, `s-t0<miner>-<sector>`.
pub fn sector_name(sector: &SectorId) -> String {
    format!("s-t0{}-{}", sector.miner, sector.sector)
}

/// Parses a sector file name produced by [`sector_name`].
pub fn parse_sector_id(file_name: &str) -> Result<SectorId, StoreError> {
    let captures = SECTOR_NAME_RE
        .captures(file_name)
        .ok_or(StoreError::InvalidSectorName)?;
    let miner = captures[1]
        .parse::<ActorID>()
        .map_err(|_| StoreError::InvalidSectorName)?;
    let sector = captures[2]
        .parse::<SectorNumber>()
        .map_err(|_| StoreError::InvalidSectorName)?;
    Ok(SectorId { miner, sector })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_name_round_trip() {
        let id = SectorId {
            miner: 1000,
            sector: 7,
        };
        let name = sector_name(&id);
        assert_eq!(name, "s-t01000-7");
        assert_eq!(parse_sector_id(&name).unwrap(), id);
    }

    #[test]
    fn bad_names_rejected() {
        for name in ["", "s-t0x-1", "s-t01000-", "sector-7", "s-t01000-7-extra"] {
            assert_eq!(parse_sector_id(name), Err(StoreError::InvalidSectorName));
        }
    }
}
