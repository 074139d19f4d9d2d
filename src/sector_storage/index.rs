// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::error::StoreError;
use super::sector_file::SectorFileType;
use super::{SectorId, StorageId};
use fvm_shared::sector::RegisteredSealProof;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// A storage declaration: where sector files may be fetched from, how the
/// storage participates in allocation, and how it is weighted against its
/// peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub id: StorageId,
    /// URLs other nodes can fetch sector files from.
    pub urls: Vec<String>,
    /// Relative preference among storages that pass the allocation filters.
    pub weight: u64,
    /// Sealing scratch space; fast, usually local.
    pub can_seal: bool,
    /// Long-term storage for proven sectors.
    pub can_store: bool,
}

/// Filesystem usage of an attached storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStat {
    pub capacity: u64,
    pub available: u64,
    pub reserved: u64,
}

// Per-type space overhead while a sector seals and after it is finalized,
// in tenths of the proof's sector size.
const OVERHEAD_SEAL: [(SectorFileType, u64); 3] = [
    (SectorFileType::Unsealed, 10),
    (SectorFileType::Sealed, 10),
    (SectorFileType::Cache, 70),
];
const OVERHEAD_FINALIZED: [(SectorFileType, u64); 3] = [
    (SectorFileType::Unsealed, 10),
    (SectorFileType::Sealed, 10),
    (SectorFileType::Cache, 2),
];

fn space_req(
    ty: SectorFileType,
    proof: RegisteredSealProof,
    sealing: bool,
) -> Result<u64, StoreError> {
    let sector_size = proof
        .sector_size()
        .map_err(|e| StoreError::Other(format!("unsupported seal proof: {e}")))? as u64;
    let table = if sealing {
        &OVERHEAD_SEAL
    } else {
        &OVERHEAD_FINALIZED
    };
    let overhead = table
        .iter()
        .find(|(t, _)| *t == ty)
        .map(|(_, o)| *o)
        .unwrap_or(10);
    Ok(overhead * sector_size / 10)
}

struct StorageEntry {
    info: StorageInfo,
    fs_stat: FsStat,
}

/// In-memory index of every attached storage and the sector files each one
/// holds. Rebuilt from on-disk metadata at start; see
/// [`super::LocalStore::open_path`].
#[derive(Default)]
pub struct SectorIndex {
    storages: HashMap<StorageId, StorageEntry>,
    sectors: HashMap<(SectorId, SectorFileType), Vec<StorageId>>,
}

impl SectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a storage with its capacity. Attaching an id that is
    /// already known updates its stat and merges the advertised URLs.
    pub fn storage_attach(&mut self, info: StorageInfo, stat: FsStat) {
        debug!(id = %info.id, "attach storage");
        match self.storages.get_mut(&info.id) {
            Some(entry) => {
                for url in info.urls {
                    if !entry.info.urls.contains(&url) {
                        entry.info.urls.push(url);
                    }
                }
                entry.info.weight = info.weight;
                entry.info.can_seal = info.can_seal;
                entry.info.can_store = info.can_store;
                entry.fs_stat = stat;
            }
            None => {
                self.storages
                    .insert(info.id.clone(), StorageEntry { info, fs_stat: stat });
            }
        }
    }

    /// Records that `storage_id` holds the given sector file.
    pub fn storage_declare_sector(
        &mut self,
        storage_id: &StorageId,
        sector: SectorId,
        ty: SectorFileType,
    ) -> Result<(), StoreError> {
        if !self.storages.contains_key(storage_id) {
            return Err(StoreError::NotFoundStorage(storage_id.clone()));
        }
        let holders = self.sectors.entry((sector, ty)).or_default();
        if !holders.contains(storage_id) {
            holders.push(storage_id.clone());
        }
        Ok(())
    }

    /// Removes the record that `storage_id` holds the given sector file.
    pub fn storage_drop_sector(
        &mut self,
        storage_id: &StorageId,
        sector: SectorId,
        ty: SectorFileType,
    ) -> Result<(), StoreError> {
        if let Some(holders) = self.sectors.get_mut(&(sector, ty)) {
            holders.retain(|id| id != storage_id);
            if holders.is_empty() {
                self.sectors.remove(&(sector, ty));
            }
        }
        Ok(())
    }

    /// Lists every storage holding the given sector file, best weight first.
    /// With `allow_fetch`, storages the file could be fetched into are
    /// appended after the holders.
    pub fn storage_find_sector(
        &self,
        sector: SectorId,
        ty: SectorFileType,
        allow_fetch: bool,
    ) -> Vec<StorageInfo> {
        let holders = self
            .sectors
            .get(&(sector, ty))
            .cloned()
            .unwrap_or_default();
        let mut found: Vec<StorageInfo> = holders
            .iter()
            .filter_map(|id| self.storages.get(id))
            .map(|e| e.info.clone())
            .collect();
        found.sort_by(|a, b| b.weight.cmp(&a.weight));

        if allow_fetch {
            let mut fetchable: Vec<StorageInfo> = self
                .storages
                .values()
                .filter(|e| {
                    e.info.can_store && !e.info.urls.is_empty() && !holders.contains(&e.info.id)
                })
                .map(|e| e.info.clone())
                .collect();
            fetchable.sort_by(|a, b| b.weight.cmp(&a.weight));
            found.extend(fetchable);
        }
        found
    }

    /// Lists allocation candidates for a new file of the given type, best
    /// weight first, filtered by the `sealing` flag and free space for the
    /// proof type.
    pub fn storage_best_alloc(
        &self,
        allocate: SectorFileType,
        proof: RegisteredSealProof,
        sealing: bool,
    ) -> Result<Vec<StorageInfo>, StoreError> {
        let space = space_req(allocate, proof, sealing)?;
        let mut candidates: Vec<&StorageEntry> = self
            .storages
            .values()
            .filter(|e| {
                let mode_ok = if sealing {
                    e.info.can_seal
                } else {
                    e.info.can_store
                };
                mode_ok && e.fs_stat.available >= space
            })
            .collect();
        candidates.sort_by(|a, b| b.info.weight.cmp(&a.info.weight));
        Ok(candidates.into_iter().map(|e| e.info.clone()).collect())
    }

    pub fn get_storage_info(&self, id: &StorageId) -> Result<StorageInfo, StoreError> {
        self.storages
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| StoreError::NotFoundStorage(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, weight: u64, can_seal: bool, can_store: bool) -> StorageInfo {
        StorageInfo {
            id: id.to_string(),
            urls: vec![],
            weight,
            can_seal,
            can_store,
        }
    }

    fn stat(available: u64) -> FsStat {
        FsStat {
            capacity: available,
            available,
            reserved: 0,
        }
    }

    const SECTOR: SectorId = SectorId {
        miner: 1000,
        sector: 1,
    };

    #[test]
    fn declare_find_drop() {
        let mut index = SectorIndex::new();
        index.storage_attach(info("a", 1, true, true), stat(1 << 30));
        index.storage_attach(info("b", 5, true, true), stat(1 << 30));

        index
            .storage_declare_sector(&"a".to_string(), SECTOR, SectorFileType::Sealed)
            .unwrap();
        index
            .storage_declare_sector(&"b".to_string(), SECTOR, SectorFileType::Sealed)
            .unwrap();

        let found = index.storage_find_sector(SECTOR, SectorFileType::Sealed, false);
        assert_eq!(found.len(), 2);
        // best weight first
        assert_eq!(found[0].id, "b");

        index
            .storage_drop_sector(&"b".to_string(), SECTOR, SectorFileType::Sealed)
            .unwrap();
        let found = index.storage_find_sector(SECTOR, SectorFileType::Sealed, false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[test]
    fn declare_unknown_storage_fails() {
        let mut index = SectorIndex::new();
        assert_eq!(
            index.storage_declare_sector(&"nope".to_string(), SECTOR, SectorFileType::Cache),
            Err(StoreError::NotFoundStorage("nope".to_string()))
        );
    }

    #[test]
    fn best_alloc_filters_by_space_and_mode() {
        let mut index = SectorIndex::new();
        // too small for a 2 KiB cache (70/10 * 2048 bytes)
        index.storage_attach(info("small", 10, true, true), stat(1024));
        index.storage_attach(info("seal", 3, true, false), stat(1 << 20));
        index.storage_attach(info("store", 7, false, true), stat(1 << 20));

        let proof = RegisteredSealProof::StackedDRG2KiBV1;
        let sealing = index
            .storage_best_alloc(SectorFileType::Cache, proof, true)
            .unwrap();
        assert_eq!(sealing.len(), 1);
        assert_eq!(sealing[0].id, "seal");

        let storing = index
            .storage_best_alloc(SectorFileType::Sealed, proof, false)
            .unwrap();
        assert_eq!(storing.len(), 1);
        assert_eq!(storing[0].id, "store");
    }

    #[test]
    fn find_with_fetch_appends_remote_candidates() {
        let mut index = SectorIndex::new();
        let mut remote = info("remote", 2, false, true);
        remote.urls = vec!["http://remote/".to_string()];
        index.storage_attach(remote, stat(1 << 30));
        index.storage_attach(info("local", 9, true, true), stat(1 << 30));
        index
            .storage_declare_sector(&"local".to_string(), SECTOR, SectorFileType::Unsealed)
            .unwrap();

        let local_only = index.storage_find_sector(SECTOR, SectorFileType::Unsealed, false);
        assert_eq!(local_only.len(), 1);

        let with_fetch = index.storage_find_sector(SECTOR, SectorFileType::Unsealed, true);
        assert_eq!(with_fetch.len(), 2);
        assert_eq!(with_fetch[0].id, "local");
        assert_eq!(with_fetch[1].id, "remote");
    }
}
