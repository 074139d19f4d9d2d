// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::error::StoreError;
use super::index::{FsStat, SectorIndex, StorageInfo};
use super::sector_file::{FileTypes, SectorPaths, SectorStorageIds, SECTOR_FILE_TYPES};
use super::{parse_sector_id, sector_name, SectorId, StorageId};
use fvm_shared::sector::RegisteredSealProof;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the metadata file at the root of every storage path.
pub const META_FILE_NAME: &str = "meta.json";

/// Contents of the per-storage metadata file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageMeta {
    pub id: StorageId,
    pub weight: u64,
    pub can_seal: bool,
    pub can_store: bool,
}

/// Access to the machine the store runs on: storage roots to open at start
/// and filesystem statistics for each of them.
pub trait LocalStorage: Send + Sync {
    fn get_stat(&self, path: &Path) -> Result<FsStat, StoreError>;
    fn get_paths(&self) -> Result<Vec<PathBuf>, StoreError>;
}

/// Sector paths handed out by [`LocalStore::acquire_sector`], together with
/// the ids of the storages backing them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcquireSectorResponse {
    pub paths: SectorPaths,
    pub storages: SectorStorageIds,
}

struct Inner {
    paths: HashMap<StorageId, PathBuf>,
    index: SectorIndex,
}

/// Local sector file store. Wraps the index with a per-process registry of
/// storage roots on this machine.
///
/// A single reader-writer lock guards the path registry and index: sector
/// acquisition takes it shared, while `remove`, `move_storage` and
/// `open_path` take it exclusively. `move_storage` holds the lock across
/// the rename and the index update so a sector file is never visible in two
/// `can_store` storages outside the lock.
pub struct LocalStore {
    storage: Box<dyn LocalStorage>,
    urls: Vec<String>,
    inner: RwLock<Inner>,
}

impl LocalStore {
    /// Creates a store and opens every path reported by `storage`.
    pub fn new(storage: Box<dyn LocalStorage>, urls: Vec<String>) -> Result<Self, StoreError> {
        let store = LocalStore {
            storage,
            urls,
            inner: RwLock::new(Inner {
                paths: HashMap::new(),
                index: SectorIndex::new(),
            }),
        };
        for path in store.storage.get_paths()? {
            store.open_path(&path)?;
        }
        Ok(store)
    }

    /// Resolves filesystem paths for the sector's `existing` file types and
    /// allocates paths for the `allocate` ones. The two masks must be
    /// disjoint.
    pub fn acquire_sector(
        &self,
        sector: SectorId,
        proof: RegisteredSealProof,
        existing: FileTypes,
        allocate: FileTypes,
        sealing: bool,
    ) -> Result<AcquireSectorResponse, StoreError> {
        if existing.intersects(allocate) {
            return Err(StoreError::FindAndAllocate);
        }
        let inner = self.inner.read();
        acquire_locked(&inner, sector, proof, existing, allocate, sealing)
    }

    /// Removes a single sector file type from every local storage holding
    /// it, dropping the index records first.
    pub fn remove(&self, sector: SectorId, ty: FileTypes) -> Result<(), StoreError> {
        let ty = ty.single()?;
        let mut inner = self.inner.write();

        let holders = inner.index.storage_find_sector(sector, ty, false);
        if holders.is_empty() {
            return Err(StoreError::NotFoundSector);
        }

        for storage_info in holders {
            let Some(root) = inner.paths.get(&storage_info.id).cloned() else {
                continue;
            };
            inner
                .index
                .storage_drop_sector(&storage_info.id, sector, ty)?;

            let sector_path = root.join(ty.dir_name()).join(sector_name(&sector));
            info!("remove {}", sector_path.display());
            if let Err(e) = remove_all(&sector_path) {
                warn!("removing {}: {}", sector_path.display(), e);
                return Err(StoreError::CannotRemoveSector(e.to_string()));
            }
        }
        Ok(())
    }

    /// Moves the given sector file types into `can_store` storage. Files
    /// already hosted on a `can_store` storage are left in place.
    pub fn move_storage(
        &self,
        sector: SectorId,
        proof: RegisteredSealProof,
        types: FileTypes,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let dest = acquire_locked(&inner, sector, proof, FileTypes::empty(), types, false)?;
        let src = acquire_locked(&inner, sector, proof, types, FileTypes::empty(), false)?;

        for ty in types.iter() {
            let source_id = src.storages.get(ty).ok_or(StoreError::NotFoundSector)?.clone();
            let source_info = inner.index.get_storage_info(&source_id)?;

            let dest_id = dest.storages.get(ty).ok_or(StoreError::NotFoundPath)?.clone();

            if source_id == dest_id || source_info.can_store {
                continue;
            }

            let source_path = src.paths.get(ty).ok_or(StoreError::NotFoundSector)?;
            let dest_path = dest.paths.get(ty).ok_or(StoreError::NotFoundPath)?;

            inner.index.storage_drop_sector(&source_id, sector, ty)?;
            info!(
                "move {} -> {}",
                source_path.display(),
                dest_path.display()
            );
            fs::rename(source_path, dest_path)
                .map_err(|e| StoreError::CannotMoveSector(e.to_string()))?;
            inner.index.storage_declare_sector(&dest_id, sector, ty)?;
        }
        Ok(())
    }

    /// Initializes a fresh storage root: writes a metadata file with a new
    /// random id and opens the path.
    pub fn init_path(
        &self,
        path: &Path,
        weight: u64,
        can_seal: bool,
        can_store: bool,
    ) -> Result<StorageId, StoreError> {
        let meta_path = path.join(META_FILE_NAME);
        if meta_path.exists() {
            return Err(StoreError::InvalidStorageConfig(format!(
                "{} already initialized",
                path.display()
            )));
        }
        fs::create_dir_all(path).map_err(|e| StoreError::CannotCreateDir(e.to_string()))?;
        let meta = LocalStorageMeta {
            id: uuid::Uuid::new_v4().to_string(),
            weight,
            can_seal,
            can_store,
        };
        let raw = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StoreError::InvalidStorageConfig(e.to_string()))?;
        fs::write(&meta_path, raw)
            .map_err(|e| StoreError::InvalidStorageConfig(e.to_string()))?;
        self.open_path(path)?;
        Ok(meta.id)
    }

    /// Reads the metadata file under `path`, attaches the storage to the
    /// index, makes sure the per-type directories exist and declares every
    /// sector file found in them.
    pub fn open_path(&self, path: &Path) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let meta_path = path.join(META_FILE_NAME);
        let raw = fs::read(&meta_path)
            .map_err(|e| StoreError::InvalidStorageConfig(format!("{}: {e}", meta_path.display())))?;
        let meta: LocalStorageMeta = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::InvalidStorageConfig(format!("{}: {e}", meta_path.display())))?;

        if inner.paths.contains_key(&meta.id) {
            return Err(StoreError::DuplicateStorage(meta.id));
        }

        let stat = self.storage.get_stat(path)?;
        inner.index.storage_attach(
            StorageInfo {
                id: meta.id.clone(),
                urls: self.urls.clone(),
                weight: meta.weight,
                can_seal: meta.can_seal,
                can_store: meta.can_store,
            },
            stat,
        );

        for ty in SECTOR_FILE_TYPES {
            let dir_path = path.join(ty.dir_name());
            if !dir_path.exists() {
                fs::create_dir_all(&dir_path)
                    .map_err(|e| StoreError::CannotCreateDir(e.to_string()))?;
                continue;
            }
            let entries = fs::read_dir(&dir_path)
                .map_err(|e| StoreError::InvalidStorageConfig(e.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::InvalidStorageConfig(e.to_string()))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                match parse_sector_id(&name) {
                    Ok(sector) => {
                        inner.index.storage_declare_sector(&meta.id, sector, ty)?;
                    }
                    Err(_) => {
                        warn!(
                            "skipping unrecognized file {} in {}",
                            name,
                            dir_path.display()
                        );
                    }
                }
            }
        }

        inner.paths.insert(meta.id, path.to_path_buf());
        Ok(())
    }

    /// Capacity and usage of a local storage.
    pub fn get_fs_stat(&self, id: &StorageId) -> Result<FsStat, StoreError> {
        let inner = self.inner.read();
        let path = inner
            .paths
            .get(id)
            .ok_or_else(|| StoreError::NotFoundStorage(id.clone()))?;
        self.storage.get_stat(path)
    }

    /// Runs `f` against the sector index under the store lock.
    pub fn with_index<R>(&self, f: impl FnOnce(&SectorIndex) -> R) -> R {
        let inner = self.inner.read();
        f(&inner.index)
    }

    /// Runs `f` against the mutable sector index under the store lock.
    pub fn with_index_mut<R>(&self, f: impl FnOnce(&mut SectorIndex) -> R) -> R {
        let mut inner = self.inner.write();
        f(&mut inner.index)
    }
}

fn remove_all(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn acquire_locked(
    inner: &Inner,
    sector: SectorId,
    proof: RegisteredSealProof,
    existing: FileTypes,
    allocate: FileTypes,
    sealing: bool,
) -> Result<AcquireSectorResponse, StoreError> {
    let mut response = AcquireSectorResponse::default();

    for ty in existing.iter() {
        for storage_info in inner.index.storage_find_sector(sector, ty, false) {
            let Some(root) = inner.paths.get(&storage_info.id) else {
                continue;
            };
            let spath = root.join(ty.dir_name()).join(sector_name(&sector));
            response.paths.set(ty, spath);
            response.storages.set(ty, storage_info.id);
            break;
        }
    }

    for ty in allocate.iter() {
        let candidates = inner.index.storage_best_alloc(ty, proof, sealing)?;
        let mut best: Option<(PathBuf, StorageId)> = None;
        for storage_info in candidates {
            let Some(root) = inner.paths.get(&storage_info.id) else {
                continue;
            };
            let spath = root.join(ty.dir_name()).join(sector_name(&sector));
            best = Some((spath, storage_info.id));
            break;
        }
        match best {
            Some((path, id)) => {
                response.paths.set(ty, path);
                response.storages.set(ty, id);
            }
            None => return Err(StoreError::NotFoundPath),
        }
    }

    Ok(response)
}
