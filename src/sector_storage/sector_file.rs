// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::error::StoreError;
use super::StorageId;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

/// A single kind of sector file kept on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u64)]
pub enum SectorFileType {
    Unsealed = 1,
    Sealed = 2,
    Cache = 4,
}

/// All file types, in the order directories are scanned.
pub const SECTOR_FILE_TYPES: [SectorFileType; 3] = [
    SectorFileType::Unsealed,
    SectorFileType::Sealed,
    SectorFileType::Cache,
];

impl SectorFileType {
    /// Directory name under a storage root holding files of this type.
    pub fn dir_name(self) -> &'static str {
        match self {
            SectorFileType::Unsealed => "unsealed",
            SectorFileType::Sealed => "sealed",
            SectorFileType::Cache => "cache",
        }
    }
}

impl fmt::Display for SectorFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A bitmask of sector file types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileTypes(u64);

impl FileTypes {
    pub const fn empty() -> Self {
        FileTypes(0)
    }

    pub fn has(self, ty: SectorFileType) -> bool {
        self.0 & ty as u64 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: FileTypes) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns `Ok` when the mask holds exactly one file type.
    pub fn single(self) -> Result<SectorFileType, StoreError> {
        match self.iter().collect::<Vec<_>>().as_slice() {
            [ty] => Ok(*ty),
            _ => Err(StoreError::RemoveSeveralFileTypes),
        }
    }

    pub fn iter(self) -> impl Iterator<Item = SectorFileType> {
        SECTOR_FILE_TYPES.into_iter().filter(move |t| self.has(*t))
    }
}

impl From<SectorFileType> for FileTypes {
    fn from(ty: SectorFileType) -> Self {
        FileTypes(ty as u64)
    }
}

impl BitOr for FileTypes {
    type Output = FileTypes;
    fn bitor(self, rhs: Self) -> Self {
        FileTypes(self.0 | rhs.0)
    }
}

impl BitOr<SectorFileType> for FileTypes {
    type Output = FileTypes;
    fn bitor(self, rhs: SectorFileType) -> Self {
        FileTypes(self.0 | rhs as u64)
    }
}

impl BitOr<SectorFileType> for SectorFileType {
    type Output = FileTypes;
    fn bitor(self, rhs: SectorFileType) -> FileTypes {
        FileTypes(self as u64 | rhs as u64)
    }
}

impl BitOrAssign<SectorFileType> for FileTypes {
    fn bitor_assign(&mut self, rhs: SectorFileType) {
        self.0 |= rhs as u64;
    }
}

/// Filesystem paths of a sector's files, one slot per file type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectorPaths {
    pub unsealed: Option<PathBuf>,
    pub sealed: Option<PathBuf>,
    pub cache: Option<PathBuf>,
}

impl SectorPaths {
    pub fn get(&self, ty: SectorFileType) -> Option<&PathBuf> {
        match ty {
            SectorFileType::Unsealed => self.unsealed.as_ref(),
            SectorFileType::Sealed => self.sealed.as_ref(),
            SectorFileType::Cache => self.cache.as_ref(),
        }
    }

    pub fn set(&mut self, ty: SectorFileType, path: PathBuf) {
        match ty {
            SectorFileType::Unsealed => self.unsealed = Some(path),
            SectorFileType::Sealed => self.sealed = Some(path),
            SectorFileType::Cache => self.cache = Some(path),
        }
    }
}

/// Identifiers of the storages backing each acquired path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectorStorageIds {
    pub unsealed: Option<StorageId>,
    pub sealed: Option<StorageId>,
    pub cache: Option<StorageId>,
}

impl SectorStorageIds {
    pub fn get(&self, ty: SectorFileType) -> Option<&StorageId> {
        match ty {
            SectorFileType::Unsealed => self.unsealed.as_ref(),
            SectorFileType::Sealed => self.sealed.as_ref(),
            SectorFileType::Cache => self.cache.as_ref(),
        }
    }

    pub fn set(&mut self, ty: SectorFileType, id: StorageId) {
        match ty {
            SectorFileType::Unsealed => self.unsealed = Some(id),
            SectorFileType::Sealed => self.sealed = Some(id),
            SectorFileType::Cache => self.cache = Some(id),
        }
    }
}
