// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::StorageId;
use thiserror::Error;

/// Sector store error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid sector file name")]
    InvalidSectorName,
    #[error("invalid storage config: {0}")]
    InvalidStorageConfig(String),
    #[error("duplicate storage id: {0}")]
    DuplicateStorage(StorageId),
    #[error("storage not found: {0}")]
    NotFoundStorage(StorageId),
    #[error("no path suitable for allocation found")]
    NotFoundPath,
    #[error("sector not found in storage")]
    NotFoundSector,
    #[error("cannot create storage directory: {0}")]
    CannotCreateDir(String),
    #[error("cannot move sector file: {0}")]
    CannotMoveSector(String),
    #[error("cannot remove sector file: {0}")]
    CannotRemoveSector(String),
    #[error("remove expects a single file type")]
    RemoveSeveralFileTypes,
    #[error("cannot both find and allocate a file type in one acquire")]
    FindAndAllocate,
    #[error("local storage: {0}")]
    LocalStorage(String),
    #[error("{0}")]
    Other(String),
}
