// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Datastore error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid bytes in datastore: {0}")]
    InvalidBytes(String),
    #[error("{0}")]
    Other(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Error::InvalidBytes(e.to_string())
    }
}
