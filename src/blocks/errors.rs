// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Tipset contains no blocks
    #[error("No blocks for tipset")]
    NoBlocks,
    /// Tipset headers are inconsistent with each other
    #[error("Invalid tipset: {0}")]
    InvalidTipset(String),
}
