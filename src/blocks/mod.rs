// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod block;
mod errors;
mod header;
mod tipset;

pub use block::{Block, FullTipset};
pub use errors::Error;
pub use header::BlockHeader;
pub use tipset::{Tipset, TipsetKey};

use std::sync::Arc;

/// Direction of a head change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadChangeType {
    Current,
    Apply,
    Revert,
}

/// Head change notification delivered on the chain notify feed. `Apply`
/// extends the subscriber's view of the chain with a tipset, `Revert`
/// undoes the most recent apply during a reorg.
#[derive(Clone, Debug)]
pub struct HeadChange {
    pub change: HeadChangeType,
    pub tipset: Arc<FullTipset>,
}
