// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The storage market: paired client and provider subsystems that
//! negotiate, fund, publish, transfer and activate storage deals over
//! authenticated peer streams, under the consensus rules of the chain.

pub mod api;
pub mod ask;
pub mod client;
pub mod error;
pub mod events;
pub mod fsm;
pub mod network;
pub mod pieceio;
pub mod provider;
pub mod store;
pub mod stored_ask;
pub mod types;

pub use ask::{SignedStorageAsk, StorageAsk};
pub use client::{ClientEvent, StorageClient, StorageClientConfig};
pub use error::Error;
pub use events::{DealEnd, Events, EventsError};
pub use provider::{ProviderEvent, StorageProvider, StorageProviderConfig};
pub use stored_ask::StoredAsk;
pub use types::{
    ClientDeal, DataRef, MinerDeal, PeerInfo, StorageDealStatus, StorageProviderInfo,
    TRANSFER_TYPE_GRAPHSYNC, TRANSFER_TYPE_MANUAL,
};
