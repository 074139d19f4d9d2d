// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::actor::market::{DealProposal, DealState};
use crate::actor::miner::MinerInfo;
use crate::blocks::{FullTipset, HeadChange, TipsetKey};
use crate::message::SignedMessage;
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::message::Message;
use fvm_shared::receipt::Receipt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("chain call failed: {0}")]
    ChainCall(String),
    #[error("message wait failed: {0}")]
    MessageWait(String),
    #[error("{0}")]
    Other(String),
}

/// On-chain record of a published deal, as returned by
/// [`ChainApi::state_market_storage_deal`].
#[derive(Clone, Debug, PartialEq)]
pub struct MarketDeal {
    pub proposal: DealProposal,
    pub state: DealState,
}

/// The blockchain client consumed by the storage market. Implemented by the
/// embedding node; every method maps onto one of its chain/state/mpool
/// facilities.
#[async_trait]
pub trait ChainApi: Send + Sync + 'static {
    /// Current head of the chain.
    async fn chain_head(&self) -> Result<Arc<FullTipset>, ApiError>;

    /// Subscribe to head changes. Chain-derived events are delivered in
    /// chain order: tipset height first, then message index.
    fn chain_notify(&self) -> broadcast::Receiver<Vec<HeadChange>>;

    /// Static miner actor info at the given tipset.
    async fn state_miner_info(
        &self,
        miner: &Address,
        tipset: &TipsetKey,
    ) -> Result<MinerInfo, ApiError>;

    /// Resolves an actor address to the underlying key address.
    async fn state_account_key(
        &self,
        address: &Address,
        tipset: &TipsetKey,
    ) -> Result<Address, ApiError>;

    /// Ensures `amount` is available in the market actor escrow for
    /// `address`. Returns the CID of the funding message if one had to be
    /// sent, `None` when the escrow already covers the amount.
    async fn market_ensure_available(
        &self,
        address: &Address,
        worker: &Address,
        amount: &TokenAmount,
        tipset: &TipsetKey,
    ) -> Result<Option<Cid>, ApiError>;

    /// Assigns a nonce, signs and submits a message to the message pool.
    /// Nonce assignment happens under the pool's per-address lock so
    /// signatures never reuse nonces.
    async fn mpool_push_message(&self, message: Message) -> Result<SignedMessage, ApiError>;

    /// Submits an already-signed message to the message pool.
    async fn mpool_push(&self, message: SignedMessage) -> Result<Cid, ApiError>;

    /// Waits until the message lands in a tipset and returns its receipt.
    async fn state_wait_msg(&self, cid: &Cid) -> Result<Receipt, ApiError>;

    /// Reads a published deal's on-chain state.
    async fn state_market_storage_deal(
        &self,
        deal_id: DealID,
        tipset: &TipsetKey,
    ) -> Result<MarketDeal, ApiError>;
}
