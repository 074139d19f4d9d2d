// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::api::ChainApi;
use super::ask::{SignedStorageAsk, StorageAsk, DEFAULT_MIN_PIECE_SIZE};
use super::error::Error;
use crate::db::Store;
use crate::key_management::Signer;
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::RegisteredSealProof;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Datastore key the current signed ask is persisted under.
const ASK_KEY: &str = "/storage-ask/latest";

/// Provider-local cell holding the current signed ask for the configured
/// miner. Replaced atomically by `add_ask`, persisted across restarts.
pub struct StoredAsk<DB> {
    api: Arc<dyn ChainApi>,
    signer: Arc<dyn Signer>,
    db: DB,
    actor: Address,
    max_piece_size: PaddedPieceSize,
    ask: RwLock<Option<SignedStorageAsk>>,
}

impl<DB: Store> StoredAsk<DB> {
    /// Loads the persisted ask, if any. Until `add_ask` is called on a
    /// fresh datastore there is no ask to serve.
    pub fn new(
        api: Arc<dyn ChainApi>,
        signer: Arc<dyn Signer>,
        db: DB,
        actor: Address,
        proof: RegisteredSealProof,
    ) -> Result<Self, Error> {
        let max_piece_size = PaddedPieceSize(
            proof
                .sector_size()
                .map_err(|e| Error::Other(format!("unsupported seal proof: {e}")))?
                as u64,
        );
        let ask = match db.read(ASK_KEY)? {
            Some(bytes) => Some(from_slice(&bytes)?),
            None => None,
        };
        Ok(StoredAsk {
            api,
            signer,
            db,
            actor,
            max_piece_size,
            ask: RwLock::new(ask),
        })
    }

    /// Mints a new ask with the next sequence number, signs it with the
    /// worker key, persists it and atomically replaces the current one.
    pub async fn add_ask(&self, price: TokenAmount, duration: ChainEpoch) -> Result<(), Error> {
        let head = self.api.chain_head().await?;
        let key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let epoch = head.epoch();

        let mut guard = self.ask.write().await;
        let seq_no = guard.as_ref().map(|a| a.ask.seq_no + 1).unwrap_or(0);
        let ask = StorageAsk {
            price,
            min_piece_size: DEFAULT_MIN_PIECE_SIZE,
            max_piece_size: self.max_piece_size,
            miner: self.actor,
            timestamp: epoch,
            expiry: epoch + duration,
            seq_no,
        };

        let miner_info = self.api.state_miner_info(&self.actor, &key).await?;
        let worker_key = self.api.state_account_key(&miner_info.worker, &key).await?;
        let signature = self
            .signer
            .sign_bytes(&to_vec(&ask)?, &worker_key)
            .map_err(|e| Error::Signer(e.to_string()))?;
        let signed = SignedStorageAsk { ask, signature };

        self.db.write(ASK_KEY, to_vec(&signed)?)?;
        debug!(seq_no, "stored new ask");
        *guard = Some(signed);
        Ok(())
    }

    /// Returns the current signed ask for `miner`.
    pub async fn get_ask(&self, miner: &Address) -> Result<SignedStorageAsk, Error> {
        if *miner != self.actor {
            return Err(Error::AskNotFound(*miner));
        }
        self.ask
            .read()
            .await
            .clone()
            .ok_or(Error::AskNotFound(*miner))
    }
}
