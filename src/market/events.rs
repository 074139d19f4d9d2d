// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain-event watcher.
//!
//! Turns the head-change feed into per-deal completion futures. A deal is
//! sector-committed once a `ProveCommitSector` message lands for the sector
//! that previously carried a `PreCommitSector` referencing the deal id;
//! the watcher tracks that two-step handshake per `(provider, deal_id)`
//! subscription and resolves the one-shot future when it completes.

use super::api::ChainApi;
use crate::actor::miner::{
    ProveCommitSectorParams, SectorPreCommitInfo, METHOD_PRE_COMMIT_SECTOR,
    METHOD_PROVE_COMMIT_SECTOR,
};
use crate::blocks::{FullTipset, HeadChangeType};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::message::Message;
use fvm_shared::sector::SectorNumber;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventsError {
    /// The watcher was stopped while the subscription was outstanding.
    #[error("events watcher stopped")]
    Stopped,
    #[error("events chain query failed: {0}")]
    Api(String),
}

/// How a published deal left the active phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DealEnd {
    /// The deal term ran to its end epoch.
    Expired,
    /// The deal was slashed at the given epoch.
    Slashed(ChainEpoch),
}

pub type CommitReceiver = oneshot::Receiver<Result<(), EventsError>>;
pub type DealEndReceiver = oneshot::Receiver<Result<DealEnd, EventsError>>;

struct CommitWatch {
    provider: Address,
    deal_id: DealID,
    sector_number: Option<SectorNumber>,
    sender: oneshot::Sender<Result<(), EventsError>>,
}

struct EndWatch {
    deal_id: DealID,
    end_epoch: ChainEpoch,
    sender: oneshot::Sender<Result<DealEnd, EventsError>>,
}

#[derive(Default)]
struct Inner {
    commits: Vec<CommitWatch>,
    ends: Vec<EndWatch>,
    stopped: bool,
}

/// Watches tipset-applied messages for sector commitments and deal ends.
pub struct Events {
    api: Arc<dyn ChainApi>,
    inner: Arc<Mutex<Inner>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Events {
    pub fn new(api: Arc<dyn ChainApi>) -> Self {
        Events {
            api,
            inner: Arc::new(Mutex::new(Inner::default())),
            handle: Mutex::new(None),
        }
    }

    /// Starts consuming the head-change subscription. Idempotent.
    pub fn run(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let mut receiver = self.api.chain_notify();
        let api = self.api.clone();
        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(changes) => {
                        for change in changes {
                            process_change(&api, &inner, change.change, &change.tipset).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("events watcher lagged {n} head changes behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Stops the subscription and resolves every outstanding future with
    /// [`EventsError::Stopped`].
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        let mut inner = self.inner.lock();
        inner.stopped = true;
        for watch in inner.commits.drain(..) {
            let _ = watch.sender.send(Err(EventsError::Stopped));
        }
        for watch in inner.ends.drain(..) {
            let _ = watch.sender.send(Err(EventsError::Stopped));
        }
    }

    /// Completes once a `ProveCommitSector` is applied for the sector that
    /// previously pre-committed `deal_id` on `provider`.
    pub fn on_deal_sector_committed(&self, provider: Address, deal_id: DealID) -> CommitReceiver {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.stopped {
            let _ = sender.send(Err(EventsError::Stopped));
            return receiver;
        }
        inner.commits.push(CommitWatch {
            provider,
            deal_id,
            sector_number: None,
            sender,
        });
        receiver
    }

    /// Completes once the deal's term ends or the market actor records a
    /// slash for it.
    pub fn on_deal_expired_or_slashed(
        &self,
        deal_id: DealID,
        end_epoch: ChainEpoch,
    ) -> DealEndReceiver {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.stopped {
            let _ = sender.send(Err(EventsError::Stopped));
            return receiver;
        }
        inner.ends.push(EndWatch {
            deal_id,
            end_epoch,
            sender,
        });
        receiver
    }
}

async fn process_change(
    api: &Arc<dyn ChainApi>,
    inner: &Arc<Mutex<Inner>>,
    change: HeadChangeType,
    tipset: &FullTipset,
) {
    match change {
        HeadChangeType::Apply | HeadChangeType::Current => {
            apply_tipset(inner, tipset);
            check_deal_ends(api, inner, tipset).await;
        }
        HeadChangeType::Revert => revert_tipset(inner, tipset),
    }
}

fn apply_tipset(inner: &Arc<Mutex<Inner>>, tipset: &FullTipset) {
    let mut inner = inner.lock();
    for block in tipset.blocks() {
        for message in block.bls_msgs() {
            apply_message(&mut inner, message);
        }
        for signed in block.secp_msgs() {
            apply_message(&mut inner, signed.message());
        }
    }
}

fn apply_message(inner: &mut Inner, message: &Message) {
    match message.method_num {
        METHOD_PRE_COMMIT_SECTOR => {
            let info: SectorPreCommitInfo = match message.params.deserialize() {
                Ok(info) => info,
                Err(e) => {
                    warn!("undecodable PreCommitSector params: {e}");
                    return;
                }
            };
            for watch in inner.commits.iter_mut() {
                if watch.provider == message.to && info.deal_ids.contains(&watch.deal_id) {
                    debug!(
                        deal_id = watch.deal_id,
                        sector = info.sector_number,
                        "deal pre-committed"
                    );
                    watch.sector_number = Some(info.sector_number);
                }
            }
        }
        METHOD_PROVE_COMMIT_SECTOR => {
            let params: ProveCommitSectorParams = match message.params.deserialize() {
                Ok(params) => params,
                Err(e) => {
                    warn!("undecodable ProveCommitSector params: {e}");
                    return;
                }
            };
            let mut i = 0;
            while i < inner.commits.len() {
                let watch = &inner.commits[i];
                if watch.provider == message.to
                    && watch.sector_number == Some(params.sector_number)
                {
                    debug!(deal_id = watch.deal_id, "deal sector committed");
                    let watch = inner.commits.swap_remove(i);
                    let _ = watch.sender.send(Ok(()));
                } else {
                    i += 1;
                }
            }
        }
        _ => {}
    }
}

fn revert_tipset(inner: &Arc<Mutex<Inner>>, tipset: &FullTipset) {
    let mut inner = inner.lock();
    for block in tipset.blocks() {
        let messages = block
            .bls_msgs()
            .iter()
            .chain(block.secp_msgs().iter().map(|s| s.message()));
        for message in messages {
            if message.method_num != METHOD_PRE_COMMIT_SECTOR {
                continue;
            }
            let info: SectorPreCommitInfo = match message.params.deserialize() {
                Ok(info) => info,
                Err(_) => continue,
            };
            for watch in inner.commits.iter_mut() {
                if watch.provider == message.to
                    && info.deal_ids.contains(&watch.deal_id)
                    && watch.sector_number == Some(info.sector_number)
                {
                    debug!(deal_id = watch.deal_id, "pre-commit reverted");
                    watch.sector_number = None;
                }
            }
        }
    }
}

async fn check_deal_ends(api: &Arc<dyn ChainApi>, inner: &Arc<Mutex<Inner>>, tipset: &FullTipset) {
    let epoch = tipset.epoch();
    let key = match tipset.key() {
        Ok(key) => key,
        Err(_) => return,
    };

    // expiries resolve on epoch alone
    let pending: Vec<DealID> = {
        let mut inner = inner.lock();
        let mut i = 0;
        while i < inner.ends.len() {
            if epoch > inner.ends[i].end_epoch {
                let watch = inner.ends.swap_remove(i);
                let _ = watch.sender.send(Ok(DealEnd::Expired));
            } else {
                i += 1;
            }
        }
        inner.ends.iter().map(|w| w.deal_id).collect()
    };

    // slashes require a state read per deal, done outside the lock
    for deal_id in pending {
        let slash_epoch = match api.state_market_storage_deal(deal_id, &key).await {
            Ok(deal) => deal.state.slash_epoch,
            Err(e) => {
                debug!(deal_id, "deal state read failed: {e}");
                continue;
            }
        };
        if slash_epoch < 0 {
            continue;
        }
        let mut inner = inner.lock();
        let mut i = 0;
        while i < inner.ends.len() {
            if inner.ends[i].deal_id == deal_id {
                let watch = inner.ends.swap_remove(i);
                let _ = watch.sender.send(Ok(DealEnd::Slashed(slash_epoch)));
            } else {
                i += 1;
            }
        }
    }
}
