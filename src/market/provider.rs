// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Provider side of the storage market: accepts proposal streams, validates
//! and funds deals, publishes them on chain, hands pieces off to sealing
//! and tracks sector commitment through the chain-event watcher.

use super::api::ChainApi;
use super::ask::SignedStorageAsk;
use super::error::Error;
use super::events::{DealEnd, Events, EventsError};
use super::fsm::{StateSet, Transition, TransitionTable};
use super::network::{
    read_frame_deadline, write_frame, AskRequest, AskResponse, DealStatusRequest,
    DealStatusResponse, PeerHost, PeerStream, Proposal, Response, SignedResponse,
    DEFAULT_READ_DEADLINE,
};
use super::pieceio::{DataTransfer, PieceIo};
use super::store::{DealStore, PROVIDER_DEAL_PREFIX};
use super::stored_ask::StoredAsk;
use super::types::{MinerDeal, PeerInfo, StorageDealStatus};
use crate::actor::market::{
    deal_proposal_cid, deal_duration_bounds, deal_provider_collateral_bounds,
    PublishStorageDealsParams, PublishStorageDealsReturn, METHOD_PUBLISH_STORAGE_DEALS,
};
use crate::actor::STORAGE_MARKET_ACTOR_ADDR;
use crate::db::Store;
use crate::key_management::Signer;
use crate::sector_storage::{FileTypes, LocalStore, SectorFileType, SectorId};
use cid::Cid;
use fvm_ipld_encoding::{to_vec, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::commcid::FIL_COMMITMENT_UNSEALED;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::message::Message;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber};
use num_traits::Zero;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// Proposals must start at least this many epochs after the current head.
pub const DEAL_ACCEPTANCE_BUFFER: ChainEpoch = 100;

const SECTOR_NONCE_KEY: &str = "/sectors/nonce";

/// Events driving the provider deal FSM.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Open,
    NodeErrored(String),
    ValidationFailed(String),
    DealRejected(String),
    RejectionSent,
    DealAccepted,
    WaitingForManualData,
    ManualDataReceived,
    DataTransferInitiated,
    DataTransferFailed(String),
    DataTransferCompleted,
    DataVerificationFailed(String),
    VerifiedData,
    FundingInitiated(Cid),
    Funded,
    DealPublishInitiated(Cid),
    DealPublishError(String),
    DealPublished(DealID),
    SendResponseFailed(String),
    DealHandoffFailed(String),
    DealHandedOff(DealID),
    DealActivationFailed(String),
    DealActivated,
    FileStoreErrored(String),
    DealSlashed(ChainEpoch),
    DealExpired,
    DealCompleted,
    Failed,
}

/// Payload-free view of [`ProviderEvent`] used to key the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderEventKind {
    Open,
    NodeErrored,
    ValidationFailed,
    DealRejected,
    RejectionSent,
    DealAccepted,
    WaitingForManualData,
    ManualDataReceived,
    DataTransferInitiated,
    DataTransferFailed,
    DataTransferCompleted,
    DataVerificationFailed,
    VerifiedData,
    FundingInitiated,
    Funded,
    DealPublishInitiated,
    DealPublishError,
    DealPublished,
    SendResponseFailed,
    DealHandoffFailed,
    DealHandedOff,
    DealActivationFailed,
    DealActivated,
    FileStoreErrored,
    DealSlashed,
    DealExpired,
    DealCompleted,
    Failed,
}

impl ProviderEvent {
    pub fn kind(&self) -> ProviderEventKind {
        use ProviderEvent::*;
        match self {
            Open => ProviderEventKind::Open,
            NodeErrored(_) => ProviderEventKind::NodeErrored,
            ValidationFailed(_) => ProviderEventKind::ValidationFailed,
            DealRejected(_) => ProviderEventKind::DealRejected,
            RejectionSent => ProviderEventKind::RejectionSent,
            DealAccepted => ProviderEventKind::DealAccepted,
            WaitingForManualData => ProviderEventKind::WaitingForManualData,
            ManualDataReceived => ProviderEventKind::ManualDataReceived,
            DataTransferInitiated => ProviderEventKind::DataTransferInitiated,
            DataTransferFailed(_) => ProviderEventKind::DataTransferFailed,
            DataTransferCompleted => ProviderEventKind::DataTransferCompleted,
            DataVerificationFailed(_) => ProviderEventKind::DataVerificationFailed,
            VerifiedData => ProviderEventKind::VerifiedData,
            FundingInitiated(_) => ProviderEventKind::FundingInitiated,
            Funded => ProviderEventKind::Funded,
            DealPublishInitiated(_) => ProviderEventKind::DealPublishInitiated,
            DealPublishError(_) => ProviderEventKind::DealPublishError,
            DealPublished(_) => ProviderEventKind::DealPublished,
            SendResponseFailed(_) => ProviderEventKind::SendResponseFailed,
            DealHandoffFailed(_) => ProviderEventKind::DealHandoffFailed,
            DealHandedOff(_) => ProviderEventKind::DealHandedOff,
            DealActivationFailed(_) => ProviderEventKind::DealActivationFailed,
            DealActivated => ProviderEventKind::DealActivated,
            FileStoreErrored(_) => ProviderEventKind::FileStoreErrored,
            DealSlashed(_) => ProviderEventKind::DealSlashed,
            DealExpired => ProviderEventKind::DealExpired,
            DealCompleted => ProviderEventKind::DealCompleted,
            Failed => ProviderEventKind::Failed,
        }
    }
}

fn provider_transitions() -> TransitionTable<ProviderEventKind, StorageDealStatus> {
    use ProviderEventKind as E;
    use StorageDealStatus as S;
    TransitionTable::new(vec![
        Transition::new(E::Open, StateSet::One(S::Unknown), S::Validating),
        Transition::new(E::NodeErrored, StateSet::Any, S::Failing),
        Transition::new(E::ValidationFailed, StateSet::One(S::Validating), S::Failing),
        Transition::new(E::DealRejected, StateSet::One(S::Validating), S::Rejecting),
        Transition::new(E::RejectionSent, StateSet::One(S::Rejecting), S::Rejected),
        Transition::new(E::DealAccepted, StateSet::One(S::Validating), S::ProposalAccepted),
        Transition::new(
            E::WaitingForManualData,
            StateSet::One(S::ProposalAccepted),
            S::WaitingForData,
        ),
        Transition::new(
            E::DataTransferFailed,
            StateSet::Many(&[S::ProposalAccepted, S::Transferring]),
            S::Failing,
        ),
        Transition::new(
            E::DataTransferInitiated,
            StateSet::One(S::ProposalAccepted),
            S::Transferring,
        ),
        Transition::new(
            E::DataTransferCompleted,
            StateSet::One(S::Transferring),
            S::VerifyData,
        ),
        Transition::new(
            E::ManualDataReceived,
            StateSet::One(S::WaitingForData),
            S::VerifyData,
        ),
        Transition::new(
            E::DataVerificationFailed,
            StateSet::Many(&[S::VerifyData, S::WaitingForData]),
            S::Failing,
        ),
        Transition::new(
            E::VerifiedData,
            StateSet::Many(&[S::VerifyData, S::WaitingForData]),
            S::EnsureProviderFunds,
        ),
        Transition::new(
            E::FundingInitiated,
            StateSet::One(S::EnsureProviderFunds),
            S::ProviderFunding,
        ),
        Transition::new(
            E::Funded,
            StateSet::Many(&[S::ProviderFunding, S::EnsureProviderFunds]),
            S::Publish,
        ),
        Transition::new(E::DealPublishInitiated, StateSet::One(S::Publish), S::Publishing),
        Transition::new(E::DealPublishError, StateSet::One(S::Publishing), S::Failing),
        Transition::new(
            E::SendResponseFailed,
            StateSet::Many(&[S::Publishing, S::Staged, S::Failing, S::Rejecting]),
            S::Error,
        ),
        Transition::new(E::DealPublished, StateSet::One(S::Publishing), S::Staged),
        Transition::new(
            E::FileStoreErrored,
            StateSet::Many(&[S::Staged, S::Sealing, S::Active]),
            S::Failing,
        ),
        Transition::new(E::DealHandoffFailed, StateSet::One(S::Staged), S::Failing),
        Transition::new(E::DealHandedOff, StateSet::One(S::Staged), S::Sealing),
        Transition::new(E::DealActivationFailed, StateSet::One(S::Sealing), S::Failing),
        Transition::new(E::DealActivated, StateSet::One(S::Sealing), S::Active),
        Transition::new(E::DealSlashed, StateSet::One(S::Active), S::Slashed),
        Transition::new(E::DealExpired, StateSet::One(S::Active), S::Expired),
        Transition::new(E::DealCompleted, StateSet::One(S::Active), S::Completed),
        Transition::new(E::Failed, StateSet::One(S::Failing), S::Error),
    ])
}

/// Provider construction parameters.
#[derive(Clone, Debug)]
pub struct StorageProviderConfig {
    pub registered_proof: RegisteredSealProof,
    /// The miner actor this provider fronts.
    pub actor: Address,
    /// Directory imported pieces are staged in until sector handoff.
    pub staging_dir: PathBuf,
    /// Deadline for reads on accepted streams.
    pub read_deadline: Duration,
}

impl StorageProviderConfig {
    pub fn new(registered_proof: RegisteredSealProof, actor: Address, staging_dir: PathBuf) -> Self {
        StorageProviderConfig {
            registered_proof,
            actor,
            staging_dir,
            read_deadline: DEFAULT_READ_DEADLINE,
        }
    }
}

/// The storage market provider.
pub struct StorageProvider<DB: Store> {
    inner: Arc<ProviderInner<DB>>,
}

struct ProviderInner<DB: Store> {
    config: StorageProviderConfig,
    api: Arc<dyn ChainApi>,
    signer: Arc<dyn Signer>,
    piece_io: Arc<dyn PieceIo>,
    transfer: Arc<dyn DataTransfer>,
    host: Arc<dyn PeerHost>,
    events: Arc<Events>,
    sectors: Arc<LocalStore>,
    stored_ask: StoredAsk<DB>,
    store: DealStore<DB, MinerDeal>,
    table: TransitionTable<ProviderEventKind, StorageDealStatus>,
    deals: RwLock<HashMap<Cid, Arc<Mutex<MinerDeal>>>>,
    connections: Mutex<HashMap<Cid, Box<dyn PeerStream>>>,
    sector_nonce: AtomicU64,
    stopped: AtomicBool,
}

impl<DB: Store> StorageProvider<DB> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StorageProviderConfig,
        api: Arc<dyn ChainApi>,
        signer: Arc<dyn Signer>,
        piece_io: Arc<dyn PieceIo>,
        transfer: Arc<dyn DataTransfer>,
        host: Arc<dyn PeerHost>,
        events: Arc<Events>,
        sectors: Arc<LocalStore>,
        db: DB,
    ) -> Result<Self, Error> {
        let stored_ask = StoredAsk::new(
            api.clone(),
            signer.clone(),
            db.clone(),
            config.actor,
            config.registered_proof,
        )?;
        let nonce = match db.read(SECTOR_NONCE_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| Error::Other("corrupt sector nonce record".into()))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        Ok(StorageProvider {
            inner: Arc::new(ProviderInner {
                config,
                api,
                signer,
                piece_io,
                transfer,
                host,
                events,
                sectors,
                stored_ask,
                store: DealStore::new(db, PROVIDER_DEAL_PREFIX),
                table: provider_transitions(),
                deals: RwLock::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                sector_nonce: AtomicU64::new(nonce),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Loads persisted deals, restarts chain waits for the ones that were
    /// parked on them, and starts the chain-event watcher.
    pub async fn start(&self) -> Result<(), Error> {
        self.inner.events.run();
        let deals = self.inner.store.list()?;
        for deal in deals {
            use crate::market::fsm::FsmState;
            if deal.state.is_terminal() {
                continue;
            }
            let proposal_cid = deal.proposal_cid;
            debug!(%proposal_cid, state = %deal.state, "resuming deal");
            let state = deal.state;
            let add_funds_cid = deal.add_funds_cid;
            let publish_cid = deal.publish_cid;
            let deal_id = deal.deal_id;
            self.inner
                .deals
                .write()
                .await
                .insert(proposal_cid, Arc::new(Mutex::new(deal)));
            match state {
                StorageDealStatus::ProviderFunding => {
                    if let Some(funding_cid) = add_funds_cid {
                        self.inner.spawn_funding_wait(proposal_cid, funding_cid);
                    }
                }
                StorageDealStatus::Publishing => {
                    if let Some(message_cid) = publish_cid {
                        self.inner.spawn_publish_wait(proposal_cid, message_cid);
                    }
                }
                StorageDealStatus::Sealing => {
                    if let Some(deal_id) = deal_id {
                        self.inner.spawn_commit_wait(proposal_cid, deal_id);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Marks the provider stopped and cancels every outstanding watcher
    /// future. Non-terminal deals stay persisted at their current state and
    /// resume on the next `start`.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.events.stop();
        self.inner.connections.lock().await.clear();
    }

    /// Mints and publishes a new signed ask.
    pub async fn add_ask(&self, price: TokenAmount, duration: ChainEpoch) -> Result<(), Error> {
        self.inner.stored_ask.add_ask(price, duration).await
    }

    /// Lists the asks advertised for `miner`; at most the current one.
    pub async fn list_asks(&self, miner: &Address) -> Result<Vec<SignedStorageAsk>, Error> {
        Ok(vec![self.inner.stored_ask.get_ask(miner).await?])
    }

    /// Local record of a deal.
    pub async fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, Error> {
        let deals = self.inner.deals.read().await;
        match deals.get(proposal_cid) {
            Some(handle) => Ok(handle.lock().await.clone()),
            None => Err(Error::LocalDealNotFound(*proposal_cid)),
        }
    }

    /// All local deals, terminal ones included.
    pub async fn list_local_deals(&self) -> Result<Vec<MinerDeal>, Error> {
        let deals = self.inner.deals.read().await;
        let mut out = Vec::with_capacity(deals.len());
        for handle in deals.values() {
            out.push(handle.lock().await.clone());
        }
        Ok(out)
    }

    /// Deals that have not reached a terminal state yet.
    pub async fn list_incomplete_deals(&self) -> Result<Vec<MinerDeal>, Error> {
        use crate::market::fsm::FsmState;
        Ok(self
            .list_local_deals()
            .await?
            .into_iter()
            .filter(|d| !d.state.is_terminal())
            .collect())
    }

    /// Supplies the piece bytes for a manual-transfer deal. The commitment
    /// is verified before any state changes; a mismatch fails the deal.
    pub async fn import_data_for_deal(
        &self,
        proposal_cid: &Cid,
        data: &[u8],
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let handle = {
            let deals = inner.deals.read().await;
            deals
                .get(proposal_cid)
                .cloned()
                .ok_or(Error::LocalDealNotFound(*proposal_cid))?
        };

        let (piece_cid, _) = inner
            .piece_io
            .generate_piece_commitment(inner.config.registered_proof, data)
            .await
            .map_err(|e| Error::Other(format!("piece commitment: {e}")))?;
        let expected = {
            let deal = handle.lock().await;
            deal.client_deal_proposal.proposal.piece_cid
        };
        if piece_cid != expected {
            let err = Error::PieceCidDoesNotMatch {
                expected,
                computed: piece_cid,
            };
            inner
                .process_event(
                    *proposal_cid,
                    ProviderEvent::DataVerificationFailed(err.to_string()),
                )
                .await;
            return Err(err);
        }

        std::fs::create_dir_all(&inner.config.staging_dir)
            .map_err(|e| Error::FileStore(e.to_string()))?;
        let staged = inner.config.staging_dir.join(format!("{proposal_cid}.piece"));
        std::fs::write(&staged, data).map_err(|e| Error::FileStore(e.to_string()))?;
        {
            let mut deal = handle.lock().await;
            deal.piece_path = staged;
        }

        inner
            .process_event(*proposal_cid, ProviderEvent::ManualDataReceived)
            .await;
        Ok(())
    }

    /// Handles an inbound deal proposal stream. Called by the peer host for
    /// streams negotiated to the deal protocol.
    pub async fn handle_deal_stream(
        &self,
        mut stream: Box<dyn PeerStream>,
        remote: PeerInfo,
    ) -> Result<Cid, Error> {
        let inner = &self.inner;
        debug!("new deal stream");
        let proposal: Proposal =
            read_frame_deadline(&mut stream, inner.config.read_deadline).await?;
        let proposal_cid = deal_proposal_cid(&proposal.deal_proposal)?;

        let deal = MinerDeal {
            client_deal_proposal: proposal.deal_proposal,
            proposal_cid,
            add_funds_cid: None,
            publish_cid: None,
            miner: inner.host.peer_info(),
            client: remote,
            state: StorageDealStatus::Unknown,
            piece_path: PathBuf::new(),
            metadata_path: PathBuf::new(),
            connection_closed: false,
            message: String::new(),
            data_ref: proposal.piece,
            deal_id: None,
            sector_number: None,
        };
        inner.store.save(&proposal_cid, &deal)?;
        inner
            .deals
            .write()
            .await
            .insert(proposal_cid, Arc::new(Mutex::new(deal)));
        inner
            .connections
            .lock()
            .await
            .insert(proposal_cid, stream);

        inner.process_event(proposal_cid, ProviderEvent::Open).await;
        Ok(proposal_cid)
    }

    /// Handles an inbound ask stream: one request, one response, close.
    pub async fn handle_ask_stream(&self, mut stream: Box<dyn PeerStream>) -> Result<(), Error> {
        let inner = &self.inner;
        debug!("new ask stream");
        let request: AskRequest =
            read_frame_deadline(&mut stream, inner.config.read_deadline).await?;
        let ask = inner.stored_ask.get_ask(&request.miner).await?;
        write_frame(&mut stream, &AskResponse { ask }).await?;
        debug!("ask response written");
        Ok(())
    }

    /// Handles an inbound deal status stream.
    pub async fn handle_status_stream(
        &self,
        mut stream: Box<dyn PeerStream>,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let request: DealStatusRequest =
            read_frame_deadline(&mut stream, inner.config.read_deadline).await?;

        let response = match self.get_deal(&request.proposal).await {
            Ok(deal) => {
                inner
                    .verify_status_signature(&request, &deal)
                    .await
                    .map_err(|e| {
                        warn!("bad deal status signature: {e}");
                        e
                    })?;
                DealStatusResponse {
                    state: deal.state,
                    message: deal.message,
                }
            }
            Err(e) => DealStatusResponse {
                state: StorageDealStatus::Unknown,
                message: e.to_string(),
            },
        };
        write_frame(&mut stream, &response).await
    }

    /// Reports completion of a pull transfer started for a graphsync deal.
    pub async fn on_data_transfer_complete(
        &self,
        proposal_cid: Cid,
        result: Result<(), String>,
    ) {
        let event = match result {
            Ok(()) => ProviderEvent::DataTransferCompleted,
            Err(e) => ProviderEvent::DataTransferFailed(e),
        };
        self.inner.process_event(proposal_cid, event).await;
    }

    /// Reports the end of a published deal's term, as observed through
    /// [`Events::on_deal_expired_or_slashed`].
    pub async fn on_deal_end(&self, proposal_cid: Cid, end: DealEnd) {
        let event = match end {
            DealEnd::Expired => ProviderEvent::DealExpired,
            DealEnd::Slashed(epoch) => ProviderEvent::DealSlashed(epoch),
        };
        self.inner.process_event(proposal_cid, event).await;
    }
}

impl<DB: Store> ProviderInner<DB> {
    /// Runs one event (plus everything it tail-posts) against a deal. The
    /// deal lock is held across the drain so transitions of a single deal
    /// are totally ordered.
    async fn process_event(self: &Arc<Self>, proposal_cid: Cid, event: ProviderEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let handle = { self.deals.read().await.get(&proposal_cid).cloned() };
        let Some(handle) = handle else {
            warn!(%proposal_cid, "event for unknown deal");
            return;
        };
        let mut deal = handle.lock().await;
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let from = deal.state;
            let to = match self.table.resolve(event.kind(), from) {
                Ok(to) => to,
                Err(e) => {
                    error!(%proposal_cid, "provider FSM: {e}");
                    continue;
                }
            };
            debug!(%proposal_cid, "provider FSM {:?}: {from} -> {to}", event.kind());
            let posted = self.on_event(&mut deal, event, to).await;
            deal.state = to;
            if let Err(e) = self.store.save(&proposal_cid, &deal) {
                error!(%proposal_cid, "persisting deal: {e}");
            }
            queue.extend(posted);
        }
    }

    async fn on_event(
        self: &Arc<Self>,
        deal: &mut MinerDeal,
        event: ProviderEvent,
        _to: StorageDealStatus,
    ) -> Vec<ProviderEvent> {
        match event {
            ProviderEvent::Open => match self.validate_proposal(deal).await {
                Ok(()) => vec![ProviderEvent::DealAccepted],
                Err(Error::ChainCall(e)) => vec![ProviderEvent::NodeErrored(e.to_string())],
                // only a proposal for the wrong miner is answered with an
                // explicit rejection; other invalid proposals fail the deal
                Err(e @ Error::WrongMiner { .. }) => {
                    vec![ProviderEvent::DealRejected(e.to_string())]
                }
                Err(e) => vec![ProviderEvent::ValidationFailed(e.to_string())],
            },
            ProviderEvent::DealAccepted => {
                if deal.data_ref.is_manual() {
                    return vec![ProviderEvent::WaitingForManualData];
                }
                let Some(root) = deal.data_ref.root else {
                    return vec![ProviderEvent::DataTransferFailed(
                        "graphsync transfer without a payload root".into(),
                    )];
                };
                match self.transfer.open_pull(&deal.client, &root).await {
                    Ok(()) => vec![ProviderEvent::DataTransferInitiated],
                    Err(e) => vec![ProviderEvent::DataTransferFailed(e.to_string())],
                }
            }
            ProviderEvent::WaitingForManualData => vec![],
            ProviderEvent::DataTransferInitiated => vec![],
            ProviderEvent::ManualDataReceived | ProviderEvent::DataTransferCompleted => {
                match self.verify_transferred_data(deal).await {
                    Ok(()) => vec![ProviderEvent::VerifiedData],
                    Err(e) => vec![ProviderEvent::DataVerificationFailed(e.to_string())],
                }
            }
            ProviderEvent::VerifiedData => match self.ensure_funds(deal).await {
                Ok(Some(funding_cid)) => {
                    deal.add_funds_cid = Some(funding_cid);
                    vec![ProviderEvent::FundingInitiated(funding_cid)]
                }
                Ok(None) => vec![ProviderEvent::Funded],
                Err(e) => vec![ProviderEvent::NodeErrored(
                    Error::AddFundsCallError(e.to_string()).to_string(),
                )],
            },
            ProviderEvent::FundingInitiated(funding_cid) => {
                self.spawn_funding_wait(deal.proposal_cid, funding_cid);
                vec![]
            }
            ProviderEvent::Funded => match self.publish_deal(deal).await {
                Ok(message_cid) => vec![ProviderEvent::DealPublishInitiated(message_cid)],
                Err(e) => vec![ProviderEvent::NodeErrored(e.to_string())],
            },
            ProviderEvent::DealPublishInitiated(message_cid) => {
                deal.publish_cid = Some(message_cid);
                self.spawn_publish_wait(deal.proposal_cid, message_cid);
                vec![]
            }
            ProviderEvent::DealPublished(deal_id) => {
                if let Err(e) = self
                    .send_response(deal, StorageDealStatus::ProposalAccepted, deal.publish_cid)
                    .await
                {
                    deal.message = e.to_string();
                    return vec![ProviderEvent::SendResponseFailed(e.to_string())];
                }
                match self.hand_off(deal).await {
                    Ok(sector_number) => {
                        deal.sector_number = Some(sector_number);
                        vec![ProviderEvent::DealHandedOff(deal_id)]
                    }
                    Err(e) => vec![ProviderEvent::DealHandoffFailed(e.to_string())],
                }
            }
            ProviderEvent::DealHandedOff(deal_id) => {
                deal.deal_id = Some(deal_id);
                self.spawn_commit_wait(deal.proposal_cid, deal_id);
                vec![]
            }
            ProviderEvent::DealActivated => vec![ProviderEvent::DealCompleted],
            ProviderEvent::DealCompleted => {
                debug!(proposal_cid = %deal.proposal_cid, "deal completed");
                self.close_connection(deal).await;
                vec![]
            }
            ProviderEvent::DealSlashed(epoch) => {
                deal.message = format!("deal slashed at epoch {epoch}");
                self.close_connection(deal).await;
                vec![]
            }
            ProviderEvent::DealExpired => {
                deal.message = "deal term expired".into();
                self.close_connection(deal).await;
                vec![]
            }
            ProviderEvent::DealRejected(reason) => {
                warn!(proposal_cid = %deal.proposal_cid, "rejecting deal: {reason}");
                deal.message = reason;
                match self
                    .send_response(deal, StorageDealStatus::Rejected, None)
                    .await
                {
                    Ok(()) => vec![ProviderEvent::RejectionSent],
                    Err(e) => vec![ProviderEvent::SendResponseFailed(e.to_string())],
                }
            }
            ProviderEvent::RejectionSent => {
                self.close_connection(deal).await;
                vec![]
            }
            ProviderEvent::NodeErrored(message)
            | ProviderEvent::ValidationFailed(message)
            | ProviderEvent::DataTransferFailed(message)
            | ProviderEvent::DataVerificationFailed(message)
            | ProviderEvent::DealPublishError(message)
            | ProviderEvent::DealHandoffFailed(message)
            | ProviderEvent::DealActivationFailed(message)
            | ProviderEvent::FileStoreErrored(message) => {
                error!(proposal_cid = %deal.proposal_cid, "deal failing: {message}");
                deal.message = message;
                self.cleanup_failed(deal).await
            }
            ProviderEvent::SendResponseFailed(message) => {
                warn!(proposal_cid = %deal.proposal_cid, "response write failed: {message}");
                self.close_connection(deal).await;
                vec![]
            }
            ProviderEvent::Failed => {
                self.close_connection(deal).await;
                vec![]
            }
        }
    }

    /// Waits for a funding message to land and posts the outcome.
    fn spawn_funding_wait(self: &Arc<Self>, proposal_cid: Cid, funding_cid: Cid) {
        let this = self.clone();
        tokio::spawn(async move {
            let event = match this.api.state_wait_msg(&funding_cid).await {
                Ok(receipt) if receipt.exit_code == ExitCode::OK => ProviderEvent::Funded,
                Ok(receipt) => ProviderEvent::NodeErrored(
                    Error::AddFundsCallError(format!(
                        "funding message exited with {:?}",
                        receipt.exit_code
                    ))
                    .to_string(),
                ),
                Err(e) => ProviderEvent::NodeErrored(
                    Error::AddFundsCallError(e.to_string()).to_string(),
                ),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    /// Waits for the publish message to land and posts the assigned deal id.
    fn spawn_publish_wait(self: &Arc<Self>, proposal_cid: Cid, message_cid: Cid) {
        let this = self.clone();
        tokio::spawn(async move {
            let event = match this.wait_for_publish(&message_cid).await {
                Ok(deal_id) => ProviderEvent::DealPublished(deal_id),
                Err(e) => ProviderEvent::DealPublishError(e.to_string()),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    /// Waits for the watcher to see the deal's sector prove-committed.
    fn spawn_commit_wait(self: &Arc<Self>, proposal_cid: Cid, deal_id: DealID) {
        let receiver = self
            .events
            .on_deal_sector_committed(self.config.actor, deal_id);
        let this = self.clone();
        tokio::spawn(async move {
            let event = match receiver.await {
                Ok(Ok(())) => ProviderEvent::DealActivated,
                // shutdown: leave the deal parked at sealing
                Ok(Err(EventsError::Stopped)) | Err(_) => return,
                Ok(Err(e)) => ProviderEvent::DealActivationFailed(e.to_string()),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    /// Cleanup run when a deal enters the failing state: tell the peer,
    /// release any sector files the deal already claimed, close the stream.
    async fn cleanup_failed(&self, deal: &mut MinerDeal) -> Vec<ProviderEvent> {
        let response_sent = self
            .send_response(deal, StorageDealStatus::Failing, None)
            .await;

        if let Some(sector) = deal.sector_number {
            if let Ok(miner) = self.config.actor.id() {
                let sector_id = SectorId { miner, sector };
                match self
                    .sectors
                    .remove(sector_id, FileTypes::from(SectorFileType::Unsealed))
                {
                    Ok(()) | Err(crate::sector_storage::StoreError::NotFoundSector) => {}
                    Err(e) => warn!("releasing sector files: {e}"),
                }
            }
        }
        if !deal.piece_path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&deal.piece_path);
        }
        self.close_connection(deal).await;

        match response_sent {
            Ok(()) => vec![ProviderEvent::Failed],
            Err(e) => vec![ProviderEvent::SendResponseFailed(e.to_string())],
        }
    }

    async fn validate_proposal(&self, deal: &MinerDeal) -> Result<(), Error> {
        let proposal = &deal.client_deal_proposal.proposal;
        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;

        let client_key = self
            .api
            .state_account_key(&proposal.client, &tipset_key)
            .await?;
        let proposal_bytes = to_vec(proposal)?;
        let valid = self
            .signer
            .verify_bytes(
                &proposal_bytes,
                &deal.client_deal_proposal.client_signature,
                &client_key,
            )
            .map_err(|e| Error::Signer(e.to_string()))?;
        if !valid {
            return Err(Error::InvalidSignature(
                "client signature does not cover the proposal".into(),
            ));
        }

        if proposal.provider != self.config.actor {
            return Err(Error::WrongMiner {
                proposed: proposal.provider,
                actual: self.config.actor,
            });
        }

        proposal
            .piece_size
            .validate()
            .map_err(|e| Error::InvalidProposal(format!("piece size: {e}")))?;
        if proposal.piece_cid.codec() != FIL_COMMITMENT_UNSEALED {
            return Err(Error::InvalidProposal(
                "piece CID is not a piece commitment".into(),
            ));
        }
        if deal.data_ref.is_manual() && deal.data_ref.piece_cid.is_none() {
            return Err(Error::PieceDataNotSetForManualTransfer);
        }

        let miner_info = self
            .api
            .state_miner_info(&self.config.actor, &tipset_key)
            .await?;
        if proposal.piece_size.0 > miner_info.sector_size as u64 {
            return Err(Error::PieceSizeGreaterSectorSize {
                piece: proposal.piece_size,
                sector: miner_info.sector_size,
            });
        }

        if proposal.start_epoch < head.epoch() + DEAL_ACCEPTANCE_BUFFER {
            return Err(Error::InvalidProposal(format!(
                "deal start epoch {} is before the acceptance buffer",
                proposal.start_epoch
            )));
        }
        let (min_duration, max_duration) = deal_duration_bounds(proposal.piece_size);
        if proposal.duration() < min_duration || proposal.duration() > max_duration {
            return Err(Error::InvalidProposal(format!(
                "deal duration {} out of bounds",
                proposal.duration()
            )));
        }
        let (min_collateral, _) =
            deal_provider_collateral_bounds(proposal.piece_size, proposal.duration());
        if proposal.provider_collateral < min_collateral {
            return Err(Error::InvalidProposal(
                "provider collateral below minimum".into(),
            ));
        }
        Ok(())
    }

    async fn verify_transferred_data(&self, deal: &MinerDeal) -> Result<(), Error> {
        let data = std::fs::read(&deal.piece_path).map_err(|e| Error::FileStore(e.to_string()))?;
        let (piece_cid, _) = self
            .piece_io
            .generate_piece_commitment(self.config.registered_proof, &data)
            .await
            .map_err(|e| Error::Other(format!("piece commitment: {e}")))?;
        let expected = deal.client_deal_proposal.proposal.piece_cid;
        if piece_cid != expected {
            return Err(Error::PieceCidDoesNotMatch {
                expected,
                computed: piece_cid,
            });
        }
        Ok(())
    }

    async fn ensure_funds(&self, deal: &MinerDeal) -> Result<Option<Cid>, Error> {
        let proposal = &deal.client_deal_proposal.proposal;
        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let miner_info = self
            .api
            .state_miner_info(&proposal.provider, &tipset_key)
            .await?;
        Ok(self
            .api
            .market_ensure_available(
                &proposal.provider,
                &miner_info.worker,
                proposal.provider_balance_requirement(),
                &tipset_key,
            )
            .await?)
    }

    async fn publish_deal(&self, deal: &MinerDeal) -> Result<Cid, Error> {
        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let miner_info = self
            .api
            .state_miner_info(&self.config.actor, &tipset_key)
            .await?;

        let params = PublishStorageDealsParams {
            deals: vec![deal.client_deal_proposal.clone()],
        };
        let message = Message {
            version: 0,
            from: miner_info.worker,
            to: STORAGE_MARKET_ACTOR_ADDR,
            sequence: 0,
            value: TokenAmount::zero(),
            method_num: METHOD_PUBLISH_STORAGE_DEALS,
            params: RawBytes::serialize(&params)?,
            gas_limit: 0,
            gas_fee_cap: TokenAmount::zero(),
            gas_premium: TokenAmount::zero(),
        };
        let signed = self.api.mpool_push_message(message).await?;
        Ok(signed.cid()?)
    }

    async fn wait_for_publish(&self, message_cid: &Cid) -> Result<DealID, Error> {
        let receipt = self.api.state_wait_msg(message_cid).await?;
        if receipt.exit_code != ExitCode::OK {
            return Err(Error::Other(format!(
                "PublishStorageDeals exited with {:?}",
                receipt.exit_code
            )));
        }
        let ret: PublishStorageDealsReturn = receipt
            .return_data
            .deserialize()
            .map_err(|e| Error::Decode(e.to_string()))?;
        ret.ids
            .first()
            .copied()
            .ok_or_else(|| Error::Decode("publish return carries no deal ids".into()))
    }

    /// Allocates sector file locations and moves the staged piece into the
    /// allocated unsealed path.
    async fn hand_off(&self, deal: &mut MinerDeal) -> Result<SectorNumber, Error> {
        let miner = self
            .config
            .actor
            .id()
            .map_err(|e| Error::Other(format!("provider address: {e}")))?;
        let sector = self.next_sector_number()?;
        let sector_id = SectorId { miner, sector };

        let acquired = self.sectors.acquire_sector(
            sector_id,
            self.config.registered_proof,
            FileTypes::empty(),
            FileTypes::from(SectorFileType::Unsealed),
            true,
        )?;
        let dest = acquired
            .paths
            .unsealed
            .ok_or(crate::sector_storage::StoreError::NotFoundPath)?;
        let storage_id = acquired
            .storages
            .unsealed
            .ok_or(crate::sector_storage::StoreError::NotFoundPath)?;

        move_file(&deal.piece_path, &dest).map_err(|e| Error::FileStore(e.to_string()))?;
        self.sectors
            .with_index_mut(|index| {
                index.storage_declare_sector(&storage_id, sector_id, SectorFileType::Unsealed)
            })?;
        deal.piece_path = dest;
        Ok(sector)
    }

    fn next_sector_number(&self) -> Result<SectorNumber, Error> {
        let sector = self.sector_nonce.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.db().write(SECTOR_NONCE_KEY, sector.to_be_bytes())?;
        Ok(sector)
    }

    async fn send_response(
        &self,
        deal: &MinerDeal,
        state: StorageDealStatus,
        publish_message: Option<Cid>,
    ) -> Result<(), Error> {
        let response = Response {
            state,
            message: deal.message.clone(),
            proposal: deal.proposal_cid,
            publish_message,
        };
        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let miner_info = self
            .api
            .state_miner_info(&self.config.actor, &tipset_key)
            .await?;
        let worker_key = self
            .api
            .state_account_key(&miner_info.worker, &tipset_key)
            .await?;
        let signature = self
            .signer
            .sign_bytes(&to_vec(&response)?, &worker_key)
            .map_err(|e| Error::Signer(e.to_string()))?;
        let signed = SignedResponse {
            response,
            signature,
        };

        let mut connections = self.connections.lock().await;
        let stream = connections
            .get_mut(&deal.proposal_cid)
            .ok_or(Error::NetworkStreamClosed)?;
        write_frame(stream, &signed).await
    }

    async fn close_connection(&self, deal: &mut MinerDeal) {
        if self
            .connections
            .lock()
            .await
            .remove(&deal.proposal_cid)
            .is_some()
        {
            deal.connection_closed = true;
        }
    }

    async fn verify_status_signature(
        &self,
        request: &DealStatusRequest,
        deal: &MinerDeal,
    ) -> Result<(), Error> {
        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let client_key = self
            .api
            .state_account_key(&deal.client_deal_proposal.proposal.client, &tipset_key)
            .await?;
        let valid = self
            .signer
            .verify_bytes(&request.proposal.to_bytes(), &request.signature, &client_key)
            .map_err(|e| Error::Signer(e.to_string()))?;
        if !valid {
            return Err(Error::InvalidSignature(
                "deal status request signature does not validate".into(),
            ));
        }
        Ok(())
    }
}

fn move_file(from: &std::path::Path, to: &std::path::Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        // staging and sector storage may live on different filesystems
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}
