// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Client side of the storage market: negotiates asks, funds and proposes
//! deals, drives the payload transfer and follows the deal through publish,
//! sealing and activation on chain.

use super::api::ChainApi;
use super::ask::SignedStorageAsk;
use super::error::Error;
use super::events::{DealEnd, Events, EventsError};
use super::fsm::{StateSet, Transition, TransitionTable};
use super::network::{
    read_frame_deadline, write_frame, AskRequest, AskResponse, DealStatusRequest,
    DealStatusResponse, PeerHost, PeerStream, Proposal, SignedResponse, ASK_PROTOCOL_ID,
    DEAL_PROTOCOL_ID, DEAL_STATUS_PROTOCOL_ID, DEFAULT_READ_DEADLINE,
};
use super::pieceio::{DataTransfer, PieceIo};
use super::store::{DealStore, CLIENT_DEAL_PREFIX};
use super::types::{ClientDeal, DataRef, StorageDealStatus, StorageProviderInfo};
use crate::actor::market::{deal_proposal_cid, ClientDealProposal, DealProposal};
use crate::db::Store;
use crate::key_management::Signer;
use cid::Cid;
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::RegisteredSealProof;
use num_traits::Zero;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// Deal states a provider response may legitimately report on acceptance.
const ACCEPTED_STATES: [StorageDealStatus; 4] = [
    StorageDealStatus::ProposalAccepted,
    StorageDealStatus::Staged,
    StorageDealStatus::Sealing,
    StorageDealStatus::Active,
];

/// Events driving the client deal FSM.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Open,
    FundingInitiated(Cid),
    FundsEnsured,
    FundingFailed(String),
    DealProposed,
    WriteProposalFailed(String),
    DataTransferInitiated,
    DataTransferFailed(String),
    DataTransferComplete,
    ReadResponseFailed(String),
    DealRejected(String),
    DealAccepted { publish_message: Option<Cid> },
    DealPublishFailed(String),
    DealPublished(DealID),
    DealActivationFailed(String),
    DealActivated,
    DealCompleted,
    DealSlashed(ChainEpoch),
    DealExpired,
    NodeErrored(String),
    Failed,
}

/// Payload-free view of [`ClientEvent`] used to key the transition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientEventKind {
    Open,
    FundingInitiated,
    FundsEnsured,
    FundingFailed,
    DealProposed,
    WriteProposalFailed,
    DataTransferInitiated,
    DataTransferFailed,
    DataTransferComplete,
    ReadResponseFailed,
    DealRejected,
    DealAccepted,
    DealPublishFailed,
    DealPublished,
    DealActivationFailed,
    DealActivated,
    DealCompleted,
    DealSlashed,
    DealExpired,
    NodeErrored,
    Failed,
}

impl ClientEvent {
    pub fn kind(&self) -> ClientEventKind {
        use ClientEvent::*;
        match self {
            Open => ClientEventKind::Open,
            FundingInitiated(_) => ClientEventKind::FundingInitiated,
            FundsEnsured => ClientEventKind::FundsEnsured,
            FundingFailed(_) => ClientEventKind::FundingFailed,
            DealProposed => ClientEventKind::DealProposed,
            WriteProposalFailed(_) => ClientEventKind::WriteProposalFailed,
            DataTransferInitiated => ClientEventKind::DataTransferInitiated,
            DataTransferFailed(_) => ClientEventKind::DataTransferFailed,
            DataTransferComplete => ClientEventKind::DataTransferComplete,
            ReadResponseFailed(_) => ClientEventKind::ReadResponseFailed,
            DealRejected(_) => ClientEventKind::DealRejected,
            DealAccepted { .. } => ClientEventKind::DealAccepted,
            DealPublishFailed(_) => ClientEventKind::DealPublishFailed,
            DealPublished(_) => ClientEventKind::DealPublished,
            DealActivationFailed(_) => ClientEventKind::DealActivationFailed,
            DealActivated => ClientEventKind::DealActivated,
            DealCompleted => ClientEventKind::DealCompleted,
            DealSlashed(_) => ClientEventKind::DealSlashed,
            DealExpired => ClientEventKind::DealExpired,
            NodeErrored(_) => ClientEventKind::NodeErrored,
            Failed => ClientEventKind::Failed,
        }
    }
}

fn client_transitions() -> TransitionTable<ClientEventKind, StorageDealStatus> {
    use ClientEventKind as E;
    use StorageDealStatus as S;
    TransitionTable::new(vec![
        Transition::new(E::Open, StateSet::One(S::Unknown), S::EnsureClientFunds),
        Transition::new(E::NodeErrored, StateSet::Any, S::Failing),
        Transition::new(
            E::FundingInitiated,
            StateSet::One(S::EnsureClientFunds),
            S::ClientFunding,
        ),
        Transition::new(
            E::FundsEnsured,
            StateSet::Many(&[S::EnsureClientFunds, S::ClientFunding]),
            S::FundsEnsured,
        ),
        Transition::new(
            E::FundingFailed,
            StateSet::Many(&[S::EnsureClientFunds, S::ClientFunding]),
            S::Failing,
        ),
        Transition::new(E::DealProposed, StateSet::One(S::FundsEnsured), S::StartDataTransfer),
        Transition::new(
            E::WriteProposalFailed,
            StateSet::One(S::FundsEnsured),
            S::Failing,
        ),
        Transition::new(
            E::DataTransferInitiated,
            StateSet::One(S::StartDataTransfer),
            S::Transferring,
        ),
        Transition::new(
            E::DataTransferFailed,
            StateSet::Many(&[S::StartDataTransfer, S::Transferring]),
            S::Failing,
        ),
        Transition::new(
            E::DataTransferComplete,
            StateSet::Many(&[S::StartDataTransfer, S::Transferring]),
            S::CheckForAcceptance,
        ),
        Transition::new(
            E::ReadResponseFailed,
            StateSet::One(S::CheckForAcceptance),
            S::Failing,
        ),
        Transition::new(
            E::DealRejected,
            StateSet::One(S::CheckForAcceptance),
            S::Failing,
        ),
        Transition::new(
            E::DealAccepted,
            StateSet::One(S::CheckForAcceptance),
            S::ProposalAccepted,
        ),
        Transition::new(
            E::DealPublishFailed,
            StateSet::One(S::ProposalAccepted),
            S::Failing,
        ),
        Transition::new(E::DealPublished, StateSet::One(S::ProposalAccepted), S::Sealing),
        Transition::new(E::DealActivationFailed, StateSet::One(S::Sealing), S::Failing),
        Transition::new(E::DealActivated, StateSet::One(S::Sealing), S::Active),
        Transition::new(E::DealSlashed, StateSet::One(S::Active), S::Slashed),
        Transition::new(E::DealExpired, StateSet::One(S::Active), S::Expired),
        Transition::new(E::DealCompleted, StateSet::One(S::Active), S::Completed),
        Transition::new(E::Failed, StateSet::One(S::Failing), S::Error),
    ])
}

/// Client construction parameters.
#[derive(Clone, Debug)]
pub struct StorageClientConfig {
    pub read_deadline: Duration,
}

impl Default for StorageClientConfig {
    fn default() -> Self {
        StorageClientConfig {
            read_deadline: DEFAULT_READ_DEADLINE,
        }
    }
}

/// The storage market client.
pub struct StorageClient<DB: Store> {
    inner: Arc<ClientInner<DB>>,
}

struct ClientInner<DB: Store> {
    config: StorageClientConfig,
    api: Arc<dyn ChainApi>,
    signer: Arc<dyn Signer>,
    piece_io: Arc<dyn PieceIo>,
    transfer: Arc<dyn DataTransfer>,
    host: Arc<dyn PeerHost>,
    events: Arc<Events>,
    store: DealStore<DB, ClientDeal>,
    table: TransitionTable<ClientEventKind, StorageDealStatus>,
    deals: RwLock<HashMap<Cid, Arc<Mutex<ClientDeal>>>>,
    connections: Mutex<HashMap<Cid, Box<dyn PeerStream>>>,
    asks: Mutex<HashMap<Address, SignedStorageAsk>>,
    stopped: AtomicBool,
}

impl<DB: Store> StorageClient<DB> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StorageClientConfig,
        api: Arc<dyn ChainApi>,
        signer: Arc<dyn Signer>,
        piece_io: Arc<dyn PieceIo>,
        transfer: Arc<dyn DataTransfer>,
        host: Arc<dyn PeerHost>,
        events: Arc<Events>,
        db: DB,
    ) -> Self {
        StorageClient {
            inner: Arc::new(ClientInner {
                config,
                api,
                signer,
                piece_io,
                transfer,
                host,
                events,
                store: DealStore::new(db, CLIENT_DEAL_PREFIX),
                table: client_transitions(),
                deals: RwLock::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                asks: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Loads persisted deals, restarts chain waits for the ones parked on
    /// them and starts the chain-event watcher.
    pub async fn run(&self) -> Result<(), Error> {
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
            let deal_id = deal.deal_id;
            let provider = deal.client_deal_proposal.proposal.provider;
            self.inner
                .deals
                .write()
                .await
                .insert(proposal_cid, Arc::new(Mutex::new(deal)));
            match state {
                StorageDealStatus::ClientFunding => {
                    if let Some(funding_cid) = add_funds_cid {
                        self.inner.spawn_funding_wait(proposal_cid, funding_cid);
                    }
                }
                StorageDealStatus::Sealing => {
                    if let Some(deal_id) = deal_id {
                        self.inner.spawn_commit_wait(proposal_cid, provider, deal_id);
                    }
                }
                // deals parked on a network read cannot reattach to the
                // stream; the operator reconciles through query_deal_status
                _ => {}
            }
        }
        Ok(())
    }

    /// Marks the client stopped and cancels outstanding watcher futures.
    /// Non-terminal deals stay persisted at their current state.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.events.stop();
        self.inner.connections.lock().await.clear();
    }

    /// Fetches and validates the provider's current signed ask.
    pub async fn get_ask(
        &self,
        provider: &StorageProviderInfo,
    ) -> Result<SignedStorageAsk, Error> {
        let inner = &self.inner;
        let mut stream = inner
            .host
            .new_stream(&provider.peer_info, ASK_PROTOCOL_ID)
            .await
            .map_err(|_| Error::NetworkStreamClosed)?;
        write_frame(&mut stream, &AskRequest { miner: provider.address }).await?;
        let response: AskResponse =
            read_frame_deadline(&mut stream, inner.config.read_deadline).await?;

        inner.validate_ask_response(&response.ask, provider).await?;
        inner
            .asks
            .lock()
            .await
            .insert(provider.address, response.ask.clone());
        Ok(response.ask)
    }

    /// Proposes a storage deal. The proposal is signed with `address`'s key,
    /// funds are ensured, the proposal is sent to the provider and the deal
    /// is driven to a terminal state asynchronously. Returns the proposal
    /// CID identifying the new deal.
    #[allow(clippy::too_many_arguments)]
    pub async fn propose_storage_deal(
        &self,
        address: Address,
        provider: &StorageProviderInfo,
        data_ref: DataRef,
        start_epoch: ChainEpoch,
        end_epoch: ChainEpoch,
        price: TokenAmount,
        collateral: TokenAmount,
        registered_proof: RegisteredSealProof,
    ) -> Result<Cid, Error> {
        let inner = &self.inner;

        let (piece_cid, piece_size) = match (data_ref.piece_cid, data_ref.piece_size) {
            (Some(piece_cid), Some(piece_size)) => (piece_cid, piece_size),
            _ if data_ref.is_manual() => return Err(Error::PieceDataNotSetForManualTransfer),
            _ => {
                let root = data_ref.root.ok_or_else(|| {
                    Error::InvalidProposal("data ref carries neither piece nor root".into())
                })?;
                inner
                    .piece_io
                    .commitment_for_payload(registered_proof, &root)
                    .await
                    .map_err(|e| Error::Other(format!("piece commitment: {e}")))?
            }
        };

        let head = inner.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let client_key = inner.api.state_account_key(&address, &tipset_key).await?;

        let proposal = DealProposal {
            piece_cid,
            piece_size: piece_size.padded(),
            verified_deal: false,
            client: address,
            provider: provider.address,
            start_epoch,
            end_epoch,
            storage_price_per_epoch: price,
            provider_collateral: collateral,
            client_collateral: TokenAmount::zero(),
        };
        let signature = inner
            .signer
            .sign_bytes(&to_vec(&proposal)?, &client_key)
            .map_err(|e| Error::Signer(e.to_string()))?;
        let client_deal_proposal = ClientDealProposal {
            proposal,
            client_signature: signature,
        };
        let proposal_cid = deal_proposal_cid(&client_deal_proposal)?;

        let ask = inner.asks.lock().await.get(&provider.address).cloned();
        let deal = ClientDeal {
            client_deal_proposal,
            proposal_cid,
            state: StorageDealStatus::Unknown,
            miner: provider.peer_info.clone(),
            miner_worker: provider.worker,
            deal_id: None,
            data_ref,
            message: String::new(),
            publish_message: None,
            add_funds_cid: None,
            ask,
        };
        inner.store.save(&proposal_cid, &deal)?;
        inner
            .deals
            .write()
            .await
            .insert(proposal_cid, Arc::new(Mutex::new(deal)));

        inner.process_event(proposal_cid, ClientEvent::Open).await;
        Ok(proposal_cid)
    }

    /// Local record of a deal.
    pub async fn get_local_deal(&self, proposal_cid: &Cid) -> Result<ClientDeal, Error> {
        let deals = self.inner.deals.read().await;
        match deals.get(proposal_cid) {
            Some(handle) => Ok(handle.lock().await.clone()),
            None => Err(Error::LocalDealNotFound(*proposal_cid)),
        }
    }

    /// All local deals, terminal ones included.
    pub async fn list_local_deals(&self) -> Result<Vec<ClientDeal>, Error> {
        let deals = self.inner.deals.read().await;
        let mut out = Vec::with_capacity(deals.len());
        for handle in deals.values() {
            out.push(handle.lock().await.clone());
        }
        Ok(out)
    }

    /// Asks the provider for the authoritative state of a deal.
    pub async fn query_deal_status(
        &self,
        proposal_cid: &Cid,
    ) -> Result<DealStatusResponse, Error> {
        let inner = &self.inner;
        let deal = self.get_local_deal(proposal_cid).await?;

        let head = inner.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let client_key = inner
            .api
            .state_account_key(&deal.client_deal_proposal.proposal.client, &tipset_key)
            .await?;
        let signature = inner
            .signer
            .sign_bytes(&proposal_cid.to_bytes(), &client_key)
            .map_err(|e| Error::Signer(e.to_string()))?;

        let mut stream = inner
            .host
            .new_stream(&deal.miner, DEAL_STATUS_PROTOCOL_ID)
            .await
            .map_err(|_| Error::NetworkStreamClosed)?;
        write_frame(
            &mut stream,
            &DealStatusRequest {
                proposal: *proposal_cid,
                signature,
            },
        )
        .await?;
        read_frame_deadline(&mut stream, inner.config.read_deadline).await
    }

    /// Reports completion of a push transfer started for a graphsync deal.
    pub async fn on_data_transfer_complete(
        &self,
        proposal_cid: Cid,
        result: Result<(), String>,
    ) {
        let event = match result {
            Ok(()) => ClientEvent::DataTransferComplete,
            Err(e) => ClientEvent::DataTransferFailed(e),
        };
        self.inner.process_event(proposal_cid, event).await;
    }

    /// Reports the end of a published deal's term, as observed through
    /// [`Events::on_deal_expired_or_slashed`].
    pub async fn on_deal_end(&self, proposal_cid: Cid, end: DealEnd) {
        let event = match end {
            DealEnd::Expired => ClientEvent::DealExpired,
            DealEnd::Slashed(epoch) => ClientEvent::DealSlashed(epoch),
        };
        self.inner.process_event(proposal_cid, event).await;
    }
}

impl<DB: Store> ClientInner<DB> {
    async fn process_event(self: &Arc<Self>, proposal_cid: Cid, event: ClientEvent) {
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
                    error!(%proposal_cid, "client FSM: {e}");
                    continue;
                }
            };
            debug!(%proposal_cid, "client FSM {:?}: {from} -> {to}", event.kind());
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
        deal: &mut ClientDeal,
        event: ClientEvent,
        _to: StorageDealStatus,
    ) -> Vec<ClientEvent> {
        match event {
            ClientEvent::Open => match self.ensure_funds(deal).await {
                Ok(Some(funding_cid)) => {
                    deal.add_funds_cid = Some(funding_cid);
                    vec![ClientEvent::FundingInitiated(funding_cid)]
                }
                Ok(None) => vec![ClientEvent::FundsEnsured],
                Err(e) => vec![ClientEvent::NodeErrored(
                    Error::AddFundsCallError(e.to_string()).to_string(),
                )],
            },
            ClientEvent::FundingInitiated(funding_cid) => {
                self.spawn_funding_wait(deal.proposal_cid, funding_cid);
                vec![]
            }
            ClientEvent::FundsEnsured => match self.send_proposal(deal).await {
                Ok(()) => vec![ClientEvent::DealProposed],
                Err(e) => vec![ClientEvent::WriteProposalFailed(e.to_string())],
            },
            ClientEvent::DealProposed => {
                if deal.data_ref.is_manual() {
                    // payload moves out of band; the provider waits for an
                    // import on its side
                    return vec![ClientEvent::DataTransferComplete];
                }
                let Some(root) = deal.data_ref.root else {
                    return vec![ClientEvent::DataTransferFailed(
                        "graphsync transfer without a payload root".into(),
                    )];
                };
                match self.transfer.open_push(&deal.miner, &root).await {
                    Ok(()) => vec![ClientEvent::DataTransferInitiated],
                    Err(e) => vec![ClientEvent::DataTransferFailed(e.to_string())],
                }
            }
            ClientEvent::DataTransferInitiated => vec![],
            ClientEvent::DataTransferComplete => {
                self.spawn_response_read(deal.proposal_cid);
                vec![]
            }
            ClientEvent::DealAccepted { publish_message } => {
                deal.publish_message = publish_message;
                match publish_message {
                    Some(message_cid) => {
                        self.spawn_publish_wait(deal.proposal_cid, message_cid);
                        vec![]
                    }
                    None => vec![ClientEvent::DealPublishFailed(
                        "provider acceptance carries no publish message".into(),
                    )],
                }
            }
            ClientEvent::DealPublished(deal_id) => {
                deal.deal_id = Some(deal_id);
                let provider = deal.client_deal_proposal.proposal.provider;
                self.spawn_commit_wait(deal.proposal_cid, provider, deal_id);
                vec![]
            }
            ClientEvent::DealActivated => {
                self.spawn_activation_check(deal.proposal_cid, deal.deal_id);
                vec![]
            }
            ClientEvent::DealCompleted => {
                debug!(proposal_cid = %deal.proposal_cid, "deal completed");
                self.close_connection(&deal.proposal_cid).await;
                vec![]
            }
            ClientEvent::DealSlashed(epoch) => {
                deal.message = format!("deal slashed at epoch {epoch}");
                self.close_connection(&deal.proposal_cid).await;
                vec![]
            }
            ClientEvent::DealExpired => {
                deal.message = "deal term expired".into();
                self.close_connection(&deal.proposal_cid).await;
                vec![]
            }
            ClientEvent::DealRejected(message)
            | ClientEvent::FundingFailed(message)
            | ClientEvent::WriteProposalFailed(message)
            | ClientEvent::DataTransferFailed(message)
            | ClientEvent::ReadResponseFailed(message)
            | ClientEvent::DealPublishFailed(message)
            | ClientEvent::DealActivationFailed(message)
            | ClientEvent::NodeErrored(message) => {
                error!(proposal_cid = %deal.proposal_cid, "deal failing: {message}");
                deal.message = message;
                self.close_connection(&deal.proposal_cid).await;
                vec![ClientEvent::Failed]
            }
            ClientEvent::Failed => vec![],
        }
    }

    async fn ensure_funds(&self, deal: &ClientDeal) -> Result<Option<Cid>, Error> {
        let proposal = &deal.client_deal_proposal.proposal;
        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        Ok(self
            .api
            .market_ensure_available(
                &proposal.client,
                &proposal.client,
                &proposal.client_balance_requirement(),
                &tipset_key,
            )
            .await?)
    }

    /// Opens the deal stream and writes the signed proposal.
    async fn send_proposal(&self, deal: &ClientDeal) -> Result<(), Error> {
        let mut stream = self
            .host
            .new_stream(&deal.miner, DEAL_PROTOCOL_ID)
            .await
            .map_err(|_| Error::NetworkStreamClosed)?;
        let proposal = Proposal {
            deal_proposal: deal.client_deal_proposal.clone(),
            piece: deal.data_ref.clone(),
        };
        write_frame(&mut stream, &proposal).await?;
        self.connections
            .lock()
            .await
            .insert(deal.proposal_cid, stream);
        Ok(())
    }

    fn spawn_funding_wait(self: &Arc<Self>, proposal_cid: Cid, funding_cid: Cid) {
        let this = self.clone();
        tokio::spawn(async move {
            let event = match this.api.state_wait_msg(&funding_cid).await {
                Ok(receipt) if receipt.exit_code == ExitCode::OK => ClientEvent::FundsEnsured,
                Ok(receipt) => ClientEvent::FundingFailed(
                    Error::AddFundsCallError(format!(
                        "funding message exited with {:?}",
                        receipt.exit_code
                    ))
                    .to_string(),
                ),
                Err(e) => ClientEvent::FundingFailed(
                    Error::AddFundsCallError(e.to_string()).to_string(),
                ),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    /// Reads and validates the provider's signed response.
    fn spawn_response_read(self: &Arc<Self>, proposal_cid: Cid) {
        let this = self.clone();
        tokio::spawn(async move {
            let event = match this.read_response(&proposal_cid).await {
                Ok(response) => {
                    if ACCEPTED_STATES.contains(&response.response.state) {
                        ClientEvent::DealAccepted {
                            publish_message: response.response.publish_message,
                        }
                    } else {
                        ClientEvent::DealRejected(format!(
                            "deal not accepted: state {}, message: {}",
                            response.response.state, response.response.message
                        ))
                    }
                }
                Err(e) => ClientEvent::ReadResponseFailed(e.to_string()),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    async fn read_response(&self, proposal_cid: &Cid) -> Result<SignedResponse, Error> {
        let mut connections = self.connections.lock().await;
        let stream = connections
            .get_mut(proposal_cid)
            .ok_or(Error::NetworkStreamClosed)?;
        let response: SignedResponse =
            read_frame_deadline(stream, self.config.read_deadline).await?;
        drop(connections);

        if response.response.proposal != *proposal_cid {
            return Err(Error::InvalidProposal(
                "response references a different proposal".into(),
            ));
        }
        let deal = {
            let deals = self.deals.read().await;
            let handle = deals
                .get(proposal_cid)
                .ok_or(Error::LocalDealNotFound(*proposal_cid))?;
            handle.try_lock().map(|d| d.clone()).ok()
        };
        // the deal lock is held by the FSM while this read runs in the
        // background; fall back to the persisted record
        let deal = match deal {
            Some(deal) => deal,
            None => self
                .store
                .get(proposal_cid)?
                .ok_or(Error::LocalDealNotFound(*proposal_cid))?,
        };

        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let worker_key = self
            .api
            .state_account_key(&deal.miner_worker, &tipset_key)
            .await?;
        let valid = self
            .signer
            .verify_bytes(
                &to_vec(&response.response)?,
                &response.signature,
                &worker_key,
            )
            .map_err(|e| Error::Signer(e.to_string()))?;
        if !valid {
            return Err(Error::InvalidSignature(
                "provider response signature does not validate".into(),
            ));
        }
        Ok(response)
    }

    fn spawn_publish_wait(self: &Arc<Self>, proposal_cid: Cid, message_cid: Cid) {
        let this = self.clone();
        tokio::spawn(async move {
            let event = match this.wait_for_publish(&message_cid).await {
                Ok(deal_id) => ClientEvent::DealPublished(deal_id),
                Err(e) => ClientEvent::DealPublishFailed(e.to_string()),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    async fn wait_for_publish(&self, message_cid: &Cid) -> Result<DealID, Error> {
        let receipt = self.api.state_wait_msg(message_cid).await?;
        if receipt.exit_code != ExitCode::OK {
            return Err(Error::Other(format!(
                "PublishStorageDeals exited with {:?}",
                receipt.exit_code
            )));
        }
        let ret: crate::actor::market::PublishStorageDealsReturn = receipt
            .return_data
            .deserialize()
            .map_err(|e| Error::Decode(e.to_string()))?;
        ret.ids
            .first()
            .copied()
            .ok_or_else(|| Error::Decode("publish return carries no deal ids".into()))
    }

    fn spawn_commit_wait(self: &Arc<Self>, proposal_cid: Cid, provider: Address, deal_id: DealID) {
        let receiver = self.events.on_deal_sector_committed(provider, deal_id);
        let this = self.clone();
        tokio::spawn(async move {
            let event = match receiver.await {
                Ok(Ok(())) => ClientEvent::DealActivated,
                // shutdown: leave the deal parked at sealing
                Ok(Err(EventsError::Stopped)) | Err(_) => return,
                Ok(Err(e)) => ClientEvent::DealActivationFailed(e.to_string()),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    /// Confirms the published deal on chain before declaring it complete.
    fn spawn_activation_check(self: &Arc<Self>, proposal_cid: Cid, deal_id: Option<DealID>) {
        let this = self.clone();
        tokio::spawn(async move {
            let Some(deal_id) = deal_id else {
                this.process_event(
                    proposal_cid,
                    ClientEvent::NodeErrored("activated deal has no deal id".into()),
                )
                .await;
                return;
            };
            let event = match this.check_activation(deal_id).await {
                Ok(Some(slash_epoch)) => ClientEvent::DealSlashed(slash_epoch),
                Ok(None) => ClientEvent::DealCompleted,
                Err(e) => ClientEvent::NodeErrored(e.to_string()),
            };
            this.process_event(proposal_cid, event).await;
        });
    }

    async fn check_activation(&self, deal_id: DealID) -> Result<Option<ChainEpoch>, Error> {
        let head = self.api.chain_head().await?;
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let on_chain = self
            .api
            .state_market_storage_deal(deal_id, &tipset_key)
            .await?;
        if on_chain.state.slash_epoch >= 0 {
            return Ok(Some(on_chain.state.slash_epoch));
        }
        Ok(None)
    }

    async fn validate_ask_response(
        &self,
        signed: &SignedStorageAsk,
        provider: &StorageProviderInfo,
    ) -> Result<(), Error> {
        if signed.ask.miner != provider.address {
            return Err(Error::InvalidProposal(
                "ask is for a different miner".into(),
            ));
        }
        let head = self.api.chain_head().await?;
        if signed.ask.expiry <= head.epoch() {
            return Err(Error::InvalidProposal("ask has expired".into()));
        }
        let tipset_key = head
            .key()
            .map_err(|e| Error::Other(format!("invalid chain head: {e}")))?;
        let worker_key = self
            .api
            .state_account_key(&provider.worker, &tipset_key)
            .await?;
        let valid = self
            .signer
            .verify_bytes(&to_vec(&signed.ask)?, &signed.signature, &worker_key)
            .map_err(|e| Error::Signer(e.to_string()))?;
        if !valid {
            return Err(Error::InvalidSignature(
                "ask signature does not validate".into(),
            ));
        }
        Ok(())
    }

    async fn close_connection(&self, proposal_cid: &Cid) {
        self.connections.lock().await.remove(proposal_cid);
    }
}
