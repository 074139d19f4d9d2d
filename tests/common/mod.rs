// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared fakes for the consumed interfaces: chain client, keystore,
//! piece I/O, data transfer, peer host and local storage.

#![allow(dead_code)]

use async_trait::async_trait;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::{to_vec, RawBytes, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::commcid::FIL_COMMITMENT_UNSEALED;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::message::Message;
use fvm_shared::piece::UnpaddedPieceSize;
use fvm_shared::receipt::Receipt;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber, SectorSize};
use grove::actor::market::{DealState, PublishStorageDealsReturn};
use grove::actor::miner::{
    MinerInfo, ProveCommitSectorParams, SectorPreCommitInfo, METHOD_PRE_COMMIT_SECTOR,
    METHOD_PROVE_COMMIT_SECTOR,
};
use grove::blocks::{Block, BlockHeader, FullTipset, HeadChange, HeadChangeType, TipsetKey};
use grove::key_management::Signer;
use grove::market::api::{ApiError, ChainApi, MarketDeal};
use grove::market::network::{PeerHost, PeerStream};
use grove::market::pieceio::{DataTransfer, PieceIo};
use grove::market::PeerInfo;
use grove::message::SignedMessage;
use grove::sector_storage::{FsStat, LocalStorage, StoreError};
use num_traits::Zero;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

pub fn dummy_cid(data: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(data))
}

/// The commitment the [`TestPieceIo`] fake computes for `data`.
pub fn test_commp(data: &[u8]) -> Cid {
    Cid::new_v1(FIL_COMMITMENT_UNSEALED, Code::Blake2b256.digest(data))
}

/// Deterministic fake signer: the signature is a digest of the address and
/// the payload, verification recomputes it.
pub struct TestSigner;

fn fake_signature(data: &[u8], address: &Address) -> Vec<u8> {
    let mut scope = address.to_bytes();
    scope.extend_from_slice(data);
    Code::Blake2b256.digest(&scope).digest().to_vec()
}

impl Signer for TestSigner {
    fn sign_bytes(&self, data: &[u8], address: &Address) -> anyhow::Result<Signature> {
        Ok(Signature::new_bls(fake_signature(data, address)))
    }

    fn verify_bytes(
        &self,
        data: &[u8],
        signature: &Signature,
        address: &Address,
    ) -> anyhow::Result<bool> {
        Ok(signature.bytes == fake_signature(data, address))
    }
}

/// Piece I/O fake hashing the raw bytes into a commitment-flavored CID.
pub struct TestPieceIo;

#[async_trait]
impl PieceIo for TestPieceIo {
    async fn generate_piece_commitment(
        &self,
        _proof: RegisteredSealProof,
        data: &[u8],
    ) -> anyhow::Result<(Cid, UnpaddedPieceSize)> {
        Ok((test_commp(data), UnpaddedPieceSize(data.len() as u64)))
    }

    async fn commitment_for_payload(
        &self,
        _proof: RegisteredSealProof,
        _payload: &Cid,
    ) -> anyhow::Result<(Cid, UnpaddedPieceSize)> {
        anyhow::bail!("payload commitments not supported by the test fake")
    }
}

/// Data transfer fake: every transfer starts successfully and completes out
/// of band.
pub struct TestTransfer;

#[async_trait]
impl DataTransfer for TestTransfer {
    async fn open_pull(&self, _peer: &PeerInfo, _root: &Cid) -> anyhow::Result<()> {
        Ok(())
    }

    async fn open_push(&self, _peer: &PeerInfo, _root: &Cid) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Peer host that refuses to dial; used for roles that only accept streams.
pub struct NullHost;

#[async_trait]
impl PeerHost for NullHost {
    async fn new_stream(
        &self,
        _peer: &PeerInfo,
        _protocol: &str,
    ) -> anyhow::Result<Box<dyn PeerStream>> {
        anyhow::bail!("outbound streams not available")
    }

    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: "test-host".into(),
            addresses: vec![],
        }
    }
}

/// Chain client fake with scriptable head, receipts and deal states.
pub struct TestApi {
    pub miner_owner: Address,
    pub miner_worker: Address,
    pub sector_size: SectorSize,
    head: Mutex<Arc<FullTipset>>,
    notify: broadcast::Sender<Vec<HeadChange>>,
    /// Returned by `market_ensure_available`; `None` means escrow covered.
    pub funding_message: Mutex<Option<Cid>>,
    pub receipts: Mutex<HashMap<Cid, Receipt>>,
    pub deal_states: Mutex<HashMap<DealID, MarketDeal>>,
    /// Deal ids assigned by the next PublishStorageDeals receipt.
    pub publish_ids: Mutex<Vec<DealID>>,
}

impl TestApi {
    pub fn new() -> Arc<Self> {
        let (notify, _) = broadcast::channel(64);
        Arc::new(TestApi {
            miner_owner: Address::new_id(100),
            miner_worker: Address::new_id(101),
            sector_size: SectorSize::_2KiB,
            head: Mutex::new(full_tipset(10, vec![])),
            notify,
            funding_message: Mutex::new(None),
            receipts: Mutex::new(HashMap::new()),
            deal_states: Mutex::new(HashMap::new()),
            publish_ids: Mutex::new(vec![42]),
        })
    }

    pub fn set_head(&self, tipset: Arc<FullTipset>) {
        *self.head.lock() = tipset;
    }

    /// Publishes an APPLY head change carrying `tipset`.
    pub fn apply(&self, tipset: Arc<FullTipset>) {
        self.set_head(tipset.clone());
        let _ = self.notify.send(vec![HeadChange {
            change: HeadChangeType::Apply,
            tipset,
        }]);
    }

    /// Publishes a REVERT head change carrying `tipset`.
    pub fn revert(&self, tipset: Arc<FullTipset>) {
        let _ = self.notify.send(vec![HeadChange {
            change: HeadChangeType::Revert,
            tipset,
        }]);
    }

    pub fn ok_receipt(return_data: RawBytes) -> Receipt {
        Receipt {
            exit_code: ExitCode::OK,
            return_data,
            gas_used: 0,
            events_root: None,
        }
    }
}

#[async_trait]
impl ChainApi for TestApi {
    async fn chain_head(&self) -> Result<Arc<FullTipset>, ApiError> {
        Ok(self.head.lock().clone())
    }

    fn chain_notify(&self) -> broadcast::Receiver<Vec<HeadChange>> {
        self.notify.subscribe()
    }

    async fn state_miner_info(
        &self,
        _miner: &Address,
        _tipset: &TipsetKey,
    ) -> Result<MinerInfo, ApiError> {
        Ok(MinerInfo {
            owner: self.miner_owner,
            worker: self.miner_worker,
            sector_size: self.sector_size,
        })
    }

    async fn state_account_key(
        &self,
        address: &Address,
        _tipset: &TipsetKey,
    ) -> Result<Address, ApiError> {
        Ok(*address)
    }

    async fn market_ensure_available(
        &self,
        _address: &Address,
        _worker: &Address,
        _amount: &TokenAmount,
        _tipset: &TipsetKey,
    ) -> Result<Option<Cid>, ApiError> {
        Ok(*self.funding_message.lock())
    }

    async fn mpool_push_message(&self, message: Message) -> Result<SignedMessage, ApiError> {
        let signed = SignedMessage::new_unchecked(
            message,
            Signature::new_bls(vec![0u8; 96]),
        );
        let cid = signed
            .cid()
            .map_err(|e| ApiError::Other(e.to_string()))?;
        let ids = self.publish_ids.lock().clone();
        let return_data = RawBytes::serialize(&PublishStorageDealsReturn { ids })
            .map_err(|e| ApiError::Other(e.to_string()))?;
        self.receipts
            .lock()
            .insert(cid, Self::ok_receipt(return_data));
        Ok(signed)
    }

    async fn mpool_push(&self, message: SignedMessage) -> Result<Cid, ApiError> {
        let cid = message
            .cid()
            .map_err(|e| ApiError::Other(e.to_string()))?;
        self.receipts
            .lock()
            .insert(cid, Self::ok_receipt(RawBytes::default()));
        Ok(cid)
    }

    async fn state_wait_msg(&self, cid: &Cid) -> Result<Receipt, ApiError> {
        Ok(self
            .receipts
            .lock()
            .get(cid)
            .cloned()
            .unwrap_or_else(|| Self::ok_receipt(RawBytes::default())))
    }

    async fn state_market_storage_deal(
        &self,
        deal_id: DealID,
        _tipset: &TipsetKey,
    ) -> Result<MarketDeal, ApiError> {
        self.deal_states
            .lock()
            .get(&deal_id)
            .cloned()
            .ok_or_else(|| ApiError::Other(format!("deal {deal_id} not found")))
    }
}

/// Builds a single-block tipset at `epoch` carrying the given BLS messages.
pub fn full_tipset(epoch: ChainEpoch, bls_messages: Vec<Message>) -> Arc<FullTipset> {
    let header = BlockHeader {
        miner_address: Address::new_id(1),
        epoch,
        parents: TipsetKey::default(),
        weight: Zero::zero(),
        messages: dummy_cid(b"messages"),
        state_root: dummy_cid(b"state"),
        timestamp: epoch as u64,
    };
    Arc::new(
        FullTipset::new(vec![Block {
            header,
            bls_messages,
            secp_messages: vec![],
        }])
        .expect("single block tipset"),
    )
}

fn commit_message(to: Address, method: u64, params: RawBytes) -> Message {
    Message {
        version: 0,
        from: Address::new_id(999),
        to,
        sequence: 0,
        value: TokenAmount::zero(),
        method_num: method,
        params,
        gas_limit: 0,
        gas_fee_cap: TokenAmount::zero(),
        gas_premium: TokenAmount::zero(),
    }
}

/// A `PreCommitSector` message binding `deal_ids` to `sector`.
pub fn pre_commit_message(provider: Address, deal_ids: Vec<DealID>, sector: SectorNumber) -> Message {
    let info = SectorPreCommitInfo {
        seal_proof: RegisteredSealProof::StackedDRG2KiBV1,
        sector_number: sector,
        sealed_cid: dummy_cid(b"commr"),
        seal_rand_epoch: 1,
        deal_ids,
        expiration: 10_000,
    };
    commit_message(
        provider,
        METHOD_PRE_COMMIT_SECTOR,
        RawBytes::serialize(&info).expect("encode pre-commit"),
    )
}

/// A `ProveCommitSector` message for `sector`.
pub fn prove_commit_message(provider: Address, sector: SectorNumber) -> Message {
    let params = ProveCommitSectorParams {
        sector_number: sector,
        proof: vec![1, 2, 3],
    };
    commit_message(
        provider,
        METHOD_PROVE_COMMIT_SECTOR,
        RawBytes::serialize(&params).expect("encode prove-commit"),
    )
}

/// An on-chain deal record for the [`TestApi`] deal state map.
pub fn market_deal(proposal: grove::actor::market::DealProposal) -> MarketDeal {
    MarketDeal {
        proposal,
        state: DealState {
            sector_start_epoch: 1,
            last_updated_epoch: -1,
            slash_epoch: -1,
        },
    }
}

/// Local storage fake reporting a fixed stat for every path.
pub struct TestLocalStorage {
    pub paths: Vec<PathBuf>,
    pub stat: FsStat,
}

impl TestLocalStorage {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        TestLocalStorage {
            paths,
            stat: FsStat {
                capacity: 1 << 30,
                available: 1 << 30,
                reserved: 0,
            },
        }
    }
}

impl LocalStorage for TestLocalStorage {
    fn get_stat(&self, _path: &Path) -> Result<FsStat, StoreError> {
        Ok(self.stat)
    }

    fn get_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        Ok(self.paths.clone())
    }
}

/// Writes a storage metadata file under `root`.
pub fn write_storage_meta(root: &Path, id: &str, weight: u64, can_seal: bool, can_store: bool) {
    std::fs::create_dir_all(root).expect("storage root");
    let meta = serde_json::json!({
        "id": id,
        "weight": weight,
        "can_seal": can_seal,
        "can_store": can_store,
    });
    std::fs::write(
        root.join(grove::sector_storage::META_FILE_NAME),
        serde_json::to_vec_pretty(&meta).expect("encode meta"),
    )
    .expect("write meta");
}

/// Peer host whose outbound streams are answered by an in-process
/// provider, one duplex pipe per stream.
pub struct ProviderHost {
    pub provider: Arc<grove::market::StorageProvider<grove::db::MemoryDB>>,
    pub peer: PeerInfo,
}

#[async_trait]
impl PeerHost for ProviderHost {
    async fn new_stream(
        &self,
        _peer: &PeerInfo,
        protocol: &str,
    ) -> anyhow::Result<Box<dyn PeerStream>> {
        use grove::market::network::{
            ASK_PROTOCOL_ID, DEAL_PROTOCOL_ID, DEAL_STATUS_PROTOCOL_ID,
        };
        let (client_end, server_end) = tokio::io::duplex(1 << 20);
        let provider = self.provider.clone();
        let protocol = protocol.to_string();
        tokio::spawn(async move {
            let stream: Box<dyn PeerStream> = Box::new(server_end);
            let result = match protocol.as_str() {
                ASK_PROTOCOL_ID => provider.handle_ask_stream(stream).await,
                DEAL_PROTOCOL_ID => provider
                    .handle_deal_stream(
                        stream,
                        PeerInfo {
                            peer_id: "client".into(),
                            addresses: vec![],
                        },
                    )
                    .await
                    .map(|_| ()),
                DEAL_STATUS_PROTOCOL_ID => provider.handle_status_stream(stream).await,
                other => Err(grove::market::Error::Other(format!(
                    "unknown protocol {other}"
                ))),
            };
            if let Err(e) = result {
                eprintln!("provider stream handler: {e}");
            }
        });
        Ok(Box::new(client_end))
    }

    fn peer_info(&self) -> PeerInfo {
        self.peer.clone()
    }
}

/// Signs `proposal` the way the [`TestSigner`] expects.
pub fn sign_proposal(
    proposal: grove::actor::market::DealProposal,
) -> grove::actor::market::ClientDealProposal {
    let bytes = to_vec(&proposal).expect("encode proposal");
    let signature = TestSigner
        .sign_bytes(&bytes, &proposal.client)
        .expect("sign proposal");
    grove::actor::market::ClientDealProposal {
        proposal,
        client_signature: signature,
    }
}
