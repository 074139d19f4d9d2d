// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::ask::SignedStorageAsk;
use super::fsm::FsmState;
use crate::actor::market::ClientDealProposal;
use cid::Cid;
use fvm_ipld_encoding::repr::*;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;
use fvm_shared::piece::UnpaddedPieceSize;
use fvm_shared::sector::{SectorNumber, SectorSize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a deal. Clients and providers share the state space;
/// a few states are only ever entered by one of the roles.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr,
)]
#[repr(u64)]
pub enum StorageDealStatus {
    Unknown = 0,
    ProposalAccepted,
    Validating,
    AcceptWait,
    StartDataTransfer,
    Transferring,
    WaitingForData,
    VerifyData,
    EnsureProviderFunds,
    ProviderFunding,
    ClientFunding,
    EnsureClientFunds,
    FundsEnsured,
    CheckForAcceptance,
    Publish,
    Publishing,
    Staged,
    Sealing,
    Finalizing,
    Active,
    Expired,
    Completed,
    Failing,
    Error,
    Slashed,
    Rejecting,
    Rejected,
}

impl FsmState for StorageDealStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            StorageDealStatus::Completed
                | StorageDealStatus::Error
                | StorageDealStatus::Expired
                | StorageDealStatus::Slashed
                | StorageDealStatus::Rejected
        )
    }
}

impl fmt::Display for StorageDealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Transfer mode where the client delivers the piece out of band and the
/// provider imports it through `import_data_for_deal`.
pub const TRANSFER_TYPE_MANUAL: &str = "manual";
/// Transfer mode where the provider pulls the payload over graphsync.
pub const TRANSFER_TYPE_GRAPHSYNC: &str = "graphsync";

/// How the provider obtains the deal bytes.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DataRef {
    pub transfer_type: String,
    /// Payload root, set for graphsync transfers.
    pub root: Option<Cid>,
    /// Piece commitment, required for manual transfers.
    pub piece_cid: Option<Cid>,
    pub piece_size: Option<UnpaddedPieceSize>,
}

impl DataRef {
    pub fn manual(piece_cid: Cid, piece_size: UnpaddedPieceSize) -> Self {
        DataRef {
            transfer_type: TRANSFER_TYPE_MANUAL.to_string(),
            root: None,
            piece_cid: Some(piece_cid),
            piece_size: Some(piece_size),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.transfer_type == TRANSFER_TYPE_MANUAL
    }
}

/// Identity and dialing information of a peer on the storage market
/// network. The peer host owns the actual libp2p types; this is the view
/// the market carries in deal records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub addresses: Vec<String>,
}

/// A provider's advertised identity, as discovered by clients.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageProviderInfo {
    pub address: Address,
    pub owner: Address,
    pub worker: Address,
    pub sector_size: SectorSize,
    pub peer_info: PeerInfo,
}

/// The provider-side record of an in-flight deal, kept from the moment a
/// proposal stream is accepted until the deal reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct MinerDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub add_funds_cid: Option<Cid>,
    pub publish_cid: Option<Cid>,
    /// This provider's own peer identity, as shared with the client.
    pub miner: PeerInfo,
    pub client: PeerInfo,
    pub state: StorageDealStatus,
    pub piece_path: PathBuf,
    pub metadata_path: PathBuf,
    pub connection_closed: bool,
    /// Last human-readable status, kept when the deal fails.
    pub message: String,
    pub data_ref: DataRef,
    pub deal_id: Option<DealID>,
    /// Local sector the piece was handed off into.
    pub sector_number: Option<SectorNumber>,
}

/// The client-side record of an in-flight deal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub state: StorageDealStatus,
    pub miner: PeerInfo,
    pub miner_worker: Address,
    pub deal_id: Option<DealID>,
    pub data_ref: DataRef,
    pub message: String,
    /// CID of the PublishStorageDeals message, reported by the provider.
    pub publish_message: Option<Cid>,
    pub add_funds_cid: Option<Cid>,
    /// The signed ask the client accepted when proposing.
    pub ask: Option<SignedStorageAsk>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::market::DealProposal;
    use cid::multihash::{Code, MultihashDigest};
    use fvm_ipld_encoding::{from_slice, to_vec, DAG_CBOR};
    use fvm_shared::crypto::signature::Signature;
    use fvm_shared::econ::TokenAmount;
    use fvm_shared::piece::PaddedPieceSize;
    use num_traits::Zero;

    #[test]
    fn terminal_states() {
        use StorageDealStatus::*;
        for state in [Completed, Error, Expired, Slashed, Rejected] {
            assert!(state.is_terminal());
        }
        for state in [Unknown, Validating, Sealing, Active, Failing, Rejecting] {
            assert!(!state.is_terminal());
        }
    }

    fn test_deal_proposal() -> ClientDealProposal {
        ClientDealProposal {
            proposal: DealProposal {
                piece_cid: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"piece")),
                piece_size: PaddedPieceSize(2048),
                verified_deal: false,
                client: fvm_shared::address::Address::new_id(100),
                provider: fvm_shared::address::Address::new_id(1000),
                start_epoch: 100,
                end_epoch: 200,
                storage_price_per_epoch: TokenAmount::from_atto(1),
                provider_collateral: TokenAmount::zero(),
                client_collateral: TokenAmount::zero(),
            },
            client_signature: Signature::new_bls(vec![1, 2, 3]),
        }
    }

    #[test]
    fn miner_deal_record_round_trips() {
        let deal = MinerDeal {
            client_deal_proposal: test_deal_proposal(),
            proposal_cid: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"proposal")),
            add_funds_cid: None,
            publish_cid: Some(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"publish"))),
            miner: PeerInfo {
                peer_id: "miner".into(),
                addresses: vec!["/dns4/miner".into()],
            },
            client: PeerInfo::default(),
            state: StorageDealStatus::Sealing,
            piece_path: PathBuf::from("/staging/piece"),
            metadata_path: PathBuf::new(),
            connection_closed: false,
            message: String::new(),
            data_ref: DataRef::manual(
                Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"commp")),
                fvm_shared::piece::UnpaddedPieceSize(2032),
            ),
            deal_id: Some(42),
            sector_number: Some(1),
        };
        let decoded: MinerDeal = from_slice(&to_vec(&deal).unwrap()).unwrap();
        assert_eq!(deal, decoded);
    }

    #[test]
    fn client_deal_record_round_trips() {
        let deal = ClientDeal {
            client_deal_proposal: test_deal_proposal(),
            proposal_cid: Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"proposal")),
            state: StorageDealStatus::CheckForAcceptance,
            miner: PeerInfo::default(),
            miner_worker: fvm_shared::address::Address::new_id(101),
            deal_id: None,
            data_ref: DataRef::manual(
                Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"commp")),
                fvm_shared::piece::UnpaddedPieceSize(2032),
            ),
            message: "waiting".into(),
            publish_message: None,
            add_funds_cid: None,
            ask: None,
        };
        let decoded: ClientDeal = from_slice(&to_vec(&deal).unwrap()).unwrap();
        assert_eq!(deal, decoded);
    }
}
