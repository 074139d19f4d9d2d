// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::api::ApiError;
use super::events::EventsError;
use super::fsm::FsmError;
use crate::sector_storage::StoreError;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorSize;
use thiserror::Error;

/// Storage market error. The display strings double as the deal `message`
/// reported to peers and operators, so each carries a stable leading token.
#[derive(Debug, Error)]
pub enum Error {
    #[error("InvalidSignature: {0}")]
    InvalidSignature(String),
    #[error("WRONG_MINER: proposal is for provider {proposed}, this miner is {actual}")]
    WrongMiner { proposed: Address, actual: Address },
    #[error("PieceSizeGreaterSectorSize: piece of {piece:?} bytes does not fit sector of {sector:?} bytes")]
    PieceSizeGreaterSectorSize {
        piece: PaddedPieceSize,
        sector: SectorSize,
    },
    #[error("PieceDataNotSetForManualTransfer")]
    PieceDataNotSetForManualTransfer,
    #[error("PieceCidDoesNotMatch: proposal commits to {expected}, data hashes to {computed}")]
    PieceCidDoesNotMatch { expected: Cid, computed: Cid },
    #[error("AddFundsCallError: {0}")]
    AddFundsCallError(String),
    #[error("LocalDealNotFound: {0}")]
    LocalDealNotFound(Cid),
    #[error("AskNotFound: no signed ask for {0}")]
    AskNotFound(Address),
    #[error("InvalidProposal: {0}")]
    InvalidProposal(String),
    #[error("NetworkStreamClosed")]
    NetworkStreamClosed,
    #[error("NetworkTimeout: read deadline expired")]
    NetworkTimeout,
    #[error("DecodeError: {0}")]
    Decode(String),
    #[error("ChainCallFailed: {0}")]
    ChainCall(#[from] ApiError),
    #[error("SignerError: {0}")]
    Signer(String),
    #[error("FileStoreError: {0}")]
    FileStore(String),
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Events(#[from] EventsError),
    #[error("DatastoreError: {0}")]
    Datastore(#[from] crate::db::Error),
    #[error("{0}")]
    Other(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
