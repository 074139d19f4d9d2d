// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;

/// Smallest piece the provider accepts by default.
pub const DEFAULT_MIN_PIECE_SIZE: PaddedPieceSize = PaddedPieceSize(256);

/// Terms a provider advertises for incoming deals. Signed by the worker key
/// over the canonical encoding of this struct.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct StorageAsk {
    /// Price per epoch per GiB of data stored.
    pub price: TokenAmount,
    pub min_piece_size: PaddedPieceSize,
    pub max_piece_size: PaddedPieceSize,
    pub miner: Address,
    /// Epoch at which the ask was minted.
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    /// Increases by one every time the provider replaces its ask.
    pub seq_no: u64,
}

/// A [`StorageAsk`] with the worker signature over its canonical encoding.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedStorageAsk {
    pub ask: StorageAsk,
    pub signature: Signature,
}
