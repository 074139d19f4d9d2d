// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{to_vec, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::MethodNum;
use num_traits::Zero;

use super::EPOCHS_IN_YEAR;

/// Market actor method called to publish a set of signed deal proposals.
pub const METHOD_PUBLISH_STORAGE_DEALS: MethodNum = 4;

/// Note: Deal Collateral is only released and returned to clients and miners
/// when the storage deal stops counting towards power. In the current
/// iteration, it will be released when the sector containing the storage
/// deals expires, even though some storage deals can expire earlier than the
/// sector does.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,

    // Nominal start epoch. Deal payment is linear between start_epoch and
    // end_epoch, with total amount storage_price_per_epoch * duration.
    // The deal must appear in a sealed (proven) sector no later than
    // start_epoch, otherwise it is invalid.
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,

    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl DealProposal {
    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_fee(&self) -> TokenAmount {
        TokenAmount::from_atto(self.storage_price_per_epoch.atto() * self.duration())
    }

    pub fn client_balance_requirement(&self) -> TokenAmount {
        self.client_collateral.clone() + self.total_storage_fee()
    }

    pub fn provider_balance_requirement(&self) -> &TokenAmount {
        &self.provider_collateral
    }
}

/// ClientDealProposal is a DealProposal signed by the client. The signature
/// scope is exactly the canonical encoding of the proposal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

/// Returns the content identifier of the canonical encoding of a signed deal
/// proposal. This CID is the stable primary key of a deal on both sides of
/// the market.
pub fn deal_proposal_cid(proposal: &ClientDealProposal) -> Result<Cid, fvm_ipld_encoding::Error> {
    let bytes = to_vec(proposal)?;
    Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
}

/// On-chain state of a published deal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DealState {
    /// -1 if not yet included in proven sector
    pub sector_start_epoch: ChainEpoch,
    /// -1 if deal state never updated
    pub last_updated_epoch: ChainEpoch,
    /// -1 if deal never slashed
    pub slash_epoch: ChainEpoch,
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PublishStorageDealsParams {
    pub deals: Vec<ClientDealProposal>,
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PublishStorageDealsReturn {
    pub ids: Vec<DealID>,
}

const TOTAL_FILECOIN: i64 = 2_000_000_000;

pub fn deal_duration_bounds(_size: PaddedPieceSize) -> (ChainEpoch, ChainEpoch) {
    (0, EPOCHS_IN_YEAR) // PARAM_FINISH
}

pub fn deal_provider_collateral_bounds(
    _piece_size: PaddedPieceSize,
    _duration: ChainEpoch,
) -> (TokenAmount, TokenAmount) {
    (TokenAmount::zero(), TokenAmount::from_whole(TOTAL_FILECOIN)) // PARAM_FINISH
}

pub fn deal_client_collateral_bounds(
    _piece_size: PaddedPieceSize,
    _duration: ChainEpoch,
) -> (TokenAmount, TokenAmount) {
    (TokenAmount::zero(), TokenAmount::from_whole(TOTAL_FILECOIN)) // PARAM_FINISH
}
