// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber, SectorSize};
use fvm_shared::MethodNum;

/// Miner actor method carrying a [`SectorPreCommitInfo`].
pub const METHOD_PRE_COMMIT_SECTOR: MethodNum = 6;
/// Miner actor method carrying a [`ProveCommitSectorParams`].
pub const METHOD_PROVE_COMMIT_SECTOR: MethodNum = 7;

/// Information stored on-chain for a pre-committed sector. The deal ids
/// listed here bind published deals to the sector that will seal them.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SectorPreCommitInfo {
    pub seal_proof: RegisteredSealProof,
    pub sector_number: SectorNumber,
    /// CommR of the committed sector.
    pub sealed_cid: Cid,
    pub seal_rand_epoch: ChainEpoch,
    pub deal_ids: Vec<DealID>,
    pub expiration: ChainEpoch,
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ProveCommitSectorParams {
    pub sector_number: SectorNumber,
    #[serde(with = "fvm_ipld_encoding::strict_bytes")]
    pub proof: Vec<u8>,
}

/// Static information about a miner actor, as read from chain state.
#[derive(Clone, Debug, PartialEq)]
pub struct MinerInfo {
    /// Account that owns this miner.
    pub owner: Address,
    /// Worker account for this miner, used to sign messages and on-chain
    /// artifacts on the miner's behalf.
    pub worker: Address,
    pub sector_size: SectorSize,
}
