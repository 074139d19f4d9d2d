// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::TipsetKey;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{to_vec, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::clock::ChainEpoch;

/// Block header of the underlying chain. Only the fields the deal
/// coordination core consumes are carried; the embedding node maps its full
/// header onto this view when publishing head changes.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct BlockHeader {
    /// The address of the miner actor that mined this block.
    pub miner_address: Address,
    /// The period in which a new block is generated.
    pub epoch: ChainEpoch,
    /// The set of parents this block was based on.
    pub parents: TipsetKey,
    /// The aggregate chain weight of the parent set.
    #[serde(with = "bigint_ser")]
    pub weight: BigInt,
    /// The CID of the root of the message collection.
    pub messages: Cid,
    /// The CID of the parent state root after calculating parent tipset.
    pub state_root: Cid,
    /// The block creation time, in seconds since the Unix epoch.
    pub timestamp: u64,
}

impl BlockHeader {
    /// Returns the content identifier of the canonical encoding of the
    /// header.
    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        let bytes = to_vec(self)?;
        Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
    }
}
