// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{BlockHeader, Error};
use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use serde::{Deserialize, Serialize};

/// A set of CIDs forming a unique key for a tipset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TipsetKey {
    pub cids: Vec<Cid>,
}

impl TipsetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self { cids }
    }

    /// Returns tipset header CIDs.
    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }
}

/// An immutable set of blocks at the same height with the same parent set.
/// Blocks in a tipset are canonically ordered by header CID.
#[derive(Clone, Debug, PartialEq)]
pub struct Tipset {
    headers: Vec<BlockHeader>,
    key: TipsetKey,
}

impl Tipset {
    /// Builds a new tipset from a collection of headers.
    /// A valid tipset contains a non-empty collection of blocks that have
    /// distinct miners and all specify identical epoch and parents.
    pub fn new(mut headers: Vec<BlockHeader>) -> Result<Self, Error> {
        verify_headers(&headers)?;
        let mut keyed: Vec<(Cid, BlockHeader)> = headers
            .drain(..)
            .map(|h| {
                let cid = h
                    .cid()
                    .map_err(|e| Error::InvalidTipset(e.to_string()))?;
                Ok((cid, h))
            })
            .collect::<Result<_, Error>>()?;
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let key = TipsetKey::new(keyed.iter().map(|(c, _)| *c).collect());
        Ok(Self {
            headers: keyed.into_iter().map(|(_, h)| h).collect(),
            key,
        })
    }

    /// Returns the epoch of the tipset.
    pub fn epoch(&self) -> ChainEpoch {
        self.headers[0].epoch
    }

    /// Returns all headers in the tipset.
    pub fn headers(&self) -> &[BlockHeader] {
        &self.headers
    }

    /// Returns the key of the tipset.
    pub fn key(&self) -> &TipsetKey {
        &self.key
    }
}

pub(super) fn verify_headers(headers: &[BlockHeader]) -> Result<(), Error> {
    let first = headers.first().ok_or(Error::NoBlocks)?;
    for header in &headers[1..] {
        if header.epoch != first.epoch {
            return Err(Error::InvalidTipset(
                "headers have different epochs".into(),
            ));
        }
        if header.parents != first.parents {
            return Err(Error::InvalidTipset(
                "headers have different parents".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cid::multihash::{Code, MultihashDigest};
    use fvm_ipld_encoding::DAG_CBOR;
    use fvm_shared::address::Address;
    use fvm_shared::bigint::BigInt;

    fn header(miner: u64, epoch: ChainEpoch) -> BlockHeader {
        let dummy = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"h"));
        BlockHeader {
            miner_address: Address::new_id(miner),
            epoch,
            parents: TipsetKey::default(),
            weight: BigInt::from(0u32),
            messages: dummy,
            state_root: dummy,
            timestamp: 0,
        }
    }

    #[test]
    fn empty_tipset_rejected() {
        assert_eq!(Tipset::new(vec![]).unwrap_err(), Error::NoBlocks);
    }

    #[test]
    fn mismatched_epochs_rejected() {
        let err = Tipset::new(vec![header(1, 1), header(2, 2)]).unwrap_err();
        assert!(matches!(err, Error::InvalidTipset(_)));
    }

    #[test]
    fn key_is_sorted_header_cids() {
        let ts = Tipset::new(vec![header(2, 5), header(1, 5)]).unwrap();
        let mut cids: Vec<Cid> = ts.headers().iter().map(|h| h.cid().unwrap()).collect();
        cids.sort();
        assert_eq!(ts.key().cids(), cids.as_slice());
        assert_eq!(ts.epoch(), 5);
    }
}
