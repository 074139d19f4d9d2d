// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{tipset::verify_headers, BlockHeader, Error, Tipset, TipsetKey};
use crate::message::SignedMessage;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::message::Message;

/// A complete block: header plus the messages included in it, split between
/// BLS-signed messages (aggregated at the block level) and secp messages
/// carrying their own signatures.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub bls_messages: Vec<Message>,
    pub secp_messages: Vec<SignedMessage>,
}

impl Block {
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn bls_msgs(&self) -> &[Message] {
        &self.bls_messages
    }

    pub fn secp_msgs(&self) -> &[SignedMessage] {
        &self.secp_messages
    }
}

/// A tipset with the messages of every block in it. Used on the head change
/// feed so subscribers can inspect applied messages without extra store
/// reads.
#[derive(Clone, Debug, PartialEq)]
pub struct FullTipset {
    blocks: Vec<Block>,
}

impl FullTipset {
    pub fn new(blocks: Vec<Block>) -> Result<Self, Error> {
        let headers: Vec<BlockHeader> = blocks.iter().map(|b| b.header.clone()).collect();
        verify_headers(&headers)?;
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.blocks[0].header.epoch
    }

    /// Returns the tipset view of this full tipset, dropping the messages.
    pub fn tipset(&self) -> Result<Tipset, Error> {
        Tipset::new(self.blocks.iter().map(|b| b.header.clone()).collect())
    }

    pub fn key(&self) -> Result<TipsetKey, Error> {
        Ok(self.tipset()?.key().clone())
    }
}
