// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::message_cid;
use crate::key_management::Signer;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{to_vec, DAG_CBOR};
use fvm_shared::crypto::signature::{Signature, SignatureType};
use fvm_shared::message::Message;

/// Represents a wrapped message with signature bytes.
#[derive(PartialEq, Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: Signature,
}

impl SignedMessage {
    /// Generate a new signed message by signing the canonical encoding of
    /// `message` with the key behind its `from` address.
    pub fn new<S: Signer>(message: Message, signer: &S) -> Result<Self, anyhow::Error> {
        let bytes = to_vec(&message)?;
        let signature = signer.sign_bytes(&bytes, &message.from)?;
        Ok(SignedMessage { message, signature })
    }

    /// Generate a signed message from fields without verifying the signature.
    pub fn new_unchecked(message: Message, signature: Signature) -> Self {
        SignedMessage { message, signature }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_bls(&self) -> bool {
        self.signature.signature_type() == SignatureType::BLS
    }

    /// Returns the content identifier of the message. BLS messages are keyed
    /// by the unsigned message since their signatures are aggregated at the
    /// block level.
    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        if self.is_bls() {
            message_cid(&self.message)
        } else {
            let bytes = to_vec(self)?;
            Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
        }
    }
}
