// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod signed_message;

pub use signed_message::SignedMessage;

use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::{to_vec, DAG_CBOR};
use fvm_shared::message::Message;

/// Returns the content identifier of the canonical encoding of an unsigned
/// message.
pub fn message_cid(msg: &Message) -> Result<Cid, fvm_ipld_encoding::Error> {
    let bytes = to_vec(msg)?;
    Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
}
