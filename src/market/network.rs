// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Framed request/response protocols of the storage market.
//!
//! Every message is the canonical CBOR encoding of one of the types below,
//! prefixed with its length as an unsigned varint. Streams are one-shot:
//! one request, one (or for the deal protocol a small sequence of)
//! response(s), then a graceful close. Any framing or decode error closes
//! the stream and fails the enclosing FSM transition.

use super::ask::SignedStorageAsk;
use super::error::Error;
use super::types::{DataRef, PeerInfo, StorageDealStatus};
use crate::actor::market::ClientDealProposal;
use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Libp2p protocol ID of the ask protocol.
pub const ASK_PROTOCOL_ID: &str = "/fil/storage/ask/1.0.1";
/// Libp2p protocol ID of the deal proposal protocol.
pub const DEAL_PROTOCOL_ID: &str = "/fil/storage/mk/1.0.1";
/// Libp2p protocol ID of the deal status protocol.
pub const DEAL_STATUS_PROTOCOL_ID: &str = "/fil/storage/status/1.0.1";

/// Upper bound on a single frame; larger frames are a decode error.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Default deadline applied to reads on accepted streams.
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct AskRequest {
    pub miner: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct AskResponse {
    pub ask: SignedStorageAsk,
}

/// Deal stream request: a signed proposal plus the transfer parameters.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Proposal {
    pub deal_proposal: ClientDealProposal,
    pub piece: DataRef,
}

/// Deal stream response, sent by the provider once the proposal outcome is
/// known.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Response {
    pub state: StorageDealStatus,
    /// Failure or rejection reason, empty on acceptance.
    pub message: String,
    pub proposal: Cid,
    /// CID of the PublishStorageDeals message, set on acceptance.
    pub publish_message: Option<Cid>,
}

/// A [`Response`] signed by the provider worker key over the canonical
/// encoding of the response.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedResponse {
    pub response: Response,
    pub signature: Signature,
}

/// Deal status request, signed by the client that proposed the deal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealStatusRequest {
    pub proposal: Cid,
    /// Client signature over the proposal CID bytes.
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealStatusResponse {
    pub state: StorageDealStatus,
    pub message: String,
}

/// An authenticated, multiplexed stream to a remote peer. The peer host
/// owns dialing, negotiation and identity; the market only reads and
/// writes frames.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// The peer host consumed by the storage market. Inbound streams are routed
/// by the host to the provider's `handle_*_stream` methods.
#[async_trait]
pub trait PeerHost: Send + Sync {
    /// Opens an outbound stream to `peer`, negotiated to `protocol`.
    async fn new_stream(
        &self,
        peer: &PeerInfo,
        protocol: &str,
    ) -> anyhow::Result<Box<dyn PeerStream>>;

    /// This host's own identity, as shared with counterparties.
    fn peer_info(&self) -> PeerInfo;
}

/// Writes one varint-length-prefixed CBOR frame.
pub async fn write_frame<T, W>(stream: &mut W, message: &T) -> Result<(), Error>
where
    T: Serialize,
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Decode(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut prefix = [0u8; 10];
    let mut len = payload.len() as u64;
    let mut i = 0;
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            prefix[i] = byte;
            i += 1;
            break;
        }
        prefix[i] = byte | 0x80;
        i += 1;
    }
    stream
        .write_all(&prefix[..i])
        .await
        .map_err(stream_io_err)?;
    stream.write_all(&payload).await.map_err(stream_io_err)?;
    stream.flush().await.map_err(stream_io_err)?;
    Ok(())
}

/// Reads one varint-length-prefixed CBOR frame.
pub async fn read_frame<T, R>(stream: &mut R) -> Result<T, Error>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = stream.read_u8().await.map_err(stream_io_err)?;
        len |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::Decode("varint length prefix too long".into()));
        }
    }
    if len as usize > MAX_FRAME_SIZE {
        return Err(Error::Decode(format!("frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(stream_io_err)?;
    Ok(from_slice(&payload)?)
}

/// [`read_frame`] with a deadline; expiry fails the enclosing event.
pub async fn read_frame_deadline<T, R>(stream: &mut R, deadline: Duration) -> Result<T, Error>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    timeout(deadline, read_frame(stream))
        .await
        .map_err(|_| Error::NetworkTimeout)?
}

fn stream_io_err(_: io::Error) -> Error {
    Error::NetworkStreamClosed
}
