// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::types::PeerInfo;
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::piece::UnpaddedPieceSize;
use fvm_shared::sector::RegisteredSealProof;

/// Piece commitment computation, consumed from the proofs subsystem.
#[async_trait]
pub trait PieceIo: Send + Sync {
    /// Computes `CommP` and the unpadded piece size of `data` under the
    /// given registered proof.
    async fn generate_piece_commitment(
        &self,
        proof: RegisteredSealProof,
        data: &[u8],
    ) -> anyhow::Result<(Cid, UnpaddedPieceSize)>;

    /// Computes `CommP` for a payload already present in the local
    /// blockstore, addressed by its root.
    async fn commitment_for_payload(
        &self,
        proof: RegisteredSealProof,
        payload: &Cid,
    ) -> anyhow::Result<(Cid, UnpaddedPieceSize)>;
}

/// Data transfer manager, consumed from the transfer subsystem. Completion
/// is reported back to the deal FSMs by the embedding node through
/// `on_data_transfer_complete`.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Start pulling the payload rooted at `root` from `peer`.
    async fn open_pull(&self, peer: &PeerInfo, root: &Cid) -> anyhow::Result<()>;

    /// Start pushing the payload rooted at `root` to `peer`.
    async fn open_push(&self, peer: &PeerInfo, root: &Cid) -> anyhow::Result<()>;
}
