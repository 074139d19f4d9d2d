// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;

/// Signer is a trait which allows a key implementation to sign data for an
/// address, and to verify signatures produced by it.
///
/// The storage market never touches private keys directly; proposal and ask
/// signatures flow through this interface into the node's keystore.
pub trait Signer: Send + Sync {
    /// Signs arbitrary data with the key backing the given [`Address`].
    fn sign_bytes(&self, data: &[u8], address: &Address) -> Result<Signature, anyhow::Error>;

    /// Verifies that `signature` over `data` was produced by the key backing
    /// the given [`Address`].
    fn verify_bytes(
        &self,
        data: &[u8],
        signature: &Signature,
        address: &Address,
    ) -> Result<bool, anyhow::Error>;
}
