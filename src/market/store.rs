// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::error::Error;
use crate::db::Store;
use cid::Cid;
use fvm_ipld_encoding::{from_slice, to_vec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

pub const PROVIDER_DEAL_PREFIX: &str = "/deals/provider/";
pub const CLIENT_DEAL_PREFIX: &str = "/deals/client/";

/// Persists deal records in the block datastore, keyed by proposal CID
/// under a role-specific prefix. Every FSM mutation is written through so
/// non-terminal deals survive restarts at their current state.
pub struct DealStore<DB, D> {
    db: DB,
    prefix: &'static str,
    _record: PhantomData<D>,
}

impl<DB, D> DealStore<DB, D>
where
    DB: Store,
    D: Serialize + DeserializeOwned,
{
    pub fn new(db: DB, prefix: &'static str) -> Self {
        DealStore {
            db,
            prefix,
            _record: PhantomData,
        }
    }

    /// The backing datastore.
    pub fn db(&self) -> &DB {
        &self.db
    }

    fn key(&self, proposal_cid: &Cid) -> String {
        format!("{}{}", self.prefix, proposal_cid)
    }

    pub fn save(&self, proposal_cid: &Cid, deal: &D) -> Result<(), Error> {
        let bytes = to_vec(deal)?;
        self.db.write(self.key(proposal_cid), bytes)?;
        Ok(())
    }

    pub fn get(&self, proposal_cid: &Cid) -> Result<Option<D>, Error> {
        match self.db.read(self.key(proposal_cid))? {
            Some(bytes) => Ok(Some(from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<D>, Error> {
        self.db
            .values_with_prefix(self.prefix)?
            .iter()
            .map(|bytes| Ok(from_slice(bytes)?))
            .collect()
    }

    pub fn delete(&self, proposal_cid: &Cid) -> Result<(), Error> {
        self.db.delete(self.key(proposal_cid))?;
        Ok(())
    }
}
