// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Method numbers and parameter types of the built-in actors the deal
//! coordination core encodes messages for, or decodes chain messages from.

pub mod market;
pub mod miner;

use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;

/// Address of the storage market singleton actor.
pub const STORAGE_MARKET_ACTOR_ADDR: Address = Address::new_id(5);

const EPOCH_DURATION_SECONDS: i64 = 30;
const SECONDS_IN_YEAR: i64 = 31_556_925;

/// Number of chain epochs in a year, at the network block delay.
pub const EPOCHS_IN_YEAR: ChainEpoch = SECONDS_IN_YEAR / EPOCH_DURATION_SECONDS;
