// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage market deal coordination and sector storage core for a
//! Filecoin node.
//!
//! The crate is split into the deal data model ([`actor`]), the paired
//! client/provider deal state machines ([`market`]), the chain event
//! watcher that correlates tipset activity with in-flight deals
//! ([`market::events`]), and the local sector storage index
//! ([`sector_storage`]). The peer host, blockchain client, keystore and
//! piece I/O are consumed through traits; see [`market::api`],
//! [`key_management`] and [`market::pieceio`].

pub mod actor;
pub mod blocks;
pub mod db;
pub mod key_management;
pub mod market;
pub mod message;
pub mod sector_storage;
