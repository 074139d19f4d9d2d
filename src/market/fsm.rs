// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Table-driven finite state machine shared by the client and provider deal
//! subsystems. Transitions are declared once at startup as
//! `(event, from-set, to)` rows; resolving an event against a deal's current
//! state yields the next state or an error the caller logs and drops.

use std::fmt::Debug;
use thiserror::Error;

/// State type driven by a [`TransitionTable`].
pub trait FsmState: Copy + PartialEq + Debug {
    /// Terminal states can never be left; a `from_any` row does not match
    /// them.
    fn is_terminal(&self) -> bool;
}

/// The set of states a transition may fire from.
pub enum StateSet<S: 'static> {
    /// Any non-terminal state.
    Any,
    One(S),
    Many(&'static [S]),
}

impl<S: FsmState> StateSet<S> {
    fn contains(&self, state: S) -> bool {
        match self {
            StateSet::Any => true,
            StateSet::One(s) => *s == state,
            StateSet::Many(set) => set.contains(&state),
        }
    }
}

/// A single `(event, from-set, to)` row.
pub struct Transition<K, S: 'static> {
    pub event: K,
    pub from: StateSet<S>,
    pub to: S,
}

impl<K, S> Transition<K, S> {
    pub fn new(event: K, from: StateSet<S>, to: S) -> Self {
        Transition { event, from, to }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("event {event} not allowed in terminal state {from}")]
    TerminalState { event: String, from: String },
    #[error("no transition for event {event} in state {from}")]
    InvalidTransition { event: String, from: String },
}

/// Static transition table resolved once at startup.
pub struct TransitionTable<K, S: 'static> {
    rows: Vec<Transition<K, S>>,
}

impl<K, S> TransitionTable<K, S>
where
    K: Copy + PartialEq + Debug,
    S: FsmState,
{
    pub fn new(rows: Vec<Transition<K, S>>) -> Self {
        TransitionTable { rows }
    }

    /// Returns the target state for `event` fired from `from`.
    pub fn resolve(&self, event: K, from: S) -> Result<S, FsmError> {
        if from.is_terminal() {
            return Err(FsmError::TerminalState {
                event: format!("{event:?}"),
                from: format!("{from:?}"),
            });
        }
        self.rows
            .iter()
            .find(|row| row.event == event && row.from.contains(from))
            .map(|row| row.to)
            .ok_or_else(|| FsmError::InvalidTransition {
                event: format!("{event:?}"),
                from: format!("{from:?}"),
            })
    }
}
