//! Undo log of extracted chunks, keyed by undo token.

use std::collections::BTreeMap;

use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::UndoToken;

use crate::table::Row;

/// Rows removed by one extraction, kept until the chunk is released or rolled back.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    /// Source table.
    pub table: String,
    /// Removed rows in ascending key order.
    pub rows: Vec<Row>,
}

/// Append-only (by token) undo log of one partition engine.
///
/// Tokens must be strictly increasing across the engine's lifetime, so a token identifies one
/// chunk forever even after it was released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UndoLog {
    pending: BTreeMap<UndoToken, UndoEntry>,
    highest: Option<UndoToken>,
}

impl UndoLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails unless `token` is greater than every token seen so far.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` for a stale or reused token.
    pub fn check_fresh(&self, token: UndoToken) -> ReshardResult<()> {
        match self.highest {
            Some(highest) if token <= highest => Err(ReshardError::Storage(format!(
                "undo token {token} is not greater than last token {highest}"
            ))),
            _ => Ok(()),
        }
    }

    /// Records the rows removed under `token`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` for a stale or reused token.
    pub fn record(&mut self, token: UndoToken, entry: UndoEntry) -> ReshardResult<()> {
        self.check_fresh(token)?;
        self.highest = Some(token);
        let _ = self.pending.insert(token, entry);
        Ok(())
    }

    /// Removes and returns a pending chunk for rollback. `None` if already released or rolled
    /// back.
    pub fn take(&mut self, token: UndoToken) -> Option<UndoEntry> {
        self.pending.remove(&token)
    }

    /// Puts back a chunk returned by [`UndoLog::take`] whose rollback could not complete.
    pub fn reinstate(&mut self, token: UndoToken, entry: UndoEntry) {
        let _ = self.pending.insert(token, entry);
    }

    /// Commits a pending chunk, dropping its undo data.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` when `token` is not pending.
    pub fn release(&mut self, token: UndoToken) -> ReshardResult<()> {
        self.pending
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| ReshardError::Storage(format!("undo token {token} is not pending")))
    }

    /// Pending tokens, ascending.
    pub fn pending_tokens(&self) -> impl Iterator<Item = UndoToken> + '_ {
        self.pending.keys().copied()
    }

    /// Highest token ever recorded.
    #[must_use]
    pub const fn highest(&self) -> Option<UndoToken> {
        self.highest
    }
}
