//! Cooperative cancellation flags per run.
//!
//! A run is tracked from the moment it is handed to a dispatcher until its
//! driver finishes. A cancel request only marks the token of a tracked run.
//! The driver looks at it at pickup and between execution steps; an
//! in-flight step always completes. Untracked runs have no worker, so the
//! caller must finish them itself.

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a run, created on first use.
    pub fn token(&self, run_id: Uuid) -> CancellationToken {
        self.tokens
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Mark a tracked run cancelled. Returns `false` when no one holds the run.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let Some(token) = self.tokens.get(&run_id) else {
            return false;
        };
        token.cancel();
        tracing::info!(run_id = %run_id, "Run cancellation requested");
        true
    }

    pub fn is_tracked(&self, run_id: Uuid) -> bool {
        self.tokens.contains_key(&run_id)
    }

    pub fn is_cancelled(&self, run_id: Uuid) -> bool {
        self.tokens
            .get(&run_id)
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    /// Stop tracking a run; reports whether a cancel was requested meanwhile.
    pub fn release(&self, run_id: Uuid) -> bool {
        self.tokens
            .remove(&run_id)
            .map(|(_, token)| token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
