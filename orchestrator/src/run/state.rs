//! Run lifecycle state machine.
//!
//! ```text
//! queued ──► running ──► succeeded
//!   │           ├──────► failed
//!   │           └──────► cancelled
//!   ├──────────────────► failed      (missing crew at pickup)
//!   └──────────────────► cancelled   (cancelled before pickup)
//! ```
//!
//! Terminal states absorb: every transition out of one is rejected.

use chrono::{DateTime, Utc};
use shared_types::{RunStatus, RunView};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("run {run_id} is already {status}")]
    Terminal { run_id: Uuid, status: RunStatus },

    #[error("run {run_id} cannot move from {from} to {to}")]
    Invalid {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
}

pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Failed)
            | (Queued, Cancelled)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: Uuid,
    pub crew_id: Uuid,
    pub status: RunStatus,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
}

impl Run {
    pub fn new_queued(crew_id: Uuid, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            crew_id,
            status: RunStatus::Queued,
            prompt: prompt.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_tokens: 0,
            output: None,
            failure_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    pub fn mark_succeeded(
        &mut self,
        output: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RunStatus::Succeeded)?;
        self.output = Some(output.into());
        self.finished_at = Some(at);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RunStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(at);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Cancelled)?;
        self.finished_at = Some(at);
        Ok(())
    }

    pub fn add_tokens(&mut self, count: u64) {
        self.total_tokens = self.total_tokens.saturating_add(count);
    }

    pub fn view(&self) -> RunView {
        RunView {
            id: self.id,
            crew_id: self.crew_id,
            status: self.status,
            prompt: self.prompt.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            total_tokens: self.total_tokens,
        }
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                run_id: self.id,
                status: self.status,
            });
        }
        if !can_transition(self.status, to) {
            return Err(TransitionError::Invalid {
                run_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
