//! RunDriver - executes one dispatched run end to end
//!
//! The driver is the only writer of a run's state and the only publisher to
//! its event log. Every path through [`RunDriver::drive`] ends the event
//! sequence with a terminal `status` event followed by `done`, so readers
//! always have a clean end of stream.
//!
//! Mission signals follow the run: `busy` when it starts, `available` when
//! it reaches any terminal state, plus a critical alert when it fails. They
//! are only sent when the crew belongs to an organization.

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{AlertSeverity, RunEventKind, RunStatus, SignalStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cancel::CancellationRegistry;
use super::executor::{ExecutionError, ExecutionRequest, ExecutionStep, RunExecutor};
use super::prompt::render_prompt;
use super::state::Run;
use super::store::{RunStore, RunStoreError};
use crate::actors::MissionBus;
use crate::dispatch::{JobHandler, RunJob};
use crate::events::RunEventLog;
use crate::observability::RunMetrics;

pub const MISSING_PRECONDITION_REASON: &str = "Crew or run missing";
pub const RUN_FAILED_ALERT_TITLE: &str = "Mission run failed";
pub const RUN_PANICKED_REASON: &str = "run worker panicked";
/// A running run's token count is written through every this many tokens.
pub const TOKEN_PERSIST_INTERVAL: u64 = 8;

/// How a single drive ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { output: String },
    Failed { reason: String },
    Cancelled,
    /// The run was not queued at pickup; nothing was done.
    Skipped { status: RunStatus },
}

pub struct RunDriver {
    store: Arc<dyn RunStore>,
    events: RunEventLog,
    mission: MissionBus,
    executor: Arc<dyn RunExecutor>,
    cancellations: CancellationRegistry,
    metrics: RunMetrics,
}

impl RunDriver {
    pub fn new(
        store: Arc<dyn RunStore>,
        events: RunEventLog,
        mission: MissionBus,
        executor: Arc<dyn RunExecutor>,
        cancellations: CancellationRegistry,
        metrics: RunMetrics,
    ) -> Self {
        Self {
            store,
            events,
            mission,
            executor,
            cancellations,
            metrics,
        }
    }

    pub async fn drive(&self, job: RunJob) -> RunOutcome {
        let token = self.cancellations.token(job.run_id);
        let outcome = self.drive_inner(&job, &token).await;
        self.cancellations.release(job.run_id);

        tracing::info!(
            run_id = %job.run_id,
            crew_id = %job.crew_id,
            job_id = %job.job_id,
            outcome = ?outcome,
            "Run finished"
        );
        outcome
    }

    /// Cancel a queued run that no worker holds. Returns the run's status
    /// afterwards, or `None` when the run does not exist.
    pub async fn cancel_undispatched(
        &self,
        run_id: Uuid,
    ) -> Result<Option<RunStatus>, RunStoreError> {
        let Some(mut run) = self.store.get_run(run_id).await? else {
            return Ok(None);
        };
        if run.status != RunStatus::Queued {
            return Ok(Some(run.status));
        }
        let org_id = self
            .store
            .get_crew(run.crew_id)
            .await?
            .and_then(|crew| crew.org_id);

        tracing::info!(run_id = %run.id, "Cancelling run that was never picked up");
        self.finish_cancelled(&mut run, org_id.as_deref()).await;
        Ok(Some(run.status))
    }

    /// Fail a run whose drive panicked, unless it already reached a terminal state.
    pub async fn recover_panicked(&self, job: &RunJob) {
        self.cancellations.release(job.run_id);
        let run = match self.store.get_run(job.run_id).await {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(run_id = %job.run_id, error = %e, "Failed to load panicked run");
                None
            }
        };
        let Some(mut run) = run else {
            if !self.events.is_finished(job.run_id) {
                self.fail_missing_run(job.run_id);
            }
            return;
        };
        if run.status.is_terminal() {
            return;
        }

        let org_id = match self.store.get_crew(run.crew_id).await {
            Ok(crew) => crew.and_then(|crew| crew.org_id),
            Err(e) => {
                tracing::warn!(crew_id = %run.crew_id, error = %e, "Failed to load crew of panicked run");
                None
            }
        };
        tracing::error!(run_id = %run.id, job_id = %job.job_id, "Failing run after worker panic");
        self.finish_failed(&mut run, org_id.as_deref(), RUN_PANICKED_REASON.to_string())
            .await;
    }

    async fn drive_inner(&self, job: &RunJob, token: &CancellationToken) -> RunOutcome {
        let run = match self.store.get_run(job.run_id).await {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(run_id = %job.run_id, error = %e, "Failed to load run at pickup");
                None
            }
        };
        let crew = match self.store.get_crew(job.crew_id).await {
            Ok(crew) => crew,
            Err(e) => {
                tracing::warn!(crew_id = %job.crew_id, error = %e, "Failed to load crew at pickup");
                None
            }
        };

        let Some(mut run) = run else {
            return self.fail_missing_run(job.run_id);
        };
        if run.status != RunStatus::Queued {
            tracing::warn!(
                run_id = %run.id,
                status = %run.status,
                "Run was not queued at pickup, skipping"
            );
            return RunOutcome::Skipped { status: run.status };
        }
        let Some(crew) = crew else {
            return self
                .finish_failed(&mut run, None, MISSING_PRECONDITION_REASON.to_string())
                .await;
        };
        let org_id = crew.org_id.clone();

        if token.is_cancelled() {
            return self.finish_cancelled(&mut run, org_id.as_deref()).await;
        }

        if let Err(e) = run.mark_running(Utc::now()) {
            tracing::warn!(run_id = %run.id, error = %e, "Could not start run");
            return RunOutcome::Skipped { status: run.status };
        }
        self.persist(&run).await;
        self.metrics.record_started(run.crew_id);
        self.events
            .publish(run.id, RunEventKind::Status(RunStatus::Running));
        if let Some(org_id) = org_id.as_deref() {
            self.mission
                .publish_signal(org_id, SignalStatus::Busy, Some(run.crew_id));
        }
        tracing::info!(run_id = %run.id, crew_id = %run.crew_id, "Run started");

        let request = ExecutionRequest {
            run_id: run.id,
            crew_id: run.crew_id,
            prompt: job.prompt.clone(),
            rendered_prompt: render_prompt(&job.prompt, &crew.recipe, &job.inputs),
        };
        let mut steps = self.executor.execute(request);
        let mut output = String::new();

        loop {
            if token.is_cancelled() {
                drop(steps);
                return self.finish_cancelled(&mut run, org_id.as_deref()).await;
            }

            match steps.recv().await {
                Some(Ok(ExecutionStep::Log(text))) => {
                    self.events.publish(run.id, RunEventKind::Message(text));
                }
                Some(Ok(ExecutionStep::Token(text))) => {
                    output.push_str(&text);
                    run.add_tokens(1);
                    if run.total_tokens % TOKEN_PERSIST_INTERVAL == 0 {
                        self.persist(&run).await;
                    }
                    self.events.publish(run.id, RunEventKind::Token(text));
                }
                Some(Ok(ExecutionStep::Done(final_text))) => {
                    if !final_text.is_empty() {
                        output = final_text;
                    }
                    break;
                }
                Some(Err(e)) => {
                    return self
                        .finish_failed(&mut run, org_id.as_deref(), e.to_string())
                        .await;
                }
                None => {
                    return self
                        .finish_failed(
                            &mut run,
                            org_id.as_deref(),
                            ExecutionError::Incomplete.to_string(),
                        )
                        .await;
                }
            }
        }

        self.finish_succeeded(&mut run, org_id.as_deref(), output.trim().to_string())
            .await
    }

    async fn finish_succeeded(
        &self,
        run: &mut Run,
        org_id: Option<&str>,
        output: String,
    ) -> RunOutcome {
        if let Err(e) = run.mark_succeeded(output.clone(), Utc::now()) {
            tracing::error!(run_id = %run.id, error = %e, "Could not mark run succeeded");
        }
        self.persist(run).await;
        self.metrics.record_finished(run.crew_id, RunStatus::Succeeded);
        self.publish_terminal(run, RunStatus::Succeeded, org_id);
        RunOutcome::Succeeded { output }
    }

    async fn finish_failed(&self, run: &mut Run, org_id: Option<&str>, reason: String) -> RunOutcome {
        if let Err(e) = run.mark_failed(reason.clone(), Utc::now()) {
            tracing::error!(run_id = %run.id, error = %e, "Could not mark run failed");
        }
        self.persist(run).await;
        self.metrics.record_finished(run.crew_id, RunStatus::Failed);
        tracing::warn!(run_id = %run.id, reason = %reason, "Run failed");

        self.events
            .publish(run.id, RunEventKind::Error(reason.clone()));
        self.publish_terminal(run, RunStatus::Failed, org_id);
        if let Some(org_id) = org_id {
            self.mission.publish_alert(
                org_id,
                AlertSeverity::Critical,
                RUN_FAILED_ALERT_TITLE,
                Some(reason.clone()),
                Some(run.crew_id),
            );
        }
        RunOutcome::Failed { reason }
    }

    async fn finish_cancelled(&self, run: &mut Run, org_id: Option<&str>) -> RunOutcome {
        if let Err(e) = run.mark_cancelled(Utc::now()) {
            tracing::error!(run_id = %run.id, error = %e, "Could not mark run cancelled");
        }
        self.persist(run).await;
        self.metrics.record_finished(run.crew_id, RunStatus::Cancelled);
        self.publish_terminal(run, RunStatus::Cancelled, org_id);
        RunOutcome::Cancelled
    }

    /// No row to update; readers still get a failed end of stream.
    fn fail_missing_run(&self, run_id: Uuid) -> RunOutcome {
        tracing::warn!(run_id = %run_id, "Run row missing at pickup");
        self.events.publish(
            run_id,
            RunEventKind::Error(MISSING_PRECONDITION_REASON.to_string()),
        );
        self.events
            .publish(run_id, RunEventKind::Status(RunStatus::Failed));
        self.events.publish(run_id, RunEventKind::Done);
        RunOutcome::Failed {
            reason: MISSING_PRECONDITION_REASON.to_string(),
        }
    }

    fn publish_terminal(&self, run: &Run, status: RunStatus, org_id: Option<&str>) {
        self.events.publish(run.id, RunEventKind::Status(status));
        self.events.publish(run.id, RunEventKind::Done);
        if let Some(org_id) = org_id {
            self.mission
                .publish_signal(org_id, SignalStatus::Available, Some(run.crew_id));
        }
    }

    async fn persist(&self, run: &Run) {
        if let Err(e) = self.store.save_run(run).await {
            tracing::warn!(run_id = %run.id, status = %run.status, error = %e, "Failed to persist run");
        }
    }
}

#[async_trait]
impl JobHandler for RunDriver {
    async fn handle(&self, job: RunJob) {
        self.drive(job).await;
    }

    async fn on_panic(&self, job: RunJob) {
        self.recover_panicked(&job).await;
    }
}
