//! Job dispatch - hands queued runs to background workers
//!
//! `enqueue` never waits: it either places the job on a bounded queue and
//! returns a job id, or reports a retryable [`DispatchError`]. Workers live
//! on whatever runtime the pool was started on; the binary gives them their
//! own multi-threaded runtime so request handling never shares a scheduler
//! with run execution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One unit of background work: execute a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunJob {
    pub job_id: String,
    pub run_id: Uuid,
    pub crew_id: Uuid,
    pub prompt: String,
    pub inputs: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl RunJob {
    pub fn new(run_id: Uuid, crew_id: Uuid, prompt: String, inputs: Map<String, Value>) -> Self {
        Self {
            job_id: ulid::Ulid::new().to_string(),
            run_id,
            crew_id,
            prompt,
            inputs,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("run queue is full ({capacity} jobs pending)")]
    QueueFull { capacity: usize },

    #[error("dispatcher unavailable: {0}")]
    Unavailable(String),
}

impl DispatchError {
    /// Every dispatch failure leaves the run queued, so the caller may retry.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Seam between the HTTP layer and whatever executes runs.
pub trait JobDispatcher: Send + Sync {
    /// Schedule a run and return its job id without waiting for execution.
    fn enqueue(
        &self,
        run_id: Uuid,
        crew_id: Uuid,
        prompt: String,
        inputs: Map<String, Value>,
    ) -> Result<String, DispatchError>;
}

/// Executes one dequeued job. Implemented by the run driver.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: RunJob);

    /// Called on the worker after `handle` panicked for `job`.
    async fn on_panic(&self, _job: RunJob) {}
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

/// Fixed set of worker slots draining one bounded queue
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<RunJob>>>,
    queue_capacity: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(runtime: &Handle, config: WorkerPoolConfig, handler: Arc<dyn JobHandler>) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|slot| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                runtime.spawn(worker_loop(slot, receiver, handler))
            })
            .collect();

        tracing::info!(
            workers = config.workers.max(1),
            queue_capacity,
            "Run worker pool started"
        );

        Self {
            sender: Mutex::new(Some(sender)),
            queue_capacity,
            workers: Mutex::new(workers),
        }
    }

    /// Stop accepting jobs and wait for queued and in-flight runs to finish.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Run worker ended abnormally");
            }
        }
        tracing::info!("Run worker pool stopped");
    }
}

impl JobDispatcher for WorkerPool {
    fn enqueue(
        &self,
        run_id: Uuid,
        crew_id: Uuid,
        prompt: String,
        inputs: Map<String, Value>,
    ) -> Result<String, DispatchError> {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = guard.as_ref() else {
            return Err(DispatchError::Unavailable("worker pool is shut down".to_string()));
        };

        let job = RunJob::new(run_id, crew_id, prompt, inputs);
        let job_id = job.job_id.clone();
        match sender.try_send(job) {
            Ok(()) => {
                tracing::info!(job_id = %job_id, run_id = %run_id, crew_id = %crew_id, "Run enqueued");
                Ok(job_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(run_id = %run_id, "Run queue full, rejecting dispatch");
                Err(DispatchError::QueueFull {
                    capacity: self.queue_capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Unavailable(
                "all run workers have stopped".to_string(),
            )),
        }
    }
}

async fn worker_loop(
    slot: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<RunJob>>>,
    handler: Arc<dyn JobHandler>,
) {
    loop {
        let job = { receiver.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        let job_id = job.job_id.clone();
        let run_id = job.run_id;
        tracing::debug!(slot, job_id = %job_id, run_id = %run_id, "Worker picked up run");

        // A panicking run must not take the worker slot down with it.
        let running = Arc::clone(&handler);
        let panicked_job = job.clone();
        if let Err(e) = tokio::spawn(async move { running.handle(job).await }).await {
            tracing::error!(slot, job_id = %job_id, run_id = %run_id, error = %e, "Run job panicked");
            if e.is_panic() {
                handler.on_panic(panicked_job).await;
            }
        }
    }
    tracing::debug!(slot, "Run worker exiting");
}
