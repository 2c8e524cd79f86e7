//! RunEventLog - bounded, ordered, append-only event log per run
//!
//! The run driver is the only writer for a given run. Readers attach through
//! an [`EventCursor`], which starts after the latest event present when it
//! subscribed and sees every later event in sequence order.
//!
//! # Delivery
//!
//! - `publish` never waits on readers. Past `capacity` the oldest entry is
//!   evicted and lagging cursors observe a [`CursorItem::Gap`].
//! - A cursor only advances on `ack`. Calling `next` again without acking
//!   yields the same event, which gives at-least-once delivery per reader.
//! - Once `done` has been appended and a cursor has caught up, `next`
//!   returns [`CursorItem::Closed`] instead of waiting.
//!
//! A pruned run leaves a tombstone for a day, so a reader that attaches
//! after the sweep still sees the log as finished.
//!
//! Wake-ups go through a `tokio::sync::watch` channel carrying the latest
//! sequence id, so a publish that lands between a reader's buffer check and
//! its wait is never missed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared_types::RunEventKind;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// One appended event.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub seq: u64,
    pub run_id: Uuid,
    pub kind: RunEventKind,
    pub appended_at: DateTime<Utc>,
}

impl RunEvent {
    /// `{"seq": n, "type": "...", "data": ...}`
    pub fn to_wire(&self) -> serde_json::Value {
        let mut frame = serde_json::to_value(&self.kind)
            .unwrap_or_else(|_| serde_json::json!({ "type": self.kind.type_name() }));
        if let Some(map) = frame.as_object_mut() {
            map.insert("seq".to_string(), serde_json::Value::from(self.seq));
        }
        frame
    }
}

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Maximum retained events per run
    pub capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

const TOMBSTONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct RunEventLog {
    runs: Arc<DashMap<Uuid, Arc<RunLog>>>,
    /// Pruned finished runs, by prune time
    tombstones: Arc<DashMap<Uuid, Instant>>,
    config: EventLogConfig,
}

impl RunEventLog {
    pub fn new(config: EventLogConfig) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            tombstones: Arc::new(DashMap::new()),
            config: EventLogConfig {
                capacity: config.capacity.max(1),
            },
        }
    }

    /// Append an event and return its sequence id.
    pub fn publish(&self, run_id: Uuid, kind: RunEventKind) -> u64 {
        let seq = self.run_log(run_id).append(kind);
        tracing::trace!(run_id = %run_id, seq, "Run event appended");
        seq
    }

    /// Attach a new reader positioned after the latest event.
    pub fn subscribe(&self, run_id: Uuid) -> EventCursor {
        if let Some(log) = self.retained(run_id) {
            return Self::cursor_at_latest(log);
        }
        if self.tombstones.contains_key(&run_id) {
            return EventCursor::new(Arc::new(RunLog::finished(run_id)), 0);
        }
        Self::cursor_at_latest(self.run_log(run_id))
    }

    /// Attach to a run that has already finished, or that never existed.
    ///
    /// Uses the retained log when there is one; otherwise the cursor is
    /// closed from the start and nothing is registered.
    pub fn subscribe_finished(&self, run_id: Uuid) -> EventCursor {
        match self.retained(run_id) {
            Some(log) => Self::cursor_at_latest(log),
            None => EventCursor::new(Arc::new(RunLog::finished(run_id)), 0),
        }
    }

    /// Attach a reader that replays everything still retained after `after_seq`.
    pub fn subscribe_from(&self, run_id: Uuid, after_seq: u64) -> EventCursor {
        if self.retained(run_id).is_none() && self.tombstones.contains_key(&run_id) {
            return EventCursor::new(Arc::new(RunLog::finished(run_id)), 0);
        }
        EventCursor::new(self.run_log(run_id), after_seq)
    }

    /// Retained events for a run, oldest first.
    pub fn snapshot(&self, run_id: Uuid) -> Vec<RunEvent> {
        self.runs
            .get(&run_id)
            .map(|log| log.lock().events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_seq(&self, run_id: Uuid) -> Option<u64> {
        self.runs
            .get(&run_id)
            .map(|log| log.lock().next_seq - 1)
            .filter(|seq| *seq > 0)
    }

    /// True once the run's log has recorded `done`.
    pub fn is_finished(&self, run_id: Uuid) -> bool {
        self.runs
            .get(&run_id)
            .map(|log| log.lock().done_at.is_some())
            .unwrap_or(false)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Forget logs whose `done` was recorded more than `older_than` ago, and
    /// empty logs no reader is attached to.
    ///
    /// Cursors already attached keep their log alive until they are dropped.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let before = self.runs.len();
        let now = Instant::now();
        self.runs.retain(|run_id, log| {
            let attached = Arc::strong_count(log) > 1;
            let state = log.lock();
            match state.done_at {
                Some(done_at) => {
                    let keep = now.saturating_duration_since(done_at) < older_than;
                    if !keep {
                        self.tombstones.insert(*run_id, now);
                    }
                    keep
                }
                None => attached || state.next_seq > 1,
            }
        });
        self.tombstones
            .retain(|_, pruned_at| now.saturating_duration_since(*pruned_at) < TOMBSTONE_RETENTION);
        let pruned = before.saturating_sub(self.runs.len());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished run logs");
        }
        pruned
    }

    fn retained(&self, run_id: Uuid) -> Option<Arc<RunLog>> {
        self.runs.get(&run_id).map(|log| Arc::clone(log.value()))
    }

    fn cursor_at_latest(log: Arc<RunLog>) -> EventCursor {
        let latest = log.lock().next_seq - 1;
        EventCursor::new(log, latest)
    }

    fn run_log(&self, run_id: Uuid) -> Arc<RunLog> {
        if let Some(log) = self.retained(run_id) {
            return log;
        }
        self.tombstones.remove(&run_id);
        let log = self
            .runs
            .entry(run_id)
            .or_insert_with(|| Arc::new(RunLog::new(run_id, self.config.capacity)));
        Arc::clone(log.value())
    }
}

struct RunLog {
    run_id: Uuid,
    capacity: usize,
    state: Mutex<LogState>,
    latest: watch::Sender<u64>,
}

struct LogState {
    events: VecDeque<RunEvent>,
    next_seq: u64,
    done_at: Option<Instant>,
}

impl RunLog {
    fn new(run_id: Uuid, capacity: usize) -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            run_id,
            capacity,
            state: Mutex::new(LogState {
                events: VecDeque::new(),
                next_seq: 1,
                done_at: None,
            }),
            latest,
        }
    }

    /// Detached, already-finished log with no events.
    fn finished(run_id: Uuid) -> Self {
        let log = Self::new(run_id, 1);
        log.lock().done_at = Some(Instant::now());
        log
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, kind: RunEventKind) -> u64 {
        let seq = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            if kind.is_done() && state.done_at.is_none() {
                state.done_at = Some(Instant::now());
            }
            state.events.push_back(RunEvent {
                seq,
                run_id: self.run_id,
                kind,
                appended_at: Utc::now(),
            });
            while state.events.len() > self.capacity {
                state.events.pop_front();
            }
            seq
        };
        self.latest.send_replace(seq);
        seq
    }
}

/// What a cursor produced on one `next` call.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorItem {
    Event(RunEvent),
    /// Events were evicted before this reader saw them.
    Gap { missed: u64 },
    /// The run has finished and this reader has seen everything.
    Closed,
}

/// One reader's position in a run's log.
pub struct EventCursor {
    id: String,
    log: Arc<RunLog>,
    acked: u64,
    changes: watch::Receiver<u64>,
}

impl EventCursor {
    fn new(log: Arc<RunLog>, acked: u64) -> Self {
        let changes = log.latest.subscribe();
        Self {
            id: ulid::Ulid::new().to_string(),
            log,
            acked,
            changes,
        }
    }

    /// Unique reader identity
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_id(&self) -> Uuid {
        self.log.run_id
    }

    /// Highest sequence id this reader has acknowledged
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// Mark everything up to `seq` as delivered.
    pub fn ack(&mut self, seq: u64) {
        if seq > self.acked {
            self.acked = seq;
        }
    }

    /// Wait for the next unacknowledged event.
    pub async fn next(&mut self) -> CursorItem {
        loop {
            self.changes.borrow_and_update();
            if let Some(item) = self.try_next() {
                return item;
            }
            if self.changes.changed().await.is_err() {
                return self.try_next().unwrap_or(CursorItem::Closed);
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next); `None` means caught up.
    pub fn try_next(&mut self) -> Option<CursorItem> {
        let state = self.log.lock();
        let wanted = self.acked + 1;

        if let Some(oldest) = state.events.front() {
            if oldest.seq > wanted {
                let missed = oldest.seq - wanted;
                self.acked = oldest.seq - 1;
                tracing::warn!(
                    run_id = %self.log.run_id,
                    reader = %self.id,
                    missed,
                    "Reader fell behind the event log horizon"
                );
                return Some(CursorItem::Gap { missed });
            }
            let offset = usize::try_from(wanted - oldest.seq).ok()?;
            if let Some(event) = state.events.get(offset) {
                return Some(CursorItem::Event(event.clone()));
            }
        }

        if state.done_at.is_some() && wanted >= state.next_seq {
            return Some(CursorItem::Closed);
        }
        None
    }
}

impl std::fmt::Debug for EventCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCursor")
            .field("id", &self.id)
            .field("run_id", &self.log.run_id)
            .field("acked", &self.acked)
            .finish()
    }
}
