//! In-process run counters exposed at `GET /metrics/runs`.

use dashmap::DashMap;
use serde::Serialize;
use shared_types::RunStatus;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    started: Arc<DashMap<Uuid, u64>>,
    finished: Arc<DashMap<(Uuid, RunStatus), u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrewRunCount {
    pub crew_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMetricsSnapshot {
    pub started: Vec<CrewRunCount>,
    pub finished: Vec<CrewRunCount>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self, crew_id: Uuid) {
        *self.started.entry(crew_id).or_insert(0) += 1;
    }

    pub fn record_finished(&self, crew_id: Uuid, status: RunStatus) {
        *self.finished.entry((crew_id, status)).or_insert(0) += 1;
    }

    pub fn started(&self, crew_id: Uuid) -> u64 {
        self.started.get(&crew_id).map_or(0, |count| *count)
    }

    pub fn finished(&self, crew_id: Uuid, status: RunStatus) -> u64 {
        self.finished.get(&(crew_id, status)).map_or(0, |count| *count)
    }

    pub fn snapshot(&self) -> RunMetricsSnapshot {
        let mut started: Vec<CrewRunCount> = self
            .started
            .iter()
            .map(|entry| CrewRunCount {
                crew_id: *entry.key(),
                status: None,
                count: *entry.value(),
            })
            .collect();
        started.sort_by_key(|c| c.crew_id);

        let mut finished: Vec<CrewRunCount> = self
            .finished
            .iter()
            .map(|entry| CrewRunCount {
                crew_id: entry.key().0,
                status: Some(entry.key().1),
                count: *entry.value(),
            })
            .collect();
        finished.sort_by_key(|c| (c.crew_id, c.status.map(RunStatus::as_str)));

        RunMetricsSnapshot { started, finished }
    }
}
