use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actors::MissionBusConfig;
use crate::app_state::StackConfig;
use crate::dispatch::WorkerPoolConfig;
use crate::events::EventLogConfig;
use crate::limits::AdmissionPolicy;
use crate::run::Crew;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the orchestrator listens on
    pub port: u16,
    /// SQLite database for runs and crews; in-memory store when unset
    pub database_url: Option<String>,
    /// TOML file with `[[crews]]` entries loaded into the store at startup
    pub crews_file: Option<PathBuf>,
    /// Worker slots executing runs in parallel
    pub run_workers: usize,
    /// Jobs that may wait for a free worker before dispatch is refused
    pub run_queue_capacity: usize,
    /// Events retained per run
    pub event_log_capacity: usize,
    /// How long a finished run's log stays readable
    pub event_log_retention: Duration,
    /// Per-subscriber mission buffer
    pub mission_buffer: usize,
    /// Quiet period before a mission subscriber gets the last signal again
    pub mission_idle: Duration,
    pub run_start_rate_per_minute: u32,
    pub run_start_burst: u32,
    pub run_quota_per_day: u64,
    /// Allowed CORS origins; empty means any
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Used by tests to avoid mutating the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(&lookup);
        Ok(Self {
            port: env.parse("ORCHESTRATOR_PORT", 8080)?,
            database_url: env.optional("ORCHESTRATOR_DATABASE_URL"),
            crews_file: env.optional("ORCHESTRATOR_CREWS_FILE").map(PathBuf::from),
            run_workers: env.parse("RUN_WORKERS", 4)?,
            run_queue_capacity: env.parse("RUN_QUEUE_CAPACITY", 256)?,
            event_log_capacity: env.parse("EVENT_LOG_CAPACITY", 1000)?,
            event_log_retention: Duration::from_secs(env.parse("EVENT_LOG_RETENTION_SECS", 900)?),
            mission_buffer: env.parse("MISSION_BUFFER", 100)?,
            mission_idle: Duration::from_secs(env.parse("MISSION_IDLE_SECS", 45)?),
            run_start_rate_per_minute: env.parse("RUN_START_RATE_PER_MINUTE", 30)?,
            run_start_burst: env.parse("RUN_START_BURST", 60)?,
            run_quota_per_day: env.parse("RUN_QUOTA_PER_DAY", 5000)?,
            cors_origins: env.csv("CORS_ORIGINS", &[]),
        })
    }

    pub fn stack(&self) -> StackConfig {
        StackConfig {
            workers: WorkerPoolConfig {
                workers: self.run_workers,
                queue_capacity: self.run_queue_capacity,
            },
            event_log: EventLogConfig {
                capacity: self.event_log_capacity,
            },
            mission: MissionBusConfig {
                buffer_capacity: self.mission_buffer,
                idle_window: self.mission_idle,
            },
            admission: AdmissionPolicy {
                run_start_rate_per_minute: self.run_start_rate_per_minute,
                run_start_burst: self.run_start_burst,
                run_quota_per_day: self.run_quota_per_day,
            },
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(val) => val
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
            None => Ok(default),
        }
    }

    fn csv(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.optional(key) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => default.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CrewSeedFile {
    #[serde(default)]
    crews: Vec<Crew>,
}

/// Parse a crew seed file:
///
/// ```toml
/// [[crews]]
/// id = "6f1c..."
/// org_id = "acme"
/// name = "Research"
/// mission = "Answer questions"
/// instructions = ["Plan", "Search", "Summarize"]
///
/// [crews.tools]
/// search = "Web search"
/// ```
pub fn parse_crews(raw: &str) -> anyhow::Result<Vec<Crew>> {
    let seed: CrewSeedFile = toml::from_str(raw).context("invalid crew seed file")?;
    Ok(seed.crews)
}

pub fn load_crews(path: &Path) -> anyhow::Result<Vec<Crew>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read crew seed file {}", path.display()))?;
    parse_crews(&raw)
}
