//! Admission control for expensive operations.
//!
//! Both primitives are synchronous and reject instead of delaying: a denied
//! caller gets an `AdmissionError` and no run state is touched.

pub mod quota;
pub mod rate;

pub use quota::QuotaEnforcer;
pub use rate::RateLimiter;

/// Rejection raised before any work is admitted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("rate_limited")]
    RateLimited { actor: String, route: String },

    #[error("quota_exceeded:{metric}")]
    QuotaExceeded {
        org_id: String,
        metric: String,
        total: u64,
        limit: u64,
    },
}

/// Limits applied to `POST /crews/{crew_id}/runs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub run_start_rate_per_minute: u32,
    pub run_start_burst: u32,
    pub run_quota_per_day: u64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            run_start_rate_per_minute: 30,
            run_start_burst: 60,
            run_quota_per_day: 5000,
        }
    }
}

pub const RUN_START_ROUTE: &str = "runs.start";
pub const RUNS_METRIC: &str = "runs";
