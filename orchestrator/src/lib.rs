//! Crew run orchestrator
//!
//! Starts long-running crew runs in the background and lets any number of
//! viewers watch them live:
//!
//! - `dispatch` hands queued runs to a worker pool on its own runtime
//! - `run` owns the lifecycle state machine and the driver that executes it
//! - `events` is the bounded, ordered per-run event log with broadcast cursors
//! - `actors::mission_bus` broadcasts organization-scoped signals and alerts
//! - `limits` shapes admission (token-bucket rate limit, daily quota)
//! - `api` exposes the HTTP, SSE and WebSocket surface

pub mod actors;
pub mod api;
pub mod app_state;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod limits;
pub mod observability;
pub mod run;
