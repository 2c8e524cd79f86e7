//! Per-run event log and the cursors that tail it.

pub mod log;

pub use log::{CursorItem, EventCursor, EventLogConfig, RunEvent, RunEventLog};
