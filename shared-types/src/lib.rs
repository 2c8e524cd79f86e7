//! Shared wire types for the crew run orchestrator
//!
//! These types are used by:
//! - the orchestrator HTTP/WebSocket/SSE surface
//! - dashboard and CLI clients that consume run streams and mission signals
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Run Lifecycle
// ============================================================================

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses absorb every further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// One entry of a run's event log, as seen on the wire.
///
/// Serializes as `{"type": "...", "data": ...}`; `done` carries no data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RunEventKind {
    Status(RunStatus),
    Message(String),
    Token(String),
    Error(String),
    Done,
}

impl RunEventKind {
    pub fn is_done(&self) -> bool {
        matches!(self, RunEventKind::Done)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RunEventKind::Status(_) => "status",
            RunEventKind::Message(_) => "message",
            RunEventKind::Token(_) => "token",
            RunEventKind::Error(_) => "error",
            RunEventKind::Done => "done",
        }
    }
}

/// Body of `POST /crews/{crew_id}/runs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunRequest {
    pub prompt: String,
    #[serde(default)]
    pub inputs: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Public projection of a run row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub id: Uuid,
    pub crew_id: Uuid,
    pub status: RunStatus,
    pub prompt: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
}

// ============================================================================
// Mission Signals
// ============================================================================

/// Availability of an organization's crew as shown on dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub status: SignalStatus,
    #[serde(rename = "crewId", default, skip_serializing_if = "Option::is_none")]
    pub crew_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub severity: AlertSeverity,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "crewId", default, skip_serializing_if = "Option::is_none")]
    pub crew_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewChangePayload {
    #[serde(rename = "crewId")]
    pub crew_id: Uuid,
}

/// Organization-scoped ephemeral message carried by the mission bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum MissionMessage {
    Signal(SignalPayload),
    Alert(AlertPayload),
    CrewChange(CrewChangePayload),
}

impl MissionMessage {
    pub fn signal(status: SignalStatus, crew_id: Option<Uuid>) -> Self {
        MissionMessage::Signal(SignalPayload { status, crew_id })
    }

    pub fn offline() -> Self {
        Self::signal(SignalStatus::Offline, None)
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, MissionMessage::Signal(_))
    }
}

// ============================================================================
// API Errors
// ============================================================================

/// Machine-readable error body returned by the HTTP surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_run_status_parses_its_own_display() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<RunStatus>(), Ok(status));
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_event_wire_shape() {
        let status = serde_json::to_value(RunEventKind::Status(RunStatus::Running)).unwrap();
        assert_eq!(status, json!({"type": "status", "data": "running"}));

        let token = serde_json::to_value(RunEventKind::Token("hi ".to_string())).unwrap();
        assert_eq!(token, json!({"type": "token", "data": "hi "}));

        let done = serde_json::to_value(RunEventKind::Done).unwrap();
        assert_eq!(done, json!({"type": "done"}));
    }

    #[test]
    fn test_mission_message_wire_shape() {
        let crew_id = Uuid::new_v4();
        let signal = MissionMessage::signal(SignalStatus::Busy, Some(crew_id));
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({"type": "signal", "payload": {"status": "busy", "crewId": crew_id.to_string()}})
        );

        let change = MissionMessage::CrewChange(CrewChangePayload { crew_id });
        assert_eq!(
            serde_json::to_value(&change).unwrap()["type"],
            json!("crew-change")
        );

        let offline = serde_json::to_value(MissionMessage::offline()).unwrap();
        assert_eq!(offline, json!({"type": "signal", "payload": {"status": "offline"}}));
    }

    #[test]
    fn test_alert_omits_empty_message() {
        let alert = MissionMessage::Alert(AlertPayload {
            severity: AlertSeverity::Critical,
            title: "Mission run failed".to_string(),
            message: None,
            crew_id: None,
        });
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["payload"]["severity"], "critical");
        assert!(value["payload"].get("message").is_none());
    }
}
