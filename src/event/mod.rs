//! Run event envelope — the canonical record every agent emission becomes.
//!
//! Events carry a per-run monotonic `sequence` assigned by the sink, a
//! millisecond UTC timestamp, a source (which agent in the tree spoke), a
//! classification drawn from a closed category/action vocabulary, and an
//! opaque JSON payload. Persisted order by sequence equals emission order.

pub mod sink;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Position of an agent in the hierarchy tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    GlobalSupervisor,
    TeamSupervisor,
    Worker,
}

/// Top-level event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Llm,
    Dispatch,
    System,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Llm => "llm",
            Self::Dispatch => "dispatch",
            Self::System => "system",
        }
    }
}

/// The closed set of `category.action` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    LifecycleStarted,
    LifecycleCompleted,
    LifecycleFailed,
    LifecycleCancelled,
    LlmStream,
    LlmReasoning,
    LlmToolCall,
    LlmToolResult,
    DispatchTeam,
    DispatchWorker,
    SystemTopology,
    SystemWarning,
    SystemError,
}

impl EventKind {
    pub fn category(self) -> EventCategory {
        match self {
            Self::LifecycleStarted
            | Self::LifecycleCompleted
            | Self::LifecycleFailed
            | Self::LifecycleCancelled => EventCategory::Lifecycle,
            Self::LlmStream | Self::LlmReasoning | Self::LlmToolCall | Self::LlmToolResult => {
                EventCategory::Llm
            }
            Self::DispatchTeam | Self::DispatchWorker => EventCategory::Dispatch,
            Self::SystemTopology | Self::SystemWarning | Self::SystemError => EventCategory::System,
        }
    }

    pub fn action(self) -> &'static str {
        match self {
            Self::LifecycleStarted => "started",
            Self::LifecycleCompleted => "completed",
            Self::LifecycleFailed => "failed",
            Self::LifecycleCancelled => "cancelled",
            Self::LlmStream => "stream",
            Self::LlmReasoning => "reasoning",
            Self::LlmToolCall => "tool_call",
            Self::LlmToolResult => "tool_result",
            Self::DispatchTeam => "team",
            Self::DispatchWorker => "worker",
            Self::SystemTopology => "topology",
            Self::SystemWarning => "warning",
            Self::SystemError => "error",
        }
    }

    /// The SSE event name, e.g. `lifecycle.started`.
    pub fn label(self) -> String {
        format!("{}.{}", self.category().as_str(), self.action())
    }

    /// Inverse of `category()` + `action()`, used when reading persisted rows.
    pub fn parse(category: &str, action: &str) -> Option<Self> {
        Some(match (category, action) {
            ("lifecycle", "started") => Self::LifecycleStarted,
            ("lifecycle", "completed") => Self::LifecycleCompleted,
            ("lifecycle", "failed") => Self::LifecycleFailed,
            ("lifecycle", "cancelled") => Self::LifecycleCancelled,
            ("llm", "stream") => Self::LlmStream,
            ("llm", "reasoning") => Self::LlmReasoning,
            ("llm", "tool_call") => Self::LlmToolCall,
            ("llm", "tool_result") => Self::LlmToolResult,
            ("dispatch", "team") => Self::DispatchTeam,
            ("dispatch", "worker") => Self::DispatchWorker,
            ("system", "topology") => Self::SystemTopology,
            ("system", "warning") => Self::SystemWarning,
            ("system", "error") => Self::SystemError,
            _ => return None,
        })
    }
}

/// Which agent produced an event. Absent only for runtime-originated events
/// emitted before the hierarchy is in scope (pre-start cancellation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub agent_id: String,
    pub agent_type: AgentKind,
    pub agent_name: String,
    #[serde(default)]
    pub team_name: Option<String>,
}

impl EventSource {
    pub fn new(agent_id: &str, agent_type: AgentKind, agent_name: &str) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type,
            agent_name: agent_name.into(),
            team_name: None,
        }
    }

    pub fn in_team(mut self, team_name: &str) -> Self {
        self.team_name = Some(team_name.into());
        self
    }
}

/// A fully sequenced, persisted event.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub id: String,
    pub run_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source: Option<EventSource>,
    pub kind: EventKind,
    pub data: serde_json::Value,
}

impl RunEvent {
    /// The JSON body sent on the wire (SSE `data:` field and the `events`
    /// endpoint). Field layout is part of the public API.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "run_id": self.run_id,
            "timestamp": format_timestamp(self.timestamp),
            "sequence": self.sequence,
            "source": self.source,
            "event": {
                "category": self.kind.category().as_str(),
                "action": self.kind.action(),
            },
            "data": self.data,
        })
    }
}

/// An event the executor wants to emit, before the sink assigns identity,
/// sequence, and timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub source: Option<EventSource>,
    pub kind: EventKind,
    pub data: serde_json::Value,
}

impl EventDraft {
    pub fn new(kind: EventKind, source: EventSource, data: serde_json::Value) -> Self {
        Self {
            source: Some(source),
            kind,
            data,
        }
    }

    /// Draft without an agent source (runtime-originated).
    pub fn system(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            source: None,
            kind,
            data,
        }
    }
}

/// ISO-8601 UTC with millisecond precision, `Z` suffix.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn kind_label_and_parse_are_inverse() {
        let all = [
            EventKind::LifecycleStarted,
            EventKind::LifecycleCompleted,
            EventKind::LifecycleFailed,
            EventKind::LifecycleCancelled,
            EventKind::LlmStream,
            EventKind::LlmReasoning,
            EventKind::LlmToolCall,
            EventKind::LlmToolResult,
            EventKind::DispatchTeam,
            EventKind::DispatchWorker,
            EventKind::SystemTopology,
            EventKind::SystemWarning,
            EventKind::SystemError,
        ];
        for kind in all {
            let parsed = EventKind::parse(kind.category().as_str(), kind.action()).unwrap();
            assert_eq!(parsed, kind, "{}", kind.label());
        }
        assert!(EventKind::parse("llm", "bogus").is_none());
        assert!(EventKind::parse("bogus", "stream").is_none());
    }

    #[test]
    fn agent_kind_serializes_snake_case() {
        let json = serde_json::to_string(&AgentKind::GlobalSupervisor).unwrap();
        assert_eq!(json, "\"global_supervisor\"");
        let parsed: AgentKind = serde_json::from_str("\"team_supervisor\"").unwrap();
        assert_eq!(parsed, AgentKind::TeamSupervisor);
    }

    #[test]
    fn wire_format_shape() {
        let event = RunEvent {
            id: "ev-1".into(),
            run_id: "run-1".into(),
            sequence: 3,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            source: Some(
                EventSource::new("ts-1", AgentKind::TeamSupervisor, "Lead").in_team("analysis"),
            ),
            kind: EventKind::LlmStream,
            data: serde_json::json!({"content": "thinking"}),
        };
        let wire = event.to_wire();
        assert_eq!(wire["sequence"], 3);
        assert_eq!(wire["event"]["category"], "llm");
        assert_eq!(wire["event"]["action"], "stream");
        assert_eq!(wire["source"]["agent_type"], "team_supervisor");
        assert_eq!(wire["source"]["team_name"], "analysis");
        assert_eq!(wire["timestamp"], "2025-01-01T12:00:00.000Z");
    }

    #[test]
    fn wire_source_null_when_absent() {
        let event = RunEvent {
            id: "ev-2".into(),
            run_id: "run-1".into(),
            sequence: 1,
            timestamp: Utc::now(),
            source: None,
            kind: EventKind::LifecycleCancelled,
            data: serde_json::json!({}),
        };
        assert!(event.to_wire()["source"].is_null());
    }

    #[test]
    fn timestamp_millis_format() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(format_timestamp(ts), "2023-11-14T22:13:20.123Z");
    }
}
