//! Event repository — append-only, sequence-ordered rows per run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::Db;
use crate::event::{AgentKind, EventKind, EventSource, RunEvent};

#[derive(Clone)]
pub struct EventRepository {
    db: Db,
}

impl EventRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append one event. The `(run_id, sequence)` unique index rejects any
    /// duplicate sequence, so a sequencer bug surfaces as an error rather
    /// than silent reordering.
    pub fn insert(&self, event: &RunEvent) -> Result<()> {
        let (agent_id, agent_type, agent_name, team_name) = match &event.source {
            Some(source) => (
                Some(source.agent_id.as_str()),
                Some(agent_kind_str(source.agent_type)),
                Some(source.agent_name.as_str()),
                source.team_name.as_deref(),
            ),
            None => (None, None, None, None),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_events
                    (id, run_id, sequence, timestamp, agent_id, agent_type,
                     agent_name, team_name, category, action, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event.id,
                    event.run_id,
                    event.sequence as i64,
                    event.timestamp.to_rfc3339(),
                    agent_id,
                    agent_type,
                    agent_name,
                    team_name,
                    event.kind.category().as_str(),
                    event.kind.action(),
                    event.data.to_string(),
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to persist event {} seq {} for run {}",
                    event.kind.label(),
                    event.sequence,
                    event.run_id
                )
            })?;
            Ok(())
        })
    }

    /// Highest persisted sequence for a run, 0 when the run has no events.
    /// The sequencer initializes its counter from this on hub open.
    pub fn max_sequence(&self, run_id: &str) -> Result<u64> {
        self.db.with_conn(|conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(sequence) FROM run_events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )?;
            Ok(max.unwrap_or(0) as u64)
        })
    }

    /// All events for a run, sequence order.
    pub fn list(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.query(
            "SELECT id, run_id, sequence, timestamp, agent_id, agent_type,
                    agent_name, team_name, category, action, data
             FROM run_events WHERE run_id = ?1 ORDER BY sequence",
            params![run_id],
        )
    }

    /// Events with `sequence <= high_water`, sequence order. This is the
    /// replay half of the replay-vs-live seam.
    pub fn list_up_to(&self, run_id: &str, high_water: u64) -> Result<Vec<RunEvent>> {
        self.query(
            "SELECT id, run_id, sequence, timestamp, agent_id, agent_type,
                    agent_name, team_name, category, action, data
             FROM run_events WHERE run_id = ?1 AND sequence <= ?2 ORDER BY sequence",
            params![run_id, high_water as i64],
        )
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<RunEvent>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, map_event_row)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row??);
            }
            Ok(events)
        })
    }
}

fn agent_kind_str(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::GlobalSupervisor => "global_supervisor",
        AgentKind::TeamSupervisor => "team_supervisor",
        AgentKind::Worker => "worker",
    }
}

fn parse_agent_kind(raw: &str) -> Result<AgentKind> {
    Ok(match raw {
        "global_supervisor" => AgentKind::GlobalSupervisor,
        "team_supervisor" => AgentKind::TeamSupervisor,
        "worker" => AgentKind::Worker,
        other => anyhow::bail!("Unknown agent type '{other}'"),
    })
}

fn map_event_row(row: &Row<'_>) -> rusqlite::Result<Result<RunEvent>> {
    let sequence: i64 = row.get(2)?;
    let timestamp_raw: String = row.get(3)?;
    let agent_id: Option<String> = row.get(4)?;
    let agent_type: Option<String> = row.get(5)?;
    let agent_name: Option<String> = row.get(6)?;
    let team_name: Option<String> = row.get(7)?;
    let category: String = row.get(8)?;
    let action: String = row.get(9)?;
    let data_raw: String = row.get(10)?;
    let id: String = row.get(0)?;
    let run_id: String = row.get(1)?;

    Ok((|| {
        let source = match (agent_id, agent_type, agent_name) {
            (Some(agent_id), Some(agent_type), Some(agent_name)) => Some(EventSource {
                agent_id,
                agent_type: parse_agent_kind(&agent_type)?,
                agent_name,
                team_name,
            }),
            _ => None,
        };
        let kind = EventKind::parse(&category, &action)
            .ok_or_else(|| anyhow::anyhow!("Unknown event kind '{category}.{action}'"))?;
        Ok(RunEvent {
            id,
            run_id,
            sequence: sequence as u64,
            timestamp: DateTime::parse_from_rfc3339(&timestamp_raw)
                .with_context(|| format!("Invalid stored timestamp '{timestamp_raw}'"))?
                .with_timezone(&Utc),
            source,
            kind,
            data: serde_json::from_str(&data_raw)
                .with_context(|| "Invalid stored event payload")?,
        })
    })())
}
