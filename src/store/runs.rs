//! Run repository — lifecycle rows for every execution.
//!
//! Status transitions form a DAG: `pending → running → {completed, failed,
//! cancelled}` plus `pending → cancelled` for cancel-before-start.
//! `started_at` is stamped when a run leaves `pending`; `completed_at` when
//! it reaches a terminal status. `update_status` enforces both rules so no
//! caller can produce a half-stamped row.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => anyhow::bail!("Unknown run status '{other}'"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub hierarchy_id: String,
    pub task: String,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub statistics: Option<serde_json::Value>,
    pub topology: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// JSON shape returned by the HTTP surface.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "hierarchy_id": self.hierarchy_id,
            "task": self.task,
            "status": self.status.as_str(),
            "result": self.result,
            "error": self.error,
            "statistics": self.statistics,
            "topology_snapshot": self.topology,
            "created_at": crate::event::format_timestamp(self.created_at),
            "started_at": self.started_at.map(crate::event::format_timestamp),
            "completed_at": self.completed_at.map(crate::event::format_timestamp),
        })
    }
}

/// Optional fields applied alongside a status change.
#[derive(Debug, Default)]
pub struct StatusChanges {
    pub result: Option<String>,
    pub error: Option<String>,
    pub statistics: Option<serde_json::Value>,
    pub topology: Option<serde_json::Value>,
}

/// Filters for paged listing.
#[derive(Debug, Default)]
pub struct RunFilter {
    pub hierarchy_id: Option<String>,
    pub status: Option<RunStatus>,
}

#[derive(Clone)]
pub struct RunRepository {
    db: Db,
}

impl RunRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a new `pending` run.
    pub fn create(&self, hierarchy_id: &str, task: &str) -> Result<RunRecord> {
        let record = RunRecord {
            id: Uuid::new_v4().to_string(),
            hierarchy_id: hierarchy_id.into(),
            task: task.into(),
            status: RunStatus::Pending,
            result: None,
            error: None,
            statistics: None,
            topology: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, hierarchy_id, task, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.hierarchy_id,
                    record.task,
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to create run")?;
            Ok(())
        })?;
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Option<RunRecord>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                map_run_row,
            )
            .optional()
            .context("Failed to query run")?
            .transpose()
        })
    }

    /// Paged listing, newest first. `page` is 1-based. Returns the page
    /// content and the unpaged total.
    pub fn list(
        &self,
        page: u32,
        size: u32,
        filter: &RunFilter,
    ) -> Result<(Vec<RunRecord>, u64)> {
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ref hierarchy_id) = filter.hierarchy_id {
            clauses.push(format!("hierarchy_id = ?{}", args.len() + 1));
            args.push(Box::new(hierarchy_id.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let page = page.max(1);
        let size = size.clamp(1, 100);
        let offset = u64::from(page - 1) * u64::from(size);

        self.db.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM runs {where_sql}"),
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {RUN_COLUMNS} FROM runs {where_sql}
                 ORDER BY created_at DESC LIMIT {size} OFFSET {offset}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                map_run_row,
            )?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row??);
            }
            Ok((runs, total as u64))
        })
    }

    /// Transition a run's status, applying `changes` and stamping
    /// `started_at` / `completed_at` per the status invariants.
    pub fn update_status(
        &self,
        id: &str,
        status: RunStatus,
        changes: StatusChanges,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let rows = conn
                .execute(
                    "UPDATE runs SET
                        status = ?1,
                        result = COALESCE(?2, result),
                        error = COALESCE(?3, error),
                        statistics = COALESCE(?4, statistics),
                        topology = COALESCE(?5, topology),
                        started_at = CASE
                            WHEN ?1 != 'pending' AND started_at IS NULL THEN ?6
                            ELSE started_at END,
                        completed_at = CASE
                            WHEN ?1 IN ('completed', 'failed', 'cancelled')
                                AND completed_at IS NULL THEN ?6
                            ELSE completed_at END
                     WHERE id = ?7",
                    params![
                        status.as_str(),
                        changes.result,
                        changes.error,
                        changes.statistics.map(|v| v.to_string()),
                        changes.topology.map(|v| v.to_string()),
                        now,
                        id,
                    ],
                )
                .context("Failed to update run status")?;
            if rows == 0 {
                anyhow::bail!("No run with id '{id}'");
            }
            Ok(())
        })
    }
}

const RUN_COLUMNS: &str = "id, hierarchy_id, task, status, result, error, statistics, topology, \
                           created_at, started_at, completed_at";

fn map_run_row(row: &Row<'_>) -> rusqlite::Result<Result<RunRecord>> {
    let status_raw: String = row.get(3)?;
    let statistics_raw: Option<String> = row.get(6)?;
    let topology_raw: Option<String> = row.get(7)?;
    let created_raw: String = row.get(8)?;
    let started_raw: Option<String> = row.get(9)?;
    let completed_raw: Option<String> = row.get(10)?;

    Ok((|| {
        Ok(RunRecord {
            id: row.get(0)?,
            hierarchy_id: row.get(1)?,
            task: row.get(2)?,
            status: status_raw.parse()?,
            result: row.get(4)?,
            error: row.get(5)?,
            statistics: statistics_raw.as_deref().map(serde_json::from_str).transpose()?,
            topology: topology_raw.as_deref().map(serde_json::from_str).transpose()?,
            created_at: parse_timestamp(&created_raw)?,
            started_at: started_raw.as_deref().map(parse_timestamp).transpose()?,
            completed_at: completed_raw.as_deref().map(parse_timestamp).transpose()?,
        })
    })())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp '{raw}'"))
}
