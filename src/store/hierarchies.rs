//! Hierarchy repository — minimal CRUD so runs have something to execute.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::Db;
use crate::hierarchy::Hierarchy;

#[derive(Clone)]
pub struct HierarchyRepository {
    db: Db,
}

impl HierarchyRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Store a hierarchy definition. Assigns an id when the definition
    /// carries an empty one.
    pub fn create(&self, mut hierarchy: Hierarchy) -> Result<Hierarchy> {
        if hierarchy.id.is_empty() {
            hierarchy.id = Uuid::new_v4().to_string();
        }
        let definition =
            serde_json::to_string(&hierarchy).context("Failed to serialize hierarchy")?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hierarchies (id, name, definition, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![hierarchy.id, hierarchy.name, definition, now],
            )
            .with_context(|| format!("Failed to create hierarchy '{}'", hierarchy.name))?;
            Ok(())
        })?;
        Ok(hierarchy)
    }

    pub fn get(&self, id: &str) -> Result<Option<Hierarchy>> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT definition FROM hierarchies WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query hierarchy")
        })?;
        match raw {
            Some(json) => {
                let hierarchy =
                    serde_json::from_str(&json).context("Failed to parse stored hierarchy")?;
                Ok(Some(hierarchy))
            }
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<Hierarchy>> {
        let rows: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT definition FROM hierarchies ORDER BY created_at")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("Failed to parse stored hierarchy"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{AgentProfile, Team};

    fn agent(id: &str, name: &str) -> AgentProfile {
        AgentProfile {
            id: id.into(),
            name: name.into(),
            role: String::new(),
            agent: "test-model".into(),
        }
    }

    fn sample(id: &str) -> Hierarchy {
        Hierarchy {
            id: id.into(),
            name: "research".into(),
            supervisor: agent("gs", "Global"),
            teams: vec![Team {
                id: "t-1".into(),
                name: "analysis".into(),
                role: String::new(),
                supervisor: agent("ts", "Lead"),
                workers: vec![agent("w", "Analyst")],
            }],
        }
    }

    #[test]
    fn create_and_get_round_trips() {
        let repo = HierarchyRepository::new(Db::open_in_memory().unwrap());
        let created = repo.create(sample("h-1")).unwrap();
        let fetched = repo.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn create_assigns_id_when_empty() {
        let repo = HierarchyRepository::new(Db::open_in_memory().unwrap());
        let created = repo.create(sample("")).unwrap();
        assert!(!created.id.is_empty());
        assert!(repo.get(&created.id).unwrap().is_some());
    }

    #[test]
    fn get_missing_returns_none() {
        let repo = HierarchyRepository::new(Db::open_in_memory().unwrap());
        assert!(repo.get("nope").unwrap().is_none());
    }

    #[test]
    fn list_returns_all() {
        let repo = HierarchyRepository::new(Db::open_in_memory().unwrap());
        repo.create(sample("h-1")).unwrap();
        repo.create(sample("h-2")).unwrap();
        assert_eq!(repo.list().unwrap().len(), 2);
    }
}
