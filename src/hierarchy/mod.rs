//! Hierarchy definitions — the static two-level agent tree a run executes.
//!
//! A hierarchy is one global supervisor, an ordered list of teams, and per
//! team one supervisor plus an ordered list of workers. The tree is read-only
//! to the run subsystem; a deep copy is snapshotted onto each run at start.

use serde::{Deserialize, Serialize};

/// One addressable agent in the tree. `agent` is the opaque reference the
/// invocation adapter resolves (for LLM adapters, typically a model name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub agent: String,
}

/// A team: one supervisor and its workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    pub supervisor: AgentProfile,
    pub workers: Vec<AgentProfile>,
}

/// The full two-level tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub id: String,
    pub name: String,
    pub supervisor: AgentProfile,
    pub teams: Vec<Team>,
}

impl Team {
    /// Find a worker by id, falling back to name. Dispatch tool calls may
    /// carry either.
    pub fn find_worker(&self, key: &str) -> Option<&AgentProfile> {
        self.workers
            .iter()
            .find(|w| w.id == key)
            .or_else(|| self.workers.iter().find(|w| w.name == key))
    }
}

impl Hierarchy {
    /// Find a team by id, falling back to name.
    pub fn find_team(&self, key: &str) -> Option<&Team> {
        self.teams
            .iter()
            .find(|t| t.id == key)
            .or_else(|| self.teams.iter().find(|t| t.name == key))
    }

    /// Deep copy of the tree as a JSON value, stored on the run row and
    /// emitted as the `system.topology` event payload.
    pub fn topology_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!(null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample() -> Hierarchy {
        Hierarchy {
            id: "h-1".into(),
            name: "research".into(),
            supervisor: AgentProfile {
                id: "gs-1".into(),
                name: "Global Supervisor".into(),
                role: "coordinator".into(),
                agent: "gpt-4o".into(),
            },
            teams: vec![Team {
                id: "t-1".into(),
                name: "analysis".into(),
                role: "analysis team".into(),
                supervisor: AgentProfile {
                    id: "ts-1".into(),
                    name: "Analysis Lead".into(),
                    role: "team lead".into(),
                    agent: "gpt-4o".into(),
                },
                workers: vec![AgentProfile {
                    id: "w-1".into(),
                    name: "Analyst".into(),
                    role: "analyst".into(),
                    agent: "gpt-4o-mini".into(),
                }],
            }],
        }
    }

    #[test]
    fn find_team_by_id_and_name() {
        let h = sample();
        assert_eq!(h.find_team("t-1").unwrap().name, "analysis");
        assert_eq!(h.find_team("analysis").unwrap().id, "t-1");
        assert!(h.find_team("missing").is_none());
    }

    #[test]
    fn find_worker_by_id_and_name() {
        let h = sample();
        let team = h.find_team("t-1").unwrap();
        assert_eq!(team.find_worker("w-1").unwrap().name, "Analyst");
        assert_eq!(team.find_worker("Analyst").unwrap().id, "w-1");
    }

    #[test]
    fn snapshot_round_trips() {
        let h = sample();
        let snapshot = h.topology_snapshot();
        let parsed: Hierarchy = serde_json::from_value(snapshot).unwrap();
        assert_eq!(parsed, h);
    }
}
