//! Event sink — the single write path for run events.
//!
//! `emit` allocates the run's next sequence, stamps identity and timestamp,
//! persists the row, and only then publishes to the run's hub, all inside
//! the hub's per-run critical section. Persistence is the source of truth:
//! a failed insert aborts the emit (and the caller terminates the run),
//! while a failed publication costs at most one subscriber and is never
//! reported upward.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::{EventDraft, RunEvent};
use crate::store::events::EventRepository;
use crate::stream::StreamRegistry;

pub struct EventSink {
    events: EventRepository,
    registry: Arc<StreamRegistry>,
}

impl EventSink {
    pub fn new(events: EventRepository, registry: Arc<StreamRegistry>) -> Self {
        Self { events, registry }
    }

    pub fn repository(&self) -> &EventRepository {
        &self.events
    }

    /// Persist and publish one event, returning it with its sequence.
    pub fn emit(&self, run_id: &str, draft: EventDraft) -> Result<Arc<RunEvent>> {
        match self.registry.get(run_id) {
            Some(hub) => hub.emit(|sequence| {
                let event = materialize(run_id, sequence, &draft);
                self.events.insert(&event)?;
                Ok(event)
            }),
            // No hub: the run has no live window (already terminal, or a
            // recovery write). Sequence continues from persisted history;
            // the store's unique index backstops concurrent writers.
            None => {
                let sequence = self.events.max_sequence(run_id)? + 1;
                let event = materialize(run_id, sequence, &draft);
                self.events.insert(&event)?;
                Ok(Arc::new(event))
            }
        }
    }
}

fn materialize(run_id: &str, sequence: u64, draft: &EventDraft) -> RunEvent {
    RunEvent {
        id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        sequence,
        timestamp: Utc::now(),
        source: draft.source.clone(),
        kind: draft.kind,
        data: draft.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentKind, EventKind, EventSource};
    use crate::store::Db;

    fn setup() -> (EventSink, Arc<StreamRegistry>, EventRepository) {
        let db = Db::open_in_memory().unwrap();
        let events = EventRepository::new(db);
        let registry = Arc::new(StreamRegistry::new(8));
        (
            EventSink::new(events.clone(), registry.clone()),
            registry,
            events,
        )
    }

    fn draft(kind: EventKind) -> EventDraft {
        EventDraft::new(
            kind,
            EventSource::new("gs", AgentKind::GlobalSupervisor, "Global"),
            serde_json::json!({}),
        )
    }

    #[test]
    fn emit_sequences_from_one() {
        let (sink, registry, _) = setup();
        registry.open("r1", 1).unwrap();
        assert_eq!(sink.emit("r1", draft(EventKind::LifecycleStarted)).unwrap().sequence, 1);
        assert_eq!(sink.emit("r1", draft(EventKind::LlmStream)).unwrap().sequence, 2);
        assert_eq!(sink.emit("r1", draft(EventKind::LlmStream)).unwrap().sequence, 3);
    }

    #[test]
    fn runs_sequence_independently() {
        let (sink, registry, _) = setup();
        registry.open("r1", 1).unwrap();
        registry.open("r2", 1).unwrap();
        assert_eq!(sink.emit("r1", draft(EventKind::LifecycleStarted)).unwrap().sequence, 1);
        assert_eq!(sink.emit("r2", draft(EventKind::LifecycleStarted)).unwrap().sequence, 1);
        assert_eq!(sink.emit("r1", draft(EventKind::LlmStream)).unwrap().sequence, 2);
    }

    #[test]
    fn emit_without_hub_continues_history() {
        let (sink, registry, events) = setup();
        registry.open("r1", 1).unwrap();
        sink.emit("r1", draft(EventKind::LifecycleStarted)).unwrap();
        sink.emit("r1", draft(EventKind::LlmStream)).unwrap();
        registry.close("r1");

        let event = sink.emit("r1", draft(EventKind::LifecycleCancelled)).unwrap();
        assert_eq!(event.sequence, 3);
        assert_eq!(events.max_sequence("r1").unwrap(), 3);
    }

    #[tokio::test]
    async fn emit_publishes_to_subscribers() {
        let (sink, registry, events) = setup();
        let hub = registry.open("r1", 1).unwrap();
        let mut sub = hub.subscribe(&events).unwrap();

        sink.emit("r1", draft(EventKind::LifecycleStarted)).unwrap();
        let received = sub.next().await.unwrap();
        assert_eq!(received.sequence, 1);
        assert_eq!(received.kind, EventKind::LifecycleStarted);
        assert!(!received.id.is_empty());
    }

    #[test]
    fn persisted_rows_match_emitted_events() {
        let (sink, registry, events) = setup();
        registry.open("r1", 1).unwrap();
        let emitted = sink
            .emit(
                "r1",
                EventDraft::new(
                    EventKind::LlmStream,
                    EventSource::new("w1", AgentKind::Worker, "Analyst").in_team("analysis"),
                    serde_json::json!({"content": "done"}),
                ),
            )
            .unwrap();

        let stored = events.list("r1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, emitted.id);
        assert_eq!(stored[0].data["content"], "done");
        assert_eq!(
            stored[0].source.as_ref().unwrap().team_name.as_deref(),
            Some("analysis")
        );
    }
}
