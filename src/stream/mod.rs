//! Live event fan-out: per-run broadcast hubs and bounded subscribers.
//!
//! The registry maps run id → hub for the window between `start_run` and the
//! run's terminal event. Each hub owns the run's sequence counter and its
//! subscriber set behind one per-run lock, so sequence allocation, durable
//! persistence, and publication happen in a single critical section and
//! publishers observe exactly the persisted order.
//!
//! Subscribers are bounded in-order queues with a wait-free offer: when a
//! queue is full the slowest subscriber is dropped and handed a
//! `system.warning` `slow_consumer` sentinel instead of stalling the sink.
//!
//! Replay-vs-live seam: `subscribe` reads the hub's high-water mark `H`
//! under the lock and registers the live queue with an `after = H` filter,
//! then loads persisted events `<= H`. Live delivery drops anything at or
//! below `H`; the emit path only publishes sequences above it. Replay ∪ live
//! therefore covers every sequence exactly once.

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::{EventKind, RunEvent};
use crate::store::events::EventRepository;

/// Process-wide map from run id to its live broadcast hub.
pub struct StreamRegistry {
    hubs: RwLock<HashMap<String, Arc<RunHub>>>,
    subscriber_buffer: usize,
}

impl StreamRegistry {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    /// Register a hub for a run. `next_seq` seeds the sequence counter
    /// (`max persisted sequence + 1`, so recovery resumes without gaps).
    /// Fails if a hub already exists for the run.
    pub fn open(&self, run_id: &str, next_seq: u64) -> Result<Arc<RunHub>> {
        let mut hubs = self.hubs.write();
        if hubs.contains_key(run_id) {
            anyhow::bail!("Stream hub already open for run '{run_id}'");
        }
        let hub = Arc::new(RunHub::new(run_id, next_seq, self.subscriber_buffer));
        hubs.insert(run_id.to_string(), hub.clone());
        Ok(hub)
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHub>> {
        self.hubs.read().get(run_id).cloned()
    }

    /// Close and deregister a run's hub. Idempotent.
    pub fn close(&self, run_id: &str) {
        let hub = self.hubs.write().remove(run_id);
        if let Some(hub) = hub {
            hub.close();
        }
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.hubs.read().contains_key(run_id)
    }
}

struct SubscriberSlot {
    after: u64,
    tx: mpsc::Sender<Arc<RunEvent>>,
    dropped_slow: Arc<AtomicBool>,
}

struct HubState {
    next_seq: u64,
    high_water: u64,
    closed: bool,
    subscribers: Vec<SubscriberSlot>,
}

/// In-memory broadcast point for one run. Exists from `start_run` until the
/// terminal event; owns the run's sequence counter for that window.
pub struct RunHub {
    run_id: String,
    buffer: usize,
    state: Mutex<HubState>,
}

impl RunHub {
    fn new(run_id: &str, next_seq: u64, buffer: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            buffer,
            state: Mutex::new(HubState {
                next_seq: next_seq.max(1),
                high_water: next_seq.max(1) - 1,
                closed: false,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Allocate the next sequence, run `persist` with it, and on success
    /// publish the event to all live subscribers — all under the per-run
    /// lock. A persistence failure leaves the counter untouched and reaches
    /// the caller; publish failures only ever cost the affected subscriber.
    pub fn emit(&self, persist: impl FnOnce(u64) -> Result<RunEvent>) -> Result<Arc<RunEvent>> {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        let event = Arc::new(persist(seq)?);
        state.next_seq = seq + 1;
        state.high_water = seq;
        Self::deliver(&mut state, &event);
        Ok(event)
    }

    fn deliver(state: &mut HubState, event: &Arc<RunEvent>) {
        state.subscribers.retain(|slot| {
            if event.sequence <= slot.after {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped_slow.store(true, Ordering::Release);
                    tracing::warn!(
                        run_id = %event.run_id,
                        sequence = event.sequence,
                        "dropping slow subscriber"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Attach a subscriber: replay of everything persisted up to the
    /// high-water mark, then live events above it.
    pub fn subscribe(&self, events: &EventRepository) -> Result<Subscriber> {
        let (dropped_slow, rx, high_water, closed) = {
            let mut state = self.state.lock();
            let (tx, rx) = mpsc::channel(self.buffer);
            let dropped_slow = Arc::new(AtomicBool::new(false));
            if !state.closed {
                let after = state.high_water;
                state.subscribers.push(SubscriberSlot {
                    after,
                    tx,
                    dropped_slow: dropped_slow.clone(),
                });
            }
            // When the hub is already closed `tx` drops here and the live
            // channel reads as immediately ended.
            (dropped_slow, rx, state.high_water, state.closed)
        };
        // The slot is registered before the store read: events emitted while
        // we read the replay queue up in the live channel instead of racing.
        let replay = if closed {
            events.list(&self.run_id)?
        } else {
            events.list_up_to(&self.run_id, high_water)?
        };
        Ok(Subscriber {
            run_id: self.run_id.clone(),
            replay: replay.into_iter().map(Arc::new).collect(),
            rx,
            dropped_slow,
            sentinel_sent: false,
        })
    }

    /// Close every subscriber and refuse further registrations. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Highest sequence published so far.
    pub fn high_water(&self) -> u64 {
        self.state.lock().high_water
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

/// One consumer's view of a run: a drained replay queue followed by the live
/// channel. `next()` yields events in sequence order and `None` at
/// end-of-stream; a subscriber evicted for falling behind receives a final
/// `system.warning` `slow_consumer` sentinel first.
pub struct Subscriber {
    run_id: String,
    replay: VecDeque<Arc<RunEvent>>,
    rx: mpsc::Receiver<Arc<RunEvent>>,
    dropped_slow: Arc<AtomicBool>,
    sentinel_sent: bool,
}

impl Subscriber {
    pub async fn next(&mut self) -> Option<Arc<RunEvent>> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        if let Some(event) = self.rx.recv().await {
            return Some(event);
        }
        if self.dropped_slow.load(Ordering::Acquire) && !self.sentinel_sent {
            self.sentinel_sent = true;
            return Some(Arc::new(slow_consumer_sentinel(&self.run_id)));
        }
        None
    }
}

/// Synthetic, never-persisted closing event for an evicted subscriber.
fn slow_consumer_sentinel(run_id: &str) -> RunEvent {
    RunEvent {
        id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        sequence: 0,
        timestamp: Utc::now(),
        source: None,
        kind: EventKind::SystemWarning,
        data: serde_json::json!({
            "reason": "slow_consumer",
            "message": "subscriber event queue overflowed; reconnect and replay from history",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentKind, EventSource};
    use crate::store::Db;

    fn setup() -> (StreamRegistry, EventRepository) {
        let db = Db::open_in_memory().unwrap();
        (StreamRegistry::new(8), EventRepository::new(db))
    }

    fn persist_event(
        events: &EventRepository,
        run_id: &str,
        seq: u64,
        kind: EventKind,
    ) -> RunEvent {
        let event = RunEvent {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            sequence: seq,
            timestamp: Utc::now(),
            source: Some(EventSource::new("gs", AgentKind::GlobalSupervisor, "Global")),
            kind,
            data: serde_json::json!({"n": seq}),
        };
        events.insert(&event).unwrap();
        event
    }

    #[test]
    fn open_twice_fails() {
        let (registry, _) = setup();
        registry.open("r1", 1).unwrap();
        assert!(registry.open("r1", 1).is_err());
    }

    #[test]
    fn close_is_idempotent_and_deregisters() {
        let (registry, _) = setup();
        registry.open("r1", 1).unwrap();
        assert!(registry.contains("r1"));
        registry.close("r1");
        registry.close("r1");
        assert!(!registry.contains("r1"));
        assert!(registry.get("r1").is_none());
    }

    #[test]
    fn emit_assigns_monotonic_sequences() {
        let (registry, events) = setup();
        let hub = registry.open("r1", 1).unwrap();
        for expected in 1..=3u64 {
            let event = hub
                .emit(|seq| {
                    let event = persist_event(&events, "r1", seq, EventKind::LlmStream);
                    Ok(event)
                })
                .unwrap();
            assert_eq!(event.sequence, expected);
        }
        assert_eq!(hub.high_water(), 3);
        assert_eq!(events.max_sequence("r1").unwrap(), 3);
    }

    #[test]
    fn failed_persist_does_not_advance_counter() {
        let (registry, events) = setup();
        let hub = registry.open("r1", 1).unwrap();
        let err = hub.emit(|_| anyhow::bail!("disk full"));
        assert!(err.is_err());
        let event = hub
            .emit(|seq| Ok(persist_event(&events, "r1", seq, EventKind::LlmStream)))
            .unwrap();
        assert_eq!(event.sequence, 1);
    }

    #[test]
    fn counter_resumes_from_persisted_history() {
        let (registry, events) = setup();
        persist_event(&events, "r1", 1, EventKind::LifecycleStarted);
        persist_event(&events, "r1", 2, EventKind::LlmStream);
        let next = events.max_sequence("r1").unwrap() + 1;
        let hub = registry.open("r1", next).unwrap();
        let event = hub
            .emit(|seq| Ok(persist_event(&events, "r1", seq, EventKind::LlmStream)))
            .unwrap();
        assert_eq!(event.sequence, 3);
    }

    #[tokio::test]
    async fn replay_then_live_without_gaps_or_duplicates() {
        let (registry, events) = setup();
        let hub = registry.open("r1", 1).unwrap();
        for _ in 0..3 {
            hub.emit(|seq| Ok(persist_event(&events, "r1", seq, EventKind::LlmStream)))
                .unwrap();
        }

        let mut sub = hub.subscribe(&events).unwrap();

        // Live events published after attach
        for _ in 0..2 {
            hub.emit(|seq| Ok(persist_event(&events, "r1", seq, EventKind::LlmStream)))
                .unwrap();
        }
        registry.close("r1");

        let mut seqs = Vec::new();
        while let Some(event) = sub.next().await {
            seqs.push(event.sequence);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn subscribe_after_close_replays_full_history() {
        let (registry, events) = setup();
        let hub = registry.open("r1", 1).unwrap();
        for _ in 0..2 {
            hub.emit(|seq| Ok(persist_event(&events, "r1", seq, EventKind::LlmStream)))
                .unwrap();
        }
        hub.close();

        let mut sub = hub.subscribe(&events).unwrap();
        assert_eq!(sub.next().await.unwrap().sequence, 1);
        assert_eq!(sub.next().await.unwrap().sequence, 2);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_dropped_with_sentinel() {
        let db = Db::open_in_memory().unwrap();
        let events = EventRepository::new(db);
        let registry = StreamRegistry::new(2);
        let hub = registry.open("r1", 1).unwrap();

        let mut fast = hub.subscribe(&events).unwrap();
        let mut slow = hub.subscribe(&events).unwrap();
        assert_eq!(hub.subscriber_count(), 2);

        // Fast consumer keeps draining; slow one never reads. Buffer is 2,
        // so the 3rd undrained event evicts the slow subscriber.
        for i in 0..4u64 {
            hub.emit(|seq| Ok(persist_event(&events, "r1", seq, EventKind::LlmStream)))
                .unwrap();
            if i < 3 {
                assert_eq!(fast.next().await.unwrap().sequence, i + 1);
            }
        }
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(fast.next().await.unwrap().sequence, 4);

        // Slow subscriber: buffered events, then the sentinel, then end.
        assert_eq!(slow.next().await.unwrap().sequence, 1);
        assert_eq!(slow.next().await.unwrap().sequence, 2);
        let sentinel = slow.next().await.unwrap();
        assert_eq!(sentinel.kind, EventKind::SystemWarning);
        assert_eq!(sentinel.data["reason"], "slow_consumer");
        assert!(slow.next().await.is_none());

        // The run proceeds normally for everyone else.
        hub.emit(|seq| Ok(persist_event(&events, "r1", seq, EventKind::LifecycleCompleted)))
            .unwrap();
        assert_eq!(fast.next().await.unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn close_ends_live_subscribers() {
        let (registry, events) = setup();
        let hub = registry.open("r1", 1).unwrap();
        let mut sub = hub.subscribe(&events).unwrap();
        registry.close("r1");
        assert!(sub.next().await.is_none());
    }
}
