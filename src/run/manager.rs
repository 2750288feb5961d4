//! Run manager — process-wide owner of the executor worker pool.
//!
//! `start_run` persists a `pending` run, opens its stream hub (so a client
//! calling `stream` immediately after `start` attaches before the first
//! event), and enqueues the run for the pool. Workers pull run ids FIFO;
//! when all workers are busy new runs wait in the queue as `pending`.
//! Cancellation is a per-run flag: `cancel_run` sets it and returns without
//! waiting for the terminal event.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::AgentAdapter;
use crate::error::ApiError;
use crate::event::sink::EventSink;
use crate::event::{EventDraft, EventKind};
use crate::run::executor::{EventTally, RunExecutor};
use crate::store::hierarchies::HierarchyRepository;
use crate::store::runs::{RunRecord, RunRepository, RunStatus, StatusChanges};
use crate::stream::StreamRegistry;

pub struct RunManager {
    runs: RunRepository,
    hierarchies: HierarchyRepository,
    sink: Arc<EventSink>,
    registry: Arc<StreamRegistry>,
    adapter: Arc<dyn AgentAdapter>,
    queue: mpsc::UnboundedSender<String>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl RunManager {
    /// Build the manager and spawn its worker pool.
    pub fn start(
        runs: RunRepository,
        hierarchies: HierarchyRepository,
        sink: Arc<EventSink>,
        registry: Arc<StreamRegistry>,
        adapter: Arc<dyn AgentAdapter>,
        worker_pool_size: usize,
    ) -> Arc<Self> {
        let (queue, queue_rx) = mpsc::unbounded_channel::<String>();
        let manager = Arc::new(Self {
            runs,
            hierarchies,
            sink,
            registry,
            adapter,
            queue,
            active: Mutex::new(HashMap::new()),
        });

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for worker in 0..worker_pool_size.max(1) {
            let manager = manager.clone();
            let queue_rx = queue_rx.clone();
            tokio::spawn(async move {
                loop {
                    let run_id = { queue_rx.lock().await.recv().await };
                    match run_id {
                        Some(run_id) => {
                            tracing::debug!(worker, run_id = %run_id, "worker picked up run");
                            manager.process(&run_id).await;
                        }
                        None => break,
                    }
                }
            });
        }
        manager
    }

    /// Create a run against a hierarchy and schedule it. The stream hub is
    /// open before this returns.
    pub fn start_run(&self, hierarchy_id: &str, task: &str) -> Result<RunRecord, ApiError> {
        let hierarchy = self
            .hierarchies
            .get(hierarchy_id)?
            .ok_or_else(|| ApiError::not_found(format!("Hierarchy '{hierarchy_id}' not found")))?;

        let run = self.runs.create(&hierarchy.id, task)?;
        let next_seq = self.sink.repository().max_sequence(&run.id)? + 1;
        self.registry.open(&run.id, next_seq)?;
        self.active
            .lock()
            .insert(run.id.clone(), CancellationToken::new());

        if self.queue.send(run.id.clone()).is_err() {
            // Worker pool is gone; roll the pre-opened hub back out.
            self.active.lock().remove(&run.id);
            self.registry.close(&run.id);
            return Err(ApiError::Persistence(anyhow::anyhow!(
                "Executor worker pool is not running"
            )));
        }

        tracing::info!(run_id = %run.id, hierarchy_id = %hierarchy.id, "run scheduled");
        Ok(run)
    }

    /// Set a run's cancellation flag. Returns false when this manager holds
    /// no executor state for the run (the caller then updates the store
    /// directly).
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.active.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Number of runs this manager currently owns (queued or executing).
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    async fn process(&self, run_id: &str) {
        let token = {
            let active = self.active.lock();
            active.get(run_id).cloned()
        };
        let Some(token) = token else {
            tracing::warn!(run_id = %run_id, "dequeued run with no cancellation state");
            return;
        };

        if token.is_cancelled() {
            self.finish_cancelled_before_start(run_id);
        } else {
            self.execute(run_id, token).await;
        }

        self.active.lock().remove(run_id);
        self.registry.close(run_id);
    }

    async fn execute(&self, run_id: &str, token: CancellationToken) {
        let run = match self.runs.get(run_id) {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::error!(run_id = %run_id, "scheduled run missing from store");
                return;
            }
            Err(error) => {
                tracing::error!(run_id = %run_id, %error, "failed to load scheduled run");
                return;
            }
        };
        if run.status != RunStatus::Pending {
            // Cancelled or repaired out-of-band between enqueue and pickup.
            tracing::warn!(run_id = %run_id, status = %run.status, "skipping non-pending run");
            return;
        }

        let hierarchy = match self.hierarchies.get(&run.hierarchy_id) {
            Ok(Some(hierarchy)) => hierarchy,
            Ok(None) => {
                self.fail_unstartable(
                    run_id,
                    &format!("Hierarchy '{}' disappeared before execution", run.hierarchy_id),
                );
                return;
            }
            Err(error) => {
                self.fail_unstartable(run_id, &format!("Failed to load hierarchy: {error}"));
                return;
            }
        };

        RunExecutor::new(
            run.id,
            run.task,
            hierarchy,
            self.runs.clone(),
            self.sink.clone(),
            self.registry.clone(),
            self.adapter.clone(),
            token,
        )
        .execute()
        .await;
    }

    /// Cancel arrived while the run was still queued: no started event, just
    /// the single terminal `lifecycle.cancelled`.
    fn finish_cancelled_before_start(&self, run_id: &str) {
        let mut tally = EventTally::default();
        match self.sink.emit(
            run_id,
            EventDraft::system(EventKind::LifecycleCancelled, serde_json::json!({})),
        ) {
            Ok(_) => tally.record(EventKind::LifecycleCancelled),
            Err(error) => {
                tracing::error!(run_id = %run_id, %error, "failed to persist pre-start cancellation");
            }
        }
        if let Err(error) = self.runs.update_status(
            run_id,
            RunStatus::Cancelled,
            StatusChanges {
                statistics: Some(tally.to_json()),
                ..StatusChanges::default()
            },
        ) {
            tracing::error!(run_id = %run_id, %error, "failed to mark run cancelled");
        }
        tracing::info!(run_id = %run_id, "run cancelled before start");
    }

    fn fail_unstartable(&self, run_id: &str, message: &str) {
        let mut tally = EventTally::default();
        for kind in [EventKind::SystemError, EventKind::LifecycleFailed] {
            let data = match kind {
                EventKind::SystemError => serde_json::json!({"message": message}),
                _ => serde_json::json!({"error": message}),
            };
            match self.sink.emit(run_id, EventDraft::system(kind, data)) {
                Ok(_) => tally.record(kind),
                Err(error) => {
                    tracing::error!(run_id = %run_id, %error, "failed to persist failure event");
                }
            }
        }
        if let Err(error) = self.runs.update_status(
            run_id,
            RunStatus::Failed,
            StatusChanges {
                error: Some(message.to_string()),
                statistics: Some(tally.to_json()),
                ..StatusChanges::default()
            },
        ) {
            tracing::error!(run_id = %run_id, %error, "failed to mark run failed");
        }
        tracing::warn!(run_id = %run_id, message, "run failed before execution");
    }
}
