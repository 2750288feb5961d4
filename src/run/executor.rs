//! Run executor — drives one run from `running` to a terminal state.
//!
//! Execution is sequential depth-first: the global supervisor's chunk stream
//! is consumed one chunk at a time; a `dispatch_team` tool call suspends it
//! while the team supervisor runs, whose `dispatch_worker` calls in turn
//! suspend it while a worker runs. Outputs flow back up as synthetic
//! `llm.tool_result` events. The cancellation flag is observed before every
//! emission and while awaiting every chunk, so at most one chunk is
//! processed after a cancel lands. Whatever path execution takes, the hub is
//! closed as the final step.

use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    parse_dispatch_args, AgentAdapter, AgentChunk, DISPATCH_TEAM_TOOL, DISPATCH_WORKER_TOOL,
};
use crate::event::sink::EventSink;
use crate::event::{AgentKind, EventCategory, EventDraft, EventKind, EventSource};
use crate::hierarchy::{AgentProfile, Hierarchy, Team};
use crate::store::runs::{RunRepository, RunStatus, StatusChanges};
use crate::stream::StreamRegistry;

/// Per-category event counts, stored on the run row at terminal transition.
#[derive(Debug, Default, Clone)]
pub struct EventTally {
    lifecycle: u64,
    llm: u64,
    dispatch: u64,
    system: u64,
}

impl EventTally {
    pub fn record(&mut self, kind: EventKind) {
        match kind.category() {
            EventCategory::Lifecycle => self.lifecycle += 1,
            EventCategory::Llm => self.llm += 1,
            EventCategory::Dispatch => self.dispatch += 1,
            EventCategory::System => self.system += 1,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "lifecycle": self.lifecycle,
            "llm": self.llm,
            "dispatch": self.dispatch,
            "system": self.system,
            "total": self.lifecycle + self.llm + self.dispatch + self.system,
        })
    }
}

/// Why the executor stopped driving forward.
enum ExecError {
    Cancelled,
    Adapter(anyhow::Error),
    Persist(anyhow::Error),
}

type ExecResult<T> = Result<T, ExecError>;

pub struct RunExecutor {
    run_id: String,
    task: String,
    hierarchy: Hierarchy,
    runs: RunRepository,
    sink: Arc<EventSink>,
    registry: Arc<StreamRegistry>,
    adapter: Arc<dyn AgentAdapter>,
    cancel: CancellationToken,
    tally: EventTally,
}

impl RunExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        task: String,
        hierarchy: Hierarchy,
        runs: RunRepository,
        sink: Arc<EventSink>,
        registry: Arc<StreamRegistry>,
        adapter: Arc<dyn AgentAdapter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            task,
            hierarchy,
            runs,
            sink,
            registry,
            adapter,
            cancel,
            tally: EventTally::default(),
        }
    }

    /// Drive the run to a terminal state. Never returns an error: every
    /// failure mode becomes a terminal status plus its lifecycle event.
    pub async fn execute(mut self) {
        tracing::info!(run_id = %self.run_id, "run executor starting");

        let outcome = match self.mark_running() {
            Ok(()) => self.drive().await,
            Err(e) => Err(ExecError::Persist(e)),
        };

        match outcome {
            Ok(result) => self.finish_completed(result),
            Err(ExecError::Cancelled) => self.finish_cancelled(),
            Err(ExecError::Adapter(error)) => self.finish_failed(error.to_string()),
            Err(ExecError::Persist(error)) => self.finish_failed(error.to_string()),
        }

        // Guaranteed-final: the hub goes away on every path, even when the
        // terminal emit itself failed.
        self.registry.close(&self.run_id);
    }

    fn mark_running(&self) -> anyhow::Result<()> {
        self.runs.update_status(
            &self.run_id,
            RunStatus::Running,
            StatusChanges {
                topology: Some(self.hierarchy.topology_snapshot()),
                ..StatusChanges::default()
            },
        )
    }

    async fn drive(&mut self) -> ExecResult<String> {
        let supervisor = self.hierarchy.supervisor.clone();
        let source = EventSource::new(&supervisor.id, AgentKind::GlobalSupervisor, &supervisor.name);

        self.emit(EventDraft::new(
            EventKind::LifecycleStarted,
            source.clone(),
            json!({"task": self.task}),
        ))?;
        self.emit(EventDraft::new(
            EventKind::SystemTopology,
            source.clone(),
            self.hierarchy.topology_snapshot(),
        ))?;

        let task = self.task.clone();
        self.run_global_supervisor(&supervisor, &source, &task).await
    }

    async fn run_global_supervisor(
        &mut self,
        supervisor: &AgentProfile,
        source: &EventSource,
        input: &str,
    ) -> ExecResult<String> {
        let mut stream = self
            .invoke(supervisor, AgentKind::GlobalSupervisor, input)
            .await?;
        let mut accumulated = String::new();
        let mut final_text = None;

        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Err(ExecError::Cancelled),
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(error)) => return Err(ExecError::Adapter(error)),
                },
            };
            match chunk {
                AgentChunk::ToolCall {
                    call_id,
                    name,
                    arguments,
                } if name == DISPATCH_TEAM_TOOL => {
                    self.emit(EventDraft::new(
                        EventKind::LlmToolCall,
                        source.clone(),
                        json!({"call_id": call_id, "name": name, "arguments": arguments.clone()}),
                    ))?;
                    let result = self.dispatch_team(source, &arguments).await?;
                    self.emit(EventDraft::new(
                        EventKind::LlmToolResult,
                        source.clone(),
                        json!({"call_id": call_id, "result": result}),
                    ))?;
                }
                other => self.emit_plain_chunk(source, other, &mut accumulated, &mut final_text)?,
            }
        }
        Ok(final_text.unwrap_or(accumulated))
    }

    async fn dispatch_team(
        &mut self,
        source: &EventSource,
        arguments: &serde_json::Value,
    ) -> ExecResult<serde_json::Value> {
        let Some(dispatch) = parse_dispatch_args(arguments) else {
            return self.dispatch_refused(source, "dispatch_team call without a team target");
        };
        let Some(team) = self.hierarchy.find_team(&dispatch.target).cloned() else {
            return self
                .dispatch_refused(source, &format!("unknown team '{}'", dispatch.target));
        };

        self.emit(EventDraft::new(
            EventKind::DispatchTeam,
            source.clone(),
            json!({
                "team_id": team.id,
                "team_name": team.name,
                "instruction": dispatch.instruction,
            }),
        ))?;

        let output = self.run_team(&team, &dispatch.instruction).await?;
        Ok(json!({"team": team.name, "output": output}))
    }

    async fn run_team(&mut self, team: &Team, instruction: &str) -> ExecResult<String> {
        let supervisor = team.supervisor.clone();
        let source = EventSource::new(&supervisor.id, AgentKind::TeamSupervisor, &supervisor.name)
            .in_team(&team.name);
        let mut stream = self
            .invoke(&supervisor, AgentKind::TeamSupervisor, instruction)
            .await?;
        let mut accumulated = String::new();
        let mut final_text = None;

        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Err(ExecError::Cancelled),
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(error)) => return Err(ExecError::Adapter(error)),
                },
            };
            match chunk {
                AgentChunk::ToolCall {
                    call_id,
                    name,
                    arguments,
                } if name == DISPATCH_WORKER_TOOL => {
                    self.emit(EventDraft::new(
                        EventKind::LlmToolCall,
                        source.clone(),
                        json!({"call_id": call_id, "name": name, "arguments": arguments.clone()}),
                    ))?;
                    let result = self.dispatch_worker(team, &source, &arguments).await?;
                    self.emit(EventDraft::new(
                        EventKind::LlmToolResult,
                        source.clone(),
                        json!({"call_id": call_id, "result": result}),
                    ))?;
                }
                other => self.emit_plain_chunk(&source, other, &mut accumulated, &mut final_text)?,
            }
        }
        Ok(final_text.unwrap_or(accumulated))
    }

    async fn dispatch_worker(
        &mut self,
        team: &Team,
        source: &EventSource,
        arguments: &serde_json::Value,
    ) -> ExecResult<serde_json::Value> {
        let Some(dispatch) = parse_dispatch_args(arguments) else {
            return self.dispatch_refused(source, "dispatch_worker call without a worker target");
        };
        let Some(worker) = team.find_worker(&dispatch.target).cloned() else {
            return self.dispatch_refused(
                source,
                &format!("unknown worker '{}' in team '{}'", dispatch.target, team.name),
            );
        };

        self.emit(EventDraft::new(
            EventKind::DispatchWorker,
            source.clone(),
            json!({
                "worker_id": worker.id,
                "worker_name": worker.name,
                "team_name": team.name,
                "instruction": dispatch.instruction,
            }),
        ))?;

        let output = self
            .run_worker(team, &worker, &dispatch.instruction)
            .await?;
        Ok(json!({"worker": worker.name, "output": output}))
    }

    async fn run_worker(
        &mut self,
        team: &Team,
        worker: &AgentProfile,
        instruction: &str,
    ) -> ExecResult<String> {
        let source =
            EventSource::new(&worker.id, AgentKind::Worker, &worker.name).in_team(&team.name);
        let mut stream = self.invoke(worker, AgentKind::Worker, instruction).await?;
        let mut accumulated = String::new();
        let mut final_text = None;

        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Err(ExecError::Cancelled),
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(error)) => return Err(ExecError::Adapter(error)),
                },
            };
            self.emit_plain_chunk(&source, chunk, &mut accumulated, &mut final_text)?;
        }
        Ok(final_text.unwrap_or(accumulated))
    }

    async fn invoke(
        &self,
        agent: &AgentProfile,
        position: AgentKind,
        input: &str,
    ) -> ExecResult<crate::adapter::ChunkStream> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        self.adapter
            .invoke(agent, position, input, self.cancel.clone())
            .await
            .map_err(ExecError::Adapter)
    }

    /// Emit a non-dispatch chunk. `Final` chunks become the invocation's
    /// result rather than an event.
    fn emit_plain_chunk(
        &mut self,
        source: &EventSource,
        chunk: AgentChunk,
        accumulated: &mut String,
        final_text: &mut Option<String>,
    ) -> ExecResult<()> {
        match chunk {
            AgentChunk::Text(content) => {
                accumulated.push_str(&content);
                self.emit(EventDraft::new(
                    EventKind::LlmStream,
                    source.clone(),
                    json!({"content": content}),
                ))
            }
            AgentChunk::Reasoning(content) => self.emit(EventDraft::new(
                EventKind::LlmReasoning,
                source.clone(),
                json!({"content": content}),
            )),
            AgentChunk::ToolCall {
                call_id,
                name,
                arguments,
            } => self.emit(EventDraft::new(
                EventKind::LlmToolCall,
                source.clone(),
                json!({"call_id": call_id, "name": name, "arguments": arguments}),
            )),
            AgentChunk::ToolResult { call_id, result } => self.emit(EventDraft::new(
                EventKind::LlmToolResult,
                source.clone(),
                json!({"call_id": call_id, "result": result}),
            )),
            AgentChunk::Final(text) => {
                *final_text = Some(text);
                Ok(())
            }
        }
    }

    /// A malformed or untargeted dispatch does not kill the run; the
    /// supervisor gets an error result and the stream records a warning.
    fn dispatch_refused(
        &mut self,
        source: &EventSource,
        message: &str,
    ) -> ExecResult<serde_json::Value> {
        tracing::warn!(run_id = %self.run_id, message, "dispatch refused");
        self.emit(EventDraft::new(
            EventKind::SystemWarning,
            source.clone(),
            json!({"message": message}),
        ))?;
        Ok(json!({"error": message}))
    }

    /// Cancellation-checked emit used on the forward path.
    fn emit(&mut self, draft: EventDraft) -> ExecResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        self.emit_terminal(draft).map_err(ExecError::Persist)
    }

    /// Unchecked emit used for terminal lifecycle events, which must go out
    /// even when the cancel flag is set.
    fn emit_terminal(&mut self, draft: EventDraft) -> anyhow::Result<()> {
        let kind = draft.kind;
        self.sink.emit(&self.run_id, draft)?;
        self.tally.record(kind);
        Ok(())
    }

    fn supervisor_source(&self) -> EventSource {
        EventSource::new(
            &self.hierarchy.supervisor.id,
            AgentKind::GlobalSupervisor,
            &self.hierarchy.supervisor.name,
        )
    }

    fn finish_completed(&mut self, result: String) {
        let emitted = self.emit_terminal(EventDraft::new(
            EventKind::LifecycleCompleted,
            self.supervisor_source(),
            json!({"result": result}),
        ));
        if let Err(error) = emitted {
            // The run did complete its work, but its completion cannot be
            // recorded durably; surface it as failed rather than lie.
            tracing::error!(run_id = %self.run_id, %error, "failed to persist completion event");
            self.finish_failed(format!("failed to persist completion: {error}"));
            return;
        }
        self.update_run(
            RunStatus::Completed,
            StatusChanges {
                result: Some(result),
                statistics: Some(self.tally.to_json()),
                ..StatusChanges::default()
            },
        );
        tracing::info!(run_id = %self.run_id, "run completed");
    }

    fn finish_cancelled(&mut self) {
        if let Err(error) = self.emit_terminal(EventDraft::new(
            EventKind::LifecycleCancelled,
            self.supervisor_source(),
            json!({}),
        )) {
            tracing::error!(run_id = %self.run_id, %error, "failed to persist cancellation event");
        }
        self.update_run(
            RunStatus::Cancelled,
            StatusChanges {
                statistics: Some(self.tally.to_json()),
                ..StatusChanges::default()
            },
        );
        tracing::info!(run_id = %self.run_id, "run cancelled");
    }

    fn finish_failed(&mut self, error: String) {
        // Both events are best-effort: a dead store must not stop the
        // status update attempt below.
        if let Err(emit_error) = self.emit_terminal(EventDraft::new(
            EventKind::SystemError,
            self.supervisor_source(),
            json!({"message": error.clone()}),
        )) {
            tracing::error!(run_id = %self.run_id, %emit_error, "failed to persist error event");
        }
        if let Err(emit_error) = self.emit_terminal(EventDraft::new(
            EventKind::LifecycleFailed,
            self.supervisor_source(),
            json!({"error": error.clone()}),
        )) {
            tracing::error!(run_id = %self.run_id, %emit_error, "failed to persist failure event");
        }
        self.update_run(
            RunStatus::Failed,
            StatusChanges {
                error: Some(error.clone()),
                statistics: Some(self.tally.to_json()),
                ..StatusChanges::default()
            },
        );
        tracing::warn!(run_id = %self.run_id, error = %error, "run failed");
    }

    fn update_run(&self, status: RunStatus, changes: StatusChanges) {
        if let Err(error) = self.runs.update_status(&self.run_id, status, changes) {
            tracing::error!(run_id = %self.run_id, %error, "failed to update run status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::scripted::{ScriptStep, ScriptedAdapter};
    use crate::store::events::EventRepository;
    use crate::store::Db;

    fn agent(id: &str, name: &str) -> AgentProfile {
        AgentProfile {
            id: id.into(),
            name: name.into(),
            role: String::new(),
            agent: String::new(),
        }
    }

    fn hierarchy() -> Hierarchy {
        Hierarchy {
            id: "h-1".into(),
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

    struct Fixture {
        runs: RunRepository,
        events: EventRepository,
        sink: Arc<EventSink>,
        registry: Arc<StreamRegistry>,
    }

    fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap();
        let runs = RunRepository::new(db.clone());
        let events = EventRepository::new(db);
        let registry = Arc::new(StreamRegistry::new(64));
        let sink = Arc::new(EventSink::new(events.clone(), registry.clone()));
        Fixture {
            runs,
            events,
            sink,
            registry,
        }
    }

    async fn run_with(
        fx: &Fixture,
        adapter: ScriptedAdapter,
        cancel: CancellationToken,
    ) -> crate::store::runs::RunRecord {
        let run = fx.runs.create("h-1", "T").unwrap();
        fx.registry.open(&run.id, 1).unwrap();
        let executor = RunExecutor::new(
            run.id.clone(),
            run.task.clone(),
            hierarchy(),
            fx.runs.clone(),
            fx.sink.clone(),
            fx.registry.clone(),
            Arc::new(adapter),
            cancel,
        );
        executor.execute().await;
        fx.runs.get(&run.id).unwrap().unwrap()
    }

    fn labels(fx: &Fixture, run_id: &str) -> Vec<String> {
        fx.events
            .list(run_id)
            .unwrap()
            .iter()
            .map(|e| e.kind.label())
            .collect()
    }

    fn happy_path_adapter() -> ScriptedAdapter {
        ScriptedAdapter::new()
            .script(
                "gs",
                vec![
                    ScriptStep::Chunk(AgentChunk::Text("plan".into())),
                    ScriptStep::Chunk(AgentChunk::ToolCall {
                        call_id: "c-1".into(),
                        name: DISPATCH_TEAM_TOOL.into(),
                        arguments: serde_json::json!({"team": "t-1", "instruction": "do it"}),
                    }),
                    ScriptStep::Chunk(AgentChunk::Final("result: done".into())),
                ],
            )
            .script(
                "ts",
                vec![
                    ScriptStep::Chunk(AgentChunk::ToolCall {
                        call_id: "c-2".into(),
                        name: DISPATCH_WORKER_TOOL.into(),
                        arguments: serde_json::json!({"worker": "w", "instruction": "do it"}),
                    }),
                    ScriptStep::Chunk(AgentChunk::Final("done".into())),
                ],
            )
            .script(
                "w",
                vec![
                    ScriptStep::Chunk(AgentChunk::Text("done".into())),
                    ScriptStep::Chunk(AgentChunk::Final("done".into())),
                ],
            )
    }

    #[tokio::test]
    async fn happy_path_event_order_and_result() {
        let fx = fixture();
        let run = run_with(&fx, happy_path_adapter(), CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("result: done"));
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
        assert!(run.topology.is_some());

        assert_eq!(
            labels(&fx, &run.id),
            vec![
                "lifecycle.started",
                "system.topology",
                "llm.stream",
                "llm.tool_call",
                "dispatch.team",
                "llm.tool_call",
                "dispatch.worker",
                "llm.stream",
                "llm.tool_result",
                "llm.tool_result",
                "lifecycle.completed",
            ]
        );

        let events = fx.events.list(&run.id).unwrap();
        // Sequences are gapless 1..N
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=11).collect::<Vec<u64>>());
        // Completed event carries the stored result
        assert_eq!(events.last().unwrap().data["result"], "result: done");
        // Hub is gone after terminal
        assert!(!fx.registry.contains(&run.id));
        // Statistics count every category
        let stats = run.statistics.unwrap();
        assert_eq!(stats["total"], 11);
        assert_eq!(stats["lifecycle"], 2);
        assert_eq!(stats["dispatch"], 2);
    }

    #[tokio::test]
    async fn worker_error_fails_run_with_error_events() {
        let fx = fixture();
        let adapter = ScriptedAdapter::new()
            .script(
                "gs",
                vec![
                    ScriptStep::Chunk(AgentChunk::ToolCall {
                        call_id: "c-1".into(),
                        name: DISPATCH_TEAM_TOOL.into(),
                        arguments: serde_json::json!({"team": "t-1", "instruction": "go"}),
                    }),
                    ScriptStep::Chunk(AgentChunk::Final("unreached".into())),
                ],
            )
            .script(
                "ts",
                vec![
                    ScriptStep::Chunk(AgentChunk::ToolCall {
                        call_id: "c-2".into(),
                        name: DISPATCH_WORKER_TOOL.into(),
                        arguments: serde_json::json!({"worker": "w", "instruction": "go"}),
                    }),
                    ScriptStep::Chunk(AgentChunk::Final("unreached".into())),
                ],
            )
            .script(
                "w",
                vec![
                    ScriptStep::Chunk(AgentChunk::Text("partial".into())),
                    ScriptStep::Fail("model overloaded".into()),
                ],
            );
        let run = run_with(&fx, adapter, CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("model overloaded"));
        let tail: Vec<String> = labels(&fx, &run.id).into_iter().rev().take(3).collect();
        assert_eq!(tail, vec!["lifecycle.failed", "system.error", "llm.stream"]);
    }

    #[tokio::test]
    async fn cancellation_mid_worker_stream() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let adapter = ScriptedAdapter::new()
            .script(
                "gs",
                vec![
                    ScriptStep::Chunk(AgentChunk::ToolCall {
                        call_id: "c-1".into(),
                        name: DISPATCH_TEAM_TOOL.into(),
                        arguments: serde_json::json!({"team": "t-1", "instruction": "go"}),
                    }),
                    ScriptStep::Chunk(AgentChunk::Final("unreached".into())),
                ],
            )
            .script(
                "ts",
                vec![
                    ScriptStep::Chunk(AgentChunk::ToolCall {
                        call_id: "c-2".into(),
                        name: DISPATCH_WORKER_TOOL.into(),
                        arguments: serde_json::json!({"worker": "w", "instruction": "go"}),
                    }),
                    ScriptStep::Chunk(AgentChunk::Final("unreached".into())),
                ],
            )
            .script(
                "w",
                vec![
                    ScriptStep::Chunk(AgentChunk::Text("part 1".into())),
                    ScriptStep::WaitCancelled,
                    ScriptStep::Chunk(AgentChunk::Text("never".into())),
                ],
            );

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let run = run_with(&fx, adapter, cancel).await;

        assert_eq!(run.status, RunStatus::Cancelled);
        let labels = labels(&fx, &run.id);
        assert_eq!(labels.last().unwrap(), "lifecycle.cancelled");
        assert_eq!(
            labels.iter().filter(|l| *l == "lifecycle.cancelled").count(),
            1
        );
        // Nothing after the worker's first chunk made it out
        assert!(!labels.contains(&"lifecycle.completed".to_string()));
    }

    #[tokio::test]
    async fn unknown_team_warns_and_continues() {
        let fx = fixture();
        let adapter = ScriptedAdapter::new().script(
            "gs",
            vec![
                ScriptStep::Chunk(AgentChunk::ToolCall {
                    call_id: "c-1".into(),
                    name: DISPATCH_TEAM_TOOL.into(),
                    arguments: serde_json::json!({"team": "nope", "instruction": "go"}),
                }),
                ScriptStep::Chunk(AgentChunk::Final("fallback answer".into())),
            ],
        );
        let run = run_with(&fx, adapter, CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("fallback answer"));
        let labels = labels(&fx, &run.id);
        assert!(labels.contains(&"system.warning".to_string()));
        assert!(!labels.contains(&"dispatch.team".to_string()));
    }

    #[tokio::test]
    async fn tool_result_chunks_are_emitted() {
        let fx = fixture();
        let adapter = ScriptedAdapter::new().script(
            "gs",
            vec![
                ScriptStep::Chunk(AgentChunk::ToolCall {
                    call_id: "c-9".into(),
                    name: "web_search".into(),
                    arguments: serde_json::json!({"query": "rust"}),
                }),
                ScriptStep::Chunk(AgentChunk::ToolResult {
                    call_id: "c-9".into(),
                    result: serde_json::json!({"hits": 3}),
                }),
                ScriptStep::Chunk(AgentChunk::Final("found".into())),
            ],
        );
        let run = run_with(&fx, adapter, CancellationToken::new()).await;
        let labels = labels(&fx, &run.id);
        assert!(labels.contains(&"llm.tool_call".to_string()));
        assert!(labels.contains(&"llm.tool_result".to_string()));
        // A non-dispatch tool call does not produce dispatch events
        assert!(!labels.contains(&"dispatch.team".to_string()));
    }

    #[test]
    fn tally_counts_by_category() {
        let mut tally = EventTally::default();
        tally.record(EventKind::LifecycleStarted);
        tally.record(EventKind::LlmStream);
        tally.record(EventKind::LlmStream);
        tally.record(EventKind::DispatchTeam);
        tally.record(EventKind::SystemTopology);
        let json = tally.to_json();
        assert_eq!(json["lifecycle"], 1);
        assert_eq!(json["llm"], 2);
        assert_eq!(json["dispatch"], 1);
        assert_eq!(json["system"], 1);
        assert_eq!(json["total"], 5);
    }
}
