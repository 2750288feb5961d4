//! Agent invocation adapters.
//!
//! An adapter turns `(agent definition, input text, cancellation signal)`
//! into a lazy, finite, non-restartable stream of chunks. The executor only
//! relies on "next chunk / ended / errored"; when the cancellation signal
//! fires the adapter must end its stream promptly, with no `Final` chunk
//! required.

pub mod compatible;
pub mod scripted;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::event::AgentKind;
use crate::hierarchy::AgentProfile;

/// Tool name a global supervisor uses to hand a sub-task to a team.
pub const DISPATCH_TEAM_TOOL: &str = "dispatch_team";
/// Tool name a team supervisor uses to hand a sub-task to a worker.
pub const DISPATCH_WORKER_TOOL: &str = "dispatch_worker";

/// One unit of adapter output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentChunk {
    /// Delta of the agent's visible output.
    Text(String),
    /// Delta of inner reasoning.
    Reasoning(String),
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        result: serde_json::Value,
    },
    /// Accumulated final text; always the last chunk of an uncancelled,
    /// successful invocation.
    Final(String),
}

pub type ChunkStream = BoxStream<'static, anyhow::Result<AgentChunk>>;

#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentProfile,
        position: AgentKind,
        input: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream>;
}

/// A finished chunk list as a stream (for adapters that produce everything
/// up front).
pub fn stream_from_chunks(chunks: Vec<AgentChunk>) -> ChunkStream {
    futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// Target and instruction extracted from a `dispatch_team` /
/// `dispatch_worker` tool call's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub target: String,
    pub instruction: String,
}

/// Pull the dispatch target out of tool-call arguments. Accepts the key
/// aliases different models produce (`team`/`worker`/`target`/`name`, and
/// `instruction`/`task`/`input`).
pub fn parse_dispatch_args(arguments: &serde_json::Value) -> Option<DispatchTarget> {
    let target = ["team", "worker", "target", "name"]
        .iter()
        .find_map(|key| arguments.get(key).and_then(|v| v.as_str()))?;
    let instruction = ["instruction", "task", "input"]
        .iter()
        .find_map(|key| arguments.get(key).and_then(|v| v.as_str()))
        .unwrap_or("");
    Some(DispatchTarget {
        target: target.to_string(),
        instruction: instruction.to_string(),
    })
}
