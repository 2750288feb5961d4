//! Deterministic scripted adapter.
//!
//! Drives executor tests and the out-of-the-box demo mode: each agent id is
//! bound to a fixed list of script steps. Agents without a script echo
//! their input, so a fresh install can run a hierarchy end-to-end with no
//! API key configured.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{AgentAdapter, AgentChunk, ChunkStream};
use crate::event::AgentKind;
use crate::hierarchy::AgentProfile;

/// One step of a scripted invocation.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield a chunk.
    Chunk(AgentChunk),
    /// Fail the stream with an adapter error.
    Fail(String),
    /// Pause before the next step.
    Sleep(Duration),
    /// Park until the cancellation signal fires, then end the stream
    /// without a `Final` chunk — an adapter honoring mid-stream cancel.
    WaitCancelled,
}

pub struct ScriptedAdapter {
    scripts: HashMap<String, Vec<ScriptStep>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
        }
    }

    /// Bind a chunk script to an agent id.
    pub fn script(mut self, agent_id: &str, steps: Vec<ScriptStep>) -> Self {
        self.scripts.insert(agent_id.to_string(), steps);
        self
    }

    /// Convenience: a script that streams `text` and finishes with it.
    pub fn echo_script(text: &str) -> Vec<ScriptStep> {
        vec![
            ScriptStep::Chunk(AgentChunk::Text(text.into())),
            ScriptStep::Chunk(AgentChunk::Final(text.into())),
        ]
    }

    fn steps_for(&self, agent: &AgentProfile, input: &str) -> Vec<ScriptStep> {
        if let Some(steps) = self.scripts.get(&agent.id) {
            return steps.clone();
        }
        // Unscripted agents echo, so demo hierarchies always terminate.
        let text = format!("[{}] {input}", agent.name);
        Self::echo_script(&text)
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        agent: &AgentProfile,
        _position: AgentKind,
        input: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let steps = self.steps_for(agent, input);
        let stream = futures_util::stream::unfold(
            (steps.into_iter(), cancel),
            |(mut steps, cancel)| async move {
                loop {
                    match steps.next()? {
                        ScriptStep::Chunk(chunk) => return Some((Ok(chunk), (steps, cancel))),
                        ScriptStep::Fail(message) => {
                            return Some((Err(anyhow::anyhow!(message)), (steps, cancel)));
                        }
                        ScriptStep::Sleep(duration) => {
                            tokio::time::sleep(duration).await;
                        }
                        ScriptStep::WaitCancelled => {
                            cancel.cancelled().await;
                            return None;
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}
