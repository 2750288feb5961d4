//! OpenAI-compatible chat adapter.
//!
//! Speaks the `/v1/chat/completions` format most LLM APIs follow. One
//! invocation is one chat call: supervisors are offered the dispatch tools,
//! and the response's content / reasoning / tool calls are mapped onto the
//! chunk vocabulary. The cancellation signal races the HTTP request; a
//! cancelled invocation yields an empty, already-ended stream.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{
    stream_from_chunks, AgentAdapter, AgentChunk, ChunkStream, DISPATCH_TEAM_TOOL,
    DISPATCH_WORKER_TOOL,
};
use crate::config::AdapterConfig;
use crate::event::AgentKind;
use crate::hierarchy::AgentProfile;

pub struct CompatibleAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    temperature: f64,
}

impl CompatibleAdapter {
    pub fn new(config: &AdapterConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            default_model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    async fn chat(&self, request: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(request);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat API error ({status}): {error}");
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AgentAdapter for CompatibleAdapter {
    async fn invoke(
        &self,
        agent: &AgentProfile,
        position: AgentKind,
        input: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = if agent.agent.is_empty() {
            self.default_model.clone()
        } else {
            agent.agent.clone()
        };
        let mut request = json!({
            "model": model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system_prompt(agent, position)},
                {"role": "user", "content": input},
            ],
        });
        if let Some(tools) = dispatch_tools(position) {
            request["tools"] = tools;
        }

        let body = tokio::select! {
            () = cancel.cancelled() => return Ok(stream_from_chunks(Vec::new())),
            body = self.chat(&request) => body?,
        };
        Ok(stream_from_chunks(chunks_from_response(&body)))
    }
}

fn system_prompt(agent: &AgentProfile, position: AgentKind) -> String {
    let role = if agent.role.is_empty() {
        "general"
    } else {
        &agent.role
    };
    match position {
        AgentKind::GlobalSupervisor => format!(
            "You are {name}, the global supervisor of a hierarchical agent team \
             (role: {role}). Break the task down and delegate sub-tasks to teams \
             with the {DISPATCH_TEAM_TOOL} tool, then synthesize a final answer.",
            name = agent.name,
        ),
        AgentKind::TeamSupervisor => format!(
            "You are {name}, a team supervisor (role: {role}). Delegate sub-tasks \
             to your workers with the {DISPATCH_WORKER_TOOL} tool, then report a \
             consolidated result.",
            name = agent.name,
        ),
        AgentKind::Worker => format!(
            "You are {name}, a worker agent (role: {role}). Complete the task \
             directly and reply with your result.",
            name = agent.name,
        ),
    }
}

fn dispatch_tools(position: AgentKind) -> Option<Value> {
    let (tool, target_key, description) = match position {
        AgentKind::GlobalSupervisor => (
            DISPATCH_TEAM_TOOL,
            "team",
            "Hand a sub-task to one of your teams.",
        ),
        AgentKind::TeamSupervisor => (
            DISPATCH_WORKER_TOOL,
            "worker",
            "Hand a sub-task to one of your workers.",
        ),
        AgentKind::Worker => return None,
    };
    Some(json!([{
        "type": "function",
        "function": {
            "name": tool,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": {
                    target_key: {"type": "string", "description": "Target id or name"},
                    "instruction": {"type": "string", "description": "Sub-task to perform"},
                },
                "required": [target_key, "instruction"],
            },
        },
    }]))
}

/// Map one chat-completions response body onto the chunk vocabulary.
fn chunks_from_response(body: &Value) -> Vec<AgentChunk> {
    let mut chunks = Vec::new();
    let message = &body["choices"][0]["message"];

    if let Some(reasoning) = message["reasoning_content"].as_str() {
        if !reasoning.is_empty() {
            chunks.push(AgentChunk::Reasoning(reasoning.to_string()));
        }
    }

    let content = message["content"].as_str().unwrap_or("").to_string();
    if !content.is_empty() {
        chunks.push(AgentChunk::Text(content.clone()));
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for (index, call) in tool_calls.iter().enumerate() {
            let name = call["function"]["name"].as_str().unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            let call_id = call["id"]
                .as_str()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("call-{index}"));
            // Arguments arrive JSON-encoded in a string; keep the raw text
            // when it fails to parse so nothing is silently lost.
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments =
                serde_json::from_str(raw_args).unwrap_or_else(|_| Value::String(raw_args.into()));
            chunks.push(AgentChunk::ToolCall {
                call_id,
                name,
                arguments,
            });
        }
    }

    chunks.push(AgentChunk::Final(content));
    chunks
}
