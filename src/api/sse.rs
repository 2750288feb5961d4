//! `runs.stream` — long-lived SSE responses over a run's subscriber.
//!
//! Each request owns exactly one subscriber: a replay of persisted history
//! up to the attach point, then live events, framed as
//! `event: <category>.<action>` / `data: <wire json>` pairs.

use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;

use super::AppState;
use crate::error::ApiError;
use crate::event::RunEvent;

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    id: String,
}

pub async fn stream_run(
    State(state): State<AppState>,
    Json(body): Json<StreamRequest>,
) -> Result<Response, ApiError> {
    let Some(hub) = state.registry.get(&body.id) else {
        // No live window. Distinguish "never existed" from "already over";
        // terminated runs are served by the events endpoint instead.
        let run = state
            .runs
            .get(&body.id)?
            .ok_or_else(|| ApiError::not_found(format!("Run '{}' not found", body.id)))?;
        if run.status.is_terminal() {
            return Err(ApiError::conflict(format!(
                "Run ended with status {}",
                run.status
            )));
        }
        return Err(ApiError::not_found(format!(
            "Run '{}' has no active stream",
            body.id
        )));
    };

    let subscriber = hub.subscribe(&state.events)?;
    let stream = futures_util::stream::unfold(subscriber, |mut subscriber| async move {
        let event = subscriber.next().await?;
        Some((Ok::<Event, Infallible>(frame(&event)), subscriber))
    });

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

fn frame(event: &RunEvent) -> Event {
    Event::default()
        .event(event.kind.label())
        .data(event.to_wire().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentKind, EventKind, EventSource};
    use chrono::Utc;

    #[test]
    fn frame_uses_label_and_wire_json() {
        let event = RunEvent {
            id: "ev-1".into(),
            run_id: "r-1".into(),
            sequence: 2,
            timestamp: Utc::now(),
            source: Some(EventSource::new("gs", AgentKind::GlobalSupervisor, "Global")),
            kind: EventKind::LlmStream,
            data: serde_json::json!({"content": "hi"}),
        };
        // Event's builder API is opaque; round-trip through its Display-ed
        // wire form to check both fields landed.
        let rendered = format!("{:?}", frame(&event));
        assert!(rendered.contains("llm.stream"));
        assert!(rendered.contains("\\\"sequence\\\":2") || rendered.contains("\"sequence\":2"));
    }
}
