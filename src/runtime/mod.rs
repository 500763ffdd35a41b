// src/runtime/mod.rs — Agent runtime client layer

pub mod client;
pub mod events;
pub mod sse;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::infra::errors::DropchatError;

pub use client::HttpAgentRuntime;
pub use events::{display_agent_name, extract_reply, step_label, WorkflowEvent};

/// Reference to a conversation session on the remote runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Ordered stream of workflow events. The `Terminal` sentinel is always the
/// last item; `stream_run` and `simulate_progress` satisfy the same contract
/// so consumers need no branching between the two.
pub type WorkflowStream =
    Pin<Box<dyn Stream<Item = Result<WorkflowEvent, DropchatError>> + Send>>;

/// Core trait for the remote agent runtime.
///
/// Implementations must not retry internally: transport failures surface as
/// `RuntimeUnavailable` and the orchestrator decides what to do.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Create a new conversation session for `user_id`.
    async fn create_session(&self, user_id: &str) -> Result<SessionHandle, DropchatError>;

    /// Post a message over the synchronous endpoint and normalize the reply.
    async fn run(
        &self,
        session: &SessionHandle,
        user_id: &str,
        text: &str,
    ) -> Result<String, DropchatError>;

    /// Post a message over the streaming endpoint and return the event stream.
    async fn stream_run(
        &self,
        session: &SessionHandle,
        user_id: &str,
        text: &str,
    ) -> Result<WorkflowStream, DropchatError>;
}

/// Drain a workflow stream, forwarding every event to `on_event` in order.
///
/// Resolves to the terminal text, falling back to the last textual payload
/// seen when the stream ends without one (graceful degradation on streams
/// that close early or never send an explicit terminal marker).
pub async fn resolve_stream<F>(
    mut stream: WorkflowStream,
    mut on_event: F,
) -> Result<String, DropchatError>
where
    F: FnMut(&WorkflowEvent),
{
    let mut last_text: Option<String> = None;
    while let Some(event) = stream.next().await {
        let event = event?;
        on_event(&event);
        match event {
            WorkflowEvent::TextDelta { ref text, .. } if !text.is_empty() => {
                last_text = Some(text.clone());
            }
            WorkflowEvent::Terminal { text } => {
                return text.or(last_text).ok_or(DropchatError::NoContent);
            }
            _ => {}
        }
    }
    last_text.ok_or(DropchatError::NoContent)
}

/// The fixed agent pipeline announced by the simulated progress stream.
pub const SIMULATED_PIPELINE: &[&str] = &["guide_agent", "search_agent", "prompt_writer_agent"];

/// Delay between synthesized progress steps.
pub const SIMULATED_STEP_DELAY: Duration = Duration::from_millis(400);

/// Fallback progress path for backends that only expose the synchronous
/// endpoint. Emits the same event shapes as `stream_run`: a short fixed
/// sequence of "agent is working" steps, then one terminal event carrying
/// the result of `run`.
pub fn simulate_progress(
    runtime: Arc<dyn AgentRuntime>,
    session: SessionHandle,
    user_id: String,
    text: String,
) -> WorkflowStream {
    Box::pin(async_stream::stream! {
        for author in SIMULATED_PIPELINE {
            yield Ok(WorkflowEvent::TextDelta {
                author: (*author).to_string(),
                text: String::new(),
            });
            tokio::time::sleep(SIMULATED_STEP_DELAY).await;
        }
        match runtime.run(&session, &user_id, &text).await {
            Ok(reply) => yield Ok(WorkflowEvent::Terminal { text: Some(reply) }),
            Err(e) => yield Err(e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(events: Vec<Result<WorkflowEvent, DropchatError>>) -> WorkflowStream {
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn test_resolve_stream_terminal_text_wins() {
        let stream = stream_of(vec![
            Ok(WorkflowEvent::TextDelta {
                author: "a".into(),
                text: "draft".into(),
            }),
            Ok(WorkflowEvent::Terminal {
                text: Some("final".into()),
            }),
        ]);
        let out = resolve_stream(stream, |_| {}).await.unwrap();
        assert_eq!(out, "final");
    }

    #[tokio::test]
    async fn test_resolve_stream_falls_back_to_last_text() {
        let stream = stream_of(vec![
            Ok(WorkflowEvent::TextDelta {
                author: "a".into(),
                text: "only text seen".into(),
            }),
            Ok(WorkflowEvent::Terminal { text: None }),
        ]);
        let out = resolve_stream(stream, |_| {}).await.unwrap();
        assert_eq!(out, "only text seen");
    }

    #[tokio::test]
    async fn test_resolve_stream_empty_is_no_content() {
        let stream = stream_of(vec![Ok(WorkflowEvent::Terminal { text: None })]);
        let err = resolve_stream(stream, |_| {}).await.unwrap_err();
        assert!(matches!(err, DropchatError::NoContent));
    }

    #[tokio::test]
    async fn test_resolve_stream_forwards_in_order() {
        let stream = stream_of(vec![
            Ok(WorkflowEvent::FunctionCall {
                author: "a".into(),
                name: "search".into(),
                args: serde_json::Value::Null,
            }),
            Ok(WorkflowEvent::TextDelta {
                author: "a".into(),
                text: String::new(),
            }),
            Ok(WorkflowEvent::Terminal {
                text: Some("done".into()),
            }),
        ]);
        let mut seen = Vec::new();
        resolve_stream(stream, |ev| {
            seen.push(match ev {
                WorkflowEvent::FunctionCall { .. } => "call",
                WorkflowEvent::TextDelta { .. } => "delta",
                WorkflowEvent::Terminal { .. } => "terminal",
            });
        })
        .await
        .unwrap();
        assert_eq!(seen, vec!["call", "delta", "terminal"]);
    }
}
