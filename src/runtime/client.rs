// src/runtime/client.rs — HTTP client for the agent runtime

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::events::extract_reply;
use super::sse::SseDecoder;
use super::{AgentRuntime, SessionHandle, WorkflowEvent, WorkflowStream};
use crate::auth::AuthTokenProvider;
use crate::infra::config::RuntimeConfig;
use crate::infra::errors::DropchatError;

/// Client for the remote agent runtime's HTTP surface.
///
/// Every request carries a bearer credential from the auth provider. No call
/// retries internally; failures propagate for the orchestrator to handle.
pub struct HttpAgentRuntime {
    base_url: String,
    app_name: String,
    auth: Arc<dyn AuthTokenProvider>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RuntimeSession {
    id: String,
}

impl HttpAgentRuntime {
    pub fn new(config: &RuntimeConfig, auth: Arc<dyn AuthTokenProvider>) -> Self {
        Self::from_parts(&config.base_url, &config.app_name, auth)
    }

    pub fn from_parts(
        base_url: &str,
        app_name: &str,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            app_name: app_name.to_string(),
            auth,
            client: reqwest::Client::new(),
        }
    }

    fn sessions_url(&self, user_id: &str) -> String {
        format!(
            "{}/apps/{}/users/{}/sessions",
            self.base_url, self.app_name, user_id
        )
    }

    fn run_body(&self, session: &SessionHandle, user_id: &str, text: &str) -> Value {
        json!({
            "app_name": self.app_name,
            "user_id": user_id,
            "session_id": session.id,
            "new_message": {
                "role": "user",
                "parts": [{ "text": text }],
            },
        })
    }

    fn transport(err: reqwest::Error) -> DropchatError {
        DropchatError::RuntimeUnavailable(err.to_string())
    }

    /// Sessions known to the runtime for this user. The durable history in
    /// `SessionStore` is the source of truth for the UI; this is the remote
    /// side of the same collection.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionHandle>, DropchatError> {
        let token = self.auth.bearer_token().await?;
        let sessions: Vec<RuntimeSession> = self
            .client
            .get(self.sessions_url(user_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?
            .json()
            .await
            .map_err(Self::transport)?;
        Ok(sessions
            .into_iter()
            .map(|s| SessionHandle::new(s.id))
            .collect())
    }

    /// Delete a session on the runtime side.
    pub async fn delete_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), DropchatError> {
        let token = self.auth.bearer_token().await?;
        self.client
            .delete(format!("{}/{}", self.sessions_url(user_id), session_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?;
        Ok(())
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn create_session(&self, user_id: &str) -> Result<SessionHandle, DropchatError> {
        let token = self.auth.bearer_token().await?;
        let created: CreatedSession = self
            .client
            .post(self.sessions_url(user_id))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?
            .json()
            .await
            .map_err(Self::transport)?;
        debug!(session = %created.id, "created runtime session");
        Ok(SessionHandle::new(created.id))
    }

    async fn run(
        &self,
        session: &SessionHandle,
        user_id: &str,
        text: &str,
    ) -> Result<String, DropchatError> {
        let token = self.auth.bearer_token().await?;
        let value: Value = self
            .client
            .post(format!("{}/run", self.base_url))
            .bearer_auth(token)
            .json(&self.run_body(session, user_id, text))
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?
            .json()
            .await
            .map_err(Self::transport)?;
        extract_reply(&value)
    }

    async fn stream_run(
        &self,
        session: &SessionHandle,
        user_id: &str,
        text: &str,
    ) -> Result<WorkflowStream, DropchatError> {
        let token = self.auth.bearer_token().await?;
        let response = self
            .client
            .post(format!("{}/run_sse", self.base_url))
            .bearer_auth(token)
            .json(&self.run_body(session, user_id, text))
            .send()
            .await
            .map_err(Self::transport)?
            .error_for_status()
            .map_err(Self::transport)?;

        let mut body = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in decoder.push(&bytes) {
                            let terminal = matches!(event, WorkflowEvent::Terminal { .. });
                            yield Ok(event);
                            if terminal {
                                // Resolve immediately; the connection may
                                // still be open behind us.
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(DropchatError::RuntimeUnavailable(e.to_string()));
                        return;
                    }
                }
            }
            if let Some(event) = decoder.finish() {
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }
}
