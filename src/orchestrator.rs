// src/orchestrator.rs — Conversation send loop
//
// Ties the runtime client, the durable store, and the auth layer together.
// One orchestrator owns the notion of "current session": sends are linked to
// it, and consecutive sends reuse it instead of creating fresh runtime
// sessions. Store writes on the send path are best-effort; a failed write is
// logged and the turn still completes with the runtime's reply.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::AuthTokenProvider;
use crate::infra::errors::DropchatError;
use crate::runtime::{resolve_stream, simulate_progress, step_label};
use crate::runtime::{AgentRuntime, SessionHandle};
use crate::store::{Message, NewMessage, Role, SessionStore};

pub struct SessionOrchestrator {
    runtime: Arc<dyn AgentRuntime>,
    store: Arc<SessionStore>,
    auth: Arc<dyn AuthTokenProvider>,
    streaming: bool,
    current_session: tokio::sync::Mutex<Option<String>>,
    transcript: tokio::sync::Mutex<Vec<Message>>,
}

impl SessionOrchestrator {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<SessionStore>,
        auth: Arc<dyn AuthTokenProvider>,
        streaming: bool,
    ) -> Self {
        Self {
            runtime,
            store,
            auth,
            streaming,
            current_session: tokio::sync::Mutex::new(None),
            transcript: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Send one user message through the current session and return the
    /// agent's reply as a persisted message.
    ///
    /// `on_progress` receives human-readable step labels as the workflow
    /// advances; each distinct label is delivered once. The caller shows and
    /// then removes its own progress placeholder around this call.
    pub async fn send<F>(
        &self,
        text: &str,
        mut on_progress: F,
    ) -> Result<Message, DropchatError>
    where
        F: FnMut(&str),
    {
        let user_id = self.auth.user_id().ok_or(DropchatError::Unauthenticated)?;

        let (session, fresh) = self.ensure_session(&user_id).await?;

        // History write is not on the critical path; the runtime call
        // proceeds even when the store is down.
        match self.store.append_message(&session.id, NewMessage::user(text)) {
            Ok(message) => self.transcript.lock().await.push(message),
            Err(e) => warn!(error = %e, "failed to persist user message"),
        }

        let stream = if self.streaming {
            self.runtime.stream_run(&session, &user_id, text).await?
        } else {
            simulate_progress(
                Arc::clone(&self.runtime),
                session.clone(),
                user_id.clone(),
                text.to_string(),
            )
        };

        let mut steps: Vec<String> = Vec::new();
        let reply = resolve_stream(stream, |event| {
            if let Some(label) = step_label(event) {
                if steps.last() != Some(&label) {
                    on_progress(&label);
                    steps.push(label);
                }
            }
        })
        .await?;

        let message = match self
            .store
            .append_message(&session.id, NewMessage::agent(&reply, steps.clone()))
        {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to persist agent reply");
                Message {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: session.id.clone(),
                    role: Role::Agent,
                    content: reply,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    workflow_steps: steps,
                }
            }
        };
        self.transcript.lock().await.push(message.clone());

        if fresh {
            let title = SessionStore::generate_title(text);
            if let Err(e) = self.store.rename_session(&session.id, &title) {
                warn!(error = %e, "failed to auto-title session");
            }
        }

        Ok(message)
    }

    /// The session the next send will use, creating one on first use.
    /// Returns whether the session was created by this call.
    async fn ensure_session(
        &self,
        user_id: &str,
    ) -> Result<(SessionHandle, bool), DropchatError> {
        let mut current = self.current_session.lock().await;
        if let Some(id) = current.as_ref() {
            return Ok((SessionHandle::new(id.clone()), false));
        }

        let handle = self.runtime.create_session(user_id).await?;
        debug!(session = %handle.id, "linked new runtime session");

        // Mirror into the store under the runtime's id before the first
        // message lands, so both sides name the conversation identically.
        if let Err(e) = self.store.create_session(user_id, None, Some(&handle.id)) {
            warn!(error = %e, "failed to mirror session into store");
        }

        *current = Some(handle.id.clone());
        Ok((handle, true))
    }

    /// Forget the current session. The next send starts a fresh one.
    pub async fn start_new_session(&self) {
        self.current_session.lock().await.take();
        self.transcript.lock().await.clear();
    }

    /// Point the orchestrator at an existing session. The caller loads the
    /// history (and its message feed) from the store separately.
    pub async fn set_current_session(&self, session_id: &str, history: Vec<Message>) {
        *self.current_session.lock().await = Some(session_id.to_string());
        *self.transcript.lock().await = history;
    }

    pub async fn current_session_id(&self) -> Option<String> {
        self.current_session.lock().await.clone()
    }

    pub async fn transcript(&self) -> Vec<Message> {
        self.transcript.lock().await.clone()
    }
}
