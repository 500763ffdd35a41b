// src/store/mod.rs — Durable session/message store with realtime listeners
//
// SQLite-backed persistence for conversations plus an in-process notify-on-
// change surface: one live message listener at most, torn down synchronously
// before the next one is created, so switching sessions can never deliver a
// stale update into the new session's view.

pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::infra::errors::DropchatError;

/// Sessions returned by `list_sessions` are capped to the most recent N.
pub const SESSION_LIST_LIMIT: usize = 50;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
    /// Transient progress placeholder. UI-only; never persisted.
    Progress,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::System => "system",
            Role::Progress => "progress",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "agent" => Some(Role::Agent),
            "system" => Some(Role::System),
            "progress" => Some(Role::Progress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
    pub last_message_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    pub workflow_steps: Vec<String>,
}

/// Payload for `append_message`: everything but the fields the store assigns.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub workflow_steps: Vec<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            workflow_steps: Vec::new(),
        }
    }

    pub fn agent(content: impl Into<String>, workflow_steps: Vec<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
            workflow_steps,
        }
    }
}

/// Receiving end of the per-session message subscription. Dropped (or
/// replaced store-side) when the session is switched.
#[derive(Debug)]
pub struct MessageFeed {
    rx: UnboundedReceiver<Message>,
}

impl MessageFeed {
    /// Next appended message, or `None` once the subscription is torn down.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Receiving end of the per-owner session-list subscription. Each change
/// delivers a fresh ordered snapshot.
pub struct SessionFeed {
    rx: UnboundedReceiver<Vec<Session>>,
}

impl SessionFeed {
    pub async fn recv(&mut self) -> Option<Vec<Session>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<Session>> {
        self.rx.try_recv().ok()
    }
}

struct MessageListenerHandle {
    session_id: String,
    tx: UnboundedSender<Message>,
}

struct SessionListenerHandle {
    owner_id: String,
    tx: UnboundedSender<Vec<Session>>,
}

pub struct SessionStore {
    conn: Mutex<Connection>,
    message_listener: Mutex<Option<MessageListenerHandle>>,
    session_listeners: Mutex<Vec<SessionListenerHandle>>,
}

impl SessionStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::run_migrations(&conn)?;
        Ok(Self::with_connection(conn))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            message_listener: Mutex::new(None),
            session_listeners: Mutex::new(Vec::new()),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DropchatError> {
        self.conn
            .lock()
            .map_err(|_| DropchatError::StoreUnavailable("store mutex poisoned".into()))
    }

    /// Create a session record. When `external_id` is supplied (the id the
    /// remote runtime assigned), the record uses that same id so the two
    /// never diverge for one conversation.
    pub fn create_session(
        &self,
        owner_id: &str,
        title: Option<&str>,
        external_id: Option<&str>,
    ) -> Result<Session, DropchatError> {
        let now = Utc::now().timestamp_millis();
        let session = Session {
            id: external_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: owner_id.to_string(),
            title: title.map(str::to_string).unwrap_or_else(|| {
                format!("New Session {}", Utc::now().format("%Y-%m-%d"))
            }),
            created_at: now,
            updated_at: now,
            message_count: 0,
            last_message_preview: String::new(),
        };

        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO sessions (id, owner_id, title, created_at, updated_at,
                 message_count, last_message_preview)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, '')",
                params![
                    session.id,
                    session.owner_id,
                    session.title,
                    session.created_at,
                    session.updated_at
                ],
            )?;
        }

        self.notify_sessions(owner_id);
        Ok(session)
    }

    /// Load a session with its full message history and subscribe to it.
    ///
    /// Any previously active message listener is torn down first, before the
    /// read and before the new subscription exists, so a late update from
    /// the old session can never reach the new feed.
    pub fn load_session(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> Result<(Session, Vec<Message>, MessageFeed), DropchatError> {
        self.dispose_message_listener()?;

        let (session, messages) = {
            let conn = self.conn()?;
            let session = conn
                .query_row(
                    "SELECT id, owner_id, title, created_at, updated_at,
                     message_count, last_message_preview
                     FROM sessions WHERE id = ?1 AND owner_id = ?2",
                    params![session_id, owner_id],
                    session_from_row,
                )
                .optional()?
                .ok_or_else(|| {
                    DropchatError::StoreUnavailable(format!("session {session_id} not found"))
                })?;

            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, timestamp, workflow_steps
                 FROM messages WHERE session_id = ?1
                 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let messages = stmt
                .query_map(params![session_id], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            (session, messages)
        };

        let (tx, rx) = unbounded_channel();
        *self
            .message_listener
            .lock()
            .map_err(|_| DropchatError::StoreUnavailable("listener mutex poisoned".into()))? =
            Some(MessageListenerHandle {
                session_id: session_id.to_string(),
                tx,
            });

        debug!(session = %session_id, messages = messages.len(), "session loaded");
        Ok((session, messages, MessageFeed { rx }))
    }

    /// Drop the active message subscription, if any. The old feed sees
    /// end-of-stream; nothing can be delivered through it afterwards.
    pub fn dispose_message_listener(&self) -> Result<(), DropchatError> {
        self.message_listener
            .lock()
            .map_err(|_| DropchatError::StoreUnavailable("listener mutex poisoned".into()))?
            .take();
        Ok(())
    }

    /// Append a message and recompute the session's denormalized fields in
    /// one transaction: readers see both the message and the updated
    /// metadata, or neither.
    pub fn append_message(
        &self,
        session_id: &str,
        new: NewMessage,
    ) -> Result<Message, DropchatError> {
        if new.role == Role::Progress {
            return Err(DropchatError::InvalidMessage(
                "progress messages are transient and never persisted".into(),
            ));
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: new.role,
            content: new.content,
            timestamp: Utc::now().timestamp_millis(),
            workflow_steps: new.workflow_steps,
        };

        let owner_id = {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let owner_id: Option<String> = tx
                .query_row(
                    "SELECT owner_id FROM sessions WHERE id = ?1",
                    params![session_id],
                    |r| r.get(0),
                )
                .optional()?;
            let owner_id = owner_id.ok_or_else(|| {
                DropchatError::StoreUnavailable(format!("session {session_id} not found"))
            })?;

            let steps_json = if message.workflow_steps.is_empty() {
                None
            } else {
                serde_json::to_string(&message.workflow_steps).ok()
            };
            tx.execute(
                "INSERT INTO messages (id, session_id, role, content, timestamp, workflow_steps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    message.session_id,
                    message.role.as_str(),
                    message.content,
                    message.timestamp,
                    steps_json
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET updated_at = ?1,
                 message_count = message_count + 1,
                 last_message_preview = ?2
                 WHERE id = ?3",
                params![message.timestamp, preview(&message.content), session_id],
            )?;
            tx.commit()?;
            owner_id
        };

        self.notify_message(&message);
        self.notify_sessions(&owner_id);
        Ok(message)
    }

    pub fn rename_session(&self, session_id: &str, title: &str) -> Result<(), DropchatError> {
        let owner_id = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE sessions SET title = ?1 WHERE id = ?2",
                params![title, session_id],
            )?;
            conn.query_row(
                "SELECT owner_id FROM sessions WHERE id = ?1",
                params![session_id],
                |r| r.get::<_, String>(0),
            )
            .optional()?
        };
        if let Some(owner_id) = owner_id {
            self.notify_sessions(&owner_id);
        }
        Ok(())
    }

    /// Delete a session and everything in it. Messages go first, then the
    /// session record, in one transaction, so a session never outlives its
    /// messages only partially deleted.
    pub fn delete_session(&self, session_id: &str) -> Result<(), DropchatError> {
        // If the live subscription targets this session, it dies with it.
        if let Ok(mut active) = self.message_listener.lock() {
            if active
                .as_ref()
                .is_some_and(|h| h.session_id == session_id)
            {
                active.take();
            }
        }

        let owner_id = {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let owner_id: Option<String> = tx
                .query_row(
                    "SELECT owner_id FROM sessions WHERE id = ?1",
                    params![session_id],
                    |r| r.get(0),
                )
                .optional()?;
            tx.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session_id],
            )?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            tx.commit()?;
            owner_id
        };

        if let Some(owner_id) = owner_id {
            self.notify_sessions(&owner_id);
        }
        Ok(())
    }

    /// Sessions for an owner, most recently updated first, bounded to the
    /// most recent `SESSION_LIST_LIMIT`.
    pub fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>, DropchatError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, title, created_at, updated_at,
             message_count, last_message_preview
             FROM sessions WHERE owner_id = ?1
             ORDER BY updated_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let sessions = stmt
            .query_map(params![owner_id, SESSION_LIST_LIMIT as i64], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Subscribe to the owner's session list. Delivers the current snapshot
    /// immediately, then a fresh snapshot on every change.
    pub fn subscribe_sessions(&self, owner_id: &str) -> Result<SessionFeed, DropchatError> {
        let (tx, rx) = unbounded_channel();
        let _ = tx.send(self.list_sessions(owner_id)?);
        self.session_listeners
            .lock()
            .map_err(|_| DropchatError::StoreUnavailable("listener mutex poisoned".into()))?
            .push(SessionListenerHandle {
                owner_id: owner_id.to_string(),
                tx,
            });
        Ok(SessionFeed { rx })
    }

    /// Derive a session title from its first message (first few words).
    pub fn generate_title(first_message: &str) -> String {
        let words: Vec<&str> = first_message.split_whitespace().take(6).collect();
        if words.is_empty() {
            "New Session".into()
        } else {
            format!("{}...", words.join(" "))
        }
    }

    fn notify_message(&self, message: &Message) {
        let Ok(active) = self.message_listener.lock() else {
            return;
        };
        if let Some(handle) = active.as_ref() {
            if handle.session_id == message.session_id {
                let _ = handle.tx.send(message.clone());
            }
        }
    }

    fn notify_sessions(&self, owner_id: &str) {
        let snapshot = match self.list_sessions(owner_id) {
            Ok(s) => s,
            Err(_) => return,
        };
        let Ok(mut listeners) = self.session_listeners.lock() else {
            return;
        };
        listeners.retain(|l| {
            if l.owner_id != owner_id {
                return true;
            }
            l.tx.send(snapshot.clone()).is_ok()
        });
    }
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        message_count: row.get(5)?,
        last_message_preview: row.get(6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let steps: Option<String> = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::System),
        content: row.get(3)?,
        timestamp: row.get(4)?,
        workflow_steps: steps
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}
