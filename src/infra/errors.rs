// src/infra/errors.rs — Error types for dropchat

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DropchatError {
    // No signed-in user or no credential available. Surfaced immediately, never retried.
    #[error("user is not authenticated")]
    Unauthenticated,

    // Session-create or run call failed at the transport level. The client does not
    // retry internally; the orchestrator or UI decides.
    #[error("agent runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    // A run response could not be normalized into text. Distinct from a transport
    // failure so the UI can show a specific "please retry" message.
    #[error("agent runtime returned no usable content")]
    NoContent,

    // Terminal error status from the video pipeline.
    #[error("video job failed: {0}")]
    JobFailed(String),

    // Persistence failed. Non-critical on the send path: conversation flow
    // continues in-memory and the failure is only logged.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    // Infra
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DropchatError {
    /// Whether a failure must interrupt the live conversation. Persistence
    /// failures do not: durability is secondary to the chat experience.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            DropchatError::StoreUnavailable(_) | DropchatError::Database(_)
        )
    }

    /// The single terminal chat line shown in place of the progress placeholder
    /// when a send fails.
    pub fn user_message(&self) -> &'static str {
        match self {
            DropchatError::Unauthenticated => "Please sign in to continue.",
            DropchatError::NoContent => {
                "The agent returned an empty reply. Please try sending your message again."
            }
            DropchatError::JobFailed(_) => "Video generation failed. Please try again.",
            _ => "Sorry, I encountered an error while processing your request. Please try again.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_non_critical() {
        assert!(!DropchatError::StoreUnavailable("disk full".into()).is_critical());
        assert!(DropchatError::RuntimeUnavailable("timeout".into()).is_critical());
        assert!(DropchatError::NoContent.is_critical());
    }

    #[test]
    fn test_no_content_has_distinct_user_message() {
        let generic = DropchatError::RuntimeUnavailable("x".into()).user_message();
        let no_content = DropchatError::NoContent.user_message();
        assert_ne!(generic, no_content);
        assert!(no_content.contains("again"));
    }
}
