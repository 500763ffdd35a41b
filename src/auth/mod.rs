// src/auth/mod.rs — Auth surface consumed by the HTTP clients
//
// Token acquisition mechanics live outside this crate. Hosts implement
// `AuthTokenProvider` over whatever identity system they use; every request
// to the runtime and video surfaces carries the bearer credential it returns.

use async_trait::async_trait;

use crate::infra::errors::DropchatError;

#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    /// Stable identifier of the signed-in user, if any.
    fn user_id(&self) -> Option<String>;

    /// A short-lived bearer credential for the current user.
    async fn bearer_token(&self) -> Result<String, DropchatError>;
}

/// Fixed-credential provider. Useful for tests and single-user deployments.
pub struct StaticTokenProvider {
    user_id: String,
    token: String,
}

impl StaticTokenProvider {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    fn user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }

    async fn bearer_token(&self) -> Result<String, DropchatError> {
        Ok(self.token.clone())
    }
}
