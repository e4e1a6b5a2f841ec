//! Token authentication.

use std::collections::HashMap;

use async_trait::async_trait;
use roost_types::User;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The client's fault. The message is shown to the client.
    #[error("{0}")]
    User(String),

    #[error("Auth backend failure: {0}")]
    Internal(String),
}

/// Resolves an auth token to a user.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn check_auth_token(&self, token: &str) -> Result<User, AuthError>;
}

/// Fixed token table, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, User>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, token: impl Into<String>, user: User) -> Self {
        self.insert(token, user);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user: User) {
        self.tokens.insert(token.into(), user);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn check_auth_token(&self, token: &str) -> Result<User, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::User("Bad token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tokens() {
        let auth = StaticAuthenticator::new().with_user(
            "secret",
            User {
                id: 7,
                display_name: "davidben".to_string(),
            },
        );

        let user = auth.check_auth_token("secret").await.unwrap();
        assert_eq!(user.id, 7);

        let err = auth.check_auth_token("nope").await.unwrap_err();
        assert_eq!(err, AuthError::User("Bad token".to_string()));
        assert_eq!(err.to_string(), "Bad token");
    }
}
