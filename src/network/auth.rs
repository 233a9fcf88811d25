//! Authenticators consulted during the connection handshake.

use crate::config::{AuthConfig, AuthMode};
use async_trait::async_trait;
use replicad_proto::AuthRequest;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    Accept,
    Reject { reason: String },
}

impl AuthVerdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }
}

/// Decides whether a connection may log in.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> AuthVerdict;
}

/// Accepts any non-empty username.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAuthenticator;

#[async_trait]
impl Authenticator for OpenAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> AuthVerdict {
        if request.username.trim().is_empty() {
            return AuthVerdict::reject("m.invalid_username");
        }
        AuthVerdict::Accept
    }
}

/// Checks credentials against a fixed username/password table.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> AuthVerdict {
        match self.users.get(&request.username) {
            Some(password) if *password == request.password => AuthVerdict::Accept,
            Some(_) => AuthVerdict::reject("m.invalid_password"),
            None => AuthVerdict::reject("m.no_such_user"),
        }
    }
}

/// Builds the authenticator selected in the config.
pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match config.mode {
        AuthMode::Open => Arc::new(OpenAuthenticator),
        AuthMode::Static => Arc::new(StaticAuthenticator::new(config.users.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, password: &str) -> AuthRequest {
        AuthRequest {
            username: username.to_string(),
            password: password.to_string(),
            boot_groups: vec![],
        }
    }

    #[tokio::test]
    async fn open_rejects_blank_usernames_only() {
        let auth = OpenAuthenticator;
        assert_eq!(auth.authenticate(&request("ann", "")).await, AuthVerdict::Accept);
        assert_eq!(
            auth.authenticate(&request("  ", "")).await,
            AuthVerdict::reject("m.invalid_username")
        );
    }

    #[tokio::test]
    async fn static_checks_the_table() {
        let auth = StaticAuthenticator::new(HashMap::from([("ann".to_string(), "pw".to_string())]));
        assert_eq!(auth.authenticate(&request("ann", "pw")).await, AuthVerdict::Accept);
        assert_eq!(
            auth.authenticate(&request("ann", "nope")).await,
            AuthVerdict::reject("m.invalid_password")
        );
        assert_eq!(
            auth.authenticate(&request("bob", "pw")).await,
            AuthVerdict::reject("m.no_such_user")
        );
    }
}
