//! Authentication modules
//!
//! Credential verification is delegated to pluggable modules; the
//! session manager itself never inspects passwords. The `system`
//! module is the fail-closed production default (the host's PAM
//! service fronts it in a full deployment); the `static` module backs
//! development setups and the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Outcome classes of an authentication attempt.
///
/// Distinct variants exist for "the connection object is missing" and
/// "the session is in the wrong state" so callers never have to guess
/// what a generic failure meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success,
    BadCredentials,
    NotAllowed,
    AlreadyAuthenticated,
    WrongSessionState,
    ConnectionMissing,
    InternalError,
}

impl AuthStatus {
    /// Numeric code reported over the SBP authenticate response.
    pub fn as_wire(self) -> u32 {
        match self {
            AuthStatus::Success => 0,
            AuthStatus::BadCredentials => 1,
            AuthStatus::NotAllowed => 2,
            AuthStatus::AlreadyAuthenticated => 3,
            AuthStatus::WrongSessionState => 4,
            AuthStatus::ConnectionMissing => 5,
            AuthStatus::InternalError => 6,
        }
    }
}

/// Result of `logon_user`, including the optional domain rewrite a
/// module may perform (e.g. canonicalizing a short domain name).
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub status: AuthStatus,
    pub rewritten_domain: Option<String>,
}

impl AuthOutcome {
    pub fn success() -> Self {
        Self {
            status: AuthStatus::Success,
            rewritten_domain: None,
        }
    }

    pub fn failed(status: AuthStatus) -> Self {
        Self {
            status,
            rewritten_domain: None,
        }
    }
}

/// A credential verifier.
#[async_trait]
pub trait AuthModule: Send + Sync {
    fn name(&self) -> &str;

    async fn logon_user(&self, user_name: &str, domain: &str, password: &str) -> AuthOutcome;
}

/// Fail-closed system module: verifies that the account exists, then
/// rejects because actual credential verification lives in the external
/// PAM host service. Registered under the `PAM` default name so a
/// misconfigured deployment denies logons instead of accepting them.
pub struct SystemAuthModule;

#[async_trait]
impl AuthModule for SystemAuthModule {
    fn name(&self) -> &str {
        "PAM"
    }

    async fn logon_user(&self, user_name: &str, _domain: &str, _password: &str) -> AuthOutcome {
        let user = user_name.to_string();
        let exists = tokio::task::spawn_blocking(move || uzers::get_user_by_name(&user).is_some())
            .await
            .unwrap_or(false);
        if !exists {
            debug!(user = user_name, "unknown account");
            return AuthOutcome::failed(AuthStatus::BadCredentials);
        }
        warn!(
            user = user_name,
            "system auth module has no credential backend, rejecting"
        );
        AuthOutcome::failed(AuthStatus::BadCredentials)
    }
}

/// Fixed user/password table. Development and tests only.
pub struct StaticAuthModule {
    users: RwLock<HashMap<String, String>>,
}

impl StaticAuthModule {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Parse `user:password;user:password;…` (the format of the
    /// `auth.static.users` property).
    pub fn from_spec(spec: &str) -> Self {
        let module = Self::new();
        for entry in spec.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some((user, password)) = entry.split_once(':') {
                module.add_user(user, password);
            }
        }
        module
    }

    pub fn add_user(&self, user: &str, password: &str) {
        self.users
            .write()
            .insert(user.to_string(), password.to_string());
    }
}

impl Default for StaticAuthModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthModule for StaticAuthModule {
    fn name(&self) -> &str {
        "static"
    }

    async fn logon_user(&self, user_name: &str, _domain: &str, password: &str) -> AuthOutcome {
        let users = self.users.read();
        match users.get(user_name) {
            Some(expected) if expected == password && !password.is_empty() => {
                AuthOutcome::success()
            }
            _ => AuthOutcome::failed(AuthStatus::BadCredentials),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_module_verifies_table() {
        let module = StaticAuthModule::from_spec("alice:secret; bob:pw2");
        assert_eq!(
            module.logon_user("alice", "", "secret").await.status,
            AuthStatus::Success
        );
        assert_eq!(
            module.logon_user("alice", "", "wrong").await.status,
            AuthStatus::BadCredentials
        );
        assert_eq!(
            module.logon_user("mallory", "", "secret").await.status,
            AuthStatus::BadCredentials
        );
    }

    #[tokio::test]
    async fn static_module_rejects_empty_password() {
        let module = StaticAuthModule::new();
        module.add_user("alice", "");
        assert_eq!(
            module.logon_user("alice", "", "").await.status,
            AuthStatus::BadCredentials
        );
    }
}
