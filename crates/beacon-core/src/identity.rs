//! Verified principals and the upstream identity collaborator.
//!
//! The engine never authenticates on its own. An [`Authenticator`] hands it a
//! [`Principal`] before a session is admitted, and the engine trusts it as-is.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::EngineError;

/// Organization role of a principal, ordered by privilege.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Viewer,
    Member,
    Admin,
    Owner,
}

impl Role {
    /// Lowercase role name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(EngineError::InvalidMessage(format!("unknown role: {other}"))),
        }
    }
}

/// A verified identity, as issued by the upstream identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub organization_id: String,
    pub role: Role,
    pub display_name: String,
}

impl Principal {
    /// Create a principal.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        role: Role,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            role,
            display_name: display_name.into(),
        }
    }

    /// Key identifying this user across sessions and organizations.
    #[must_use]
    pub fn user_key(&self) -> String {
        user_key(&self.organization_id, &self.user_id)
    }
}

/// Key identifying a user within an organization.
#[must_use]
pub fn user_key(organization_id: &str, user_id: &str) -> String {
    format!("{organization_id}/{user_id}")
}

/// Upstream identity collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Exchange a client credential for a verified principal.
    async fn authenticate(&self, token: &str) -> Result<Principal, EngineError>;

    /// Release whatever the identity service holds for a closed session.
    async fn release(&self, principal: &Principal) -> Result<(), EngineError>;
}

/// Authenticator backed by a fixed token table.
///
/// Suitable for development and for deployments where an edge proxy has
/// already verified the caller and forwards an opaque per-user token.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Principal>,
    active: DashMap<String, usize>,
}

impl StaticTokenAuthenticator {
    /// Create an authenticator from a token table.
    #[must_use]
    pub fn new(tokens: HashMap<String, Principal>) -> Self {
        Self {
            tokens,
            active: DashMap::new(),
        }
    }

    /// Number of principals with at least one authenticated session.
    #[must_use]
    pub fn active_principals(&self) -> usize {
        self.active.len()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Principal, EngineError> {
        let principal = self
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| EngineError::Unauthorized("unknown token".to_string()))?;

        *self.active.entry(principal.user_key()).or_insert(0) += 1;
        debug!(user = %principal.user_id, org = %principal.organization_id, "Authenticated");
        Ok(principal)
    }

    async fn release(&self, principal: &Principal) -> Result<(), EngineError> {
        let key = principal.user_key();
        let remove = match self.active.get_mut(&key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => return Err(EngineError::SessionNotFound(key)),
        };
        if remove {
            self.active.remove_if(&key, |_, count| *count == 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> StaticTokenAuthenticator {
        let mut tokens = HashMap::new();
        tokens.insert(
            "tok-alice".to_string(),
            Principal::new("alice", "acme", Role::Admin, "Alice"),
        );
        StaticTokenAuthenticator::new(tokens)
    }

    #[test]
    fn test_role_ordering_and_parsing() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Member > Role::Viewer);
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn test_authenticate_and_release() {
        let auth = authenticator();

        let principal = auth.authenticate("tok-alice").await.unwrap();
        assert_eq!(principal.user_id, "alice");
        assert_eq!(auth.active_principals(), 1);

        auth.release(&principal).await.unwrap();
        assert_eq!(auth.active_principals(), 0);

        assert!(auth.release(&principal).await.unwrap_err().is_benign());
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let auth = authenticator();
        assert!(matches!(
            auth.authenticate("bogus").await,
            Err(EngineError::Unauthorized(_))
        ));
    }
}
