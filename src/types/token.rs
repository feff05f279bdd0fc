// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::secret;
use crate::error::{AcrPullError, Result};
use crate::types::binding::ManagedIdentity;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A registry refresh token obtained through a managed identity.
///
/// Tokens are immutable; a renewal produces a new value that supersedes the old one.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub identity: ManagedIdentity,
    pub registry_server: String,
    pub username: String,
    password: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn new(
        identity: ManagedIdentity,
        registry_server: impl Into<String>,
        password: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        let password = password.into();
        if password.is_empty() {
            return Err(AcrPullError::InvalidAuthorityResponse(
                "empty registry token".to_string(),
            ));
        }
        if expires_at <= issued_at {
            return Err(AcrPullError::InvalidAuthorityResponse(format!(
                "token expires at {} before it was issued at {}",
                expires_at, issued_at
            )));
        }

        Ok(Self {
            identity,
            registry_server: registry_server.into(),
            username: secret::TOKEN_USERNAME.to_string(),
            password,
            issued_at,
            expires_at,
        })
    }

    /// The token payload, used as registry password
    pub fn password(&self) -> &str {
        &self.password
    }

    /// The instant at which the token should be replaced
    pub fn refresh_at(&self, renewal_margin: Duration) -> DateTime<Utc> {
        renewal_point(self.expires_at, renewal_margin)
    }

    /// A token is usable while `now < expiry - margin`
    pub fn is_usable(&self, now: DateTime<Utc>, renewal_margin: Duration) -> bool {
        now < self.refresh_at(renewal_margin)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the token was issued for this identity and registry
    pub fn issued_for(&self, identity: &ManagedIdentity, registry_server: &str) -> bool {
        &self.identity == identity && self.registry_server == registry_server
    }

    pub fn scope(&self) -> String {
        token_scope(&self.identity, &self.registry_server)
    }
}

/// Registry server and identity a token is valid for, as recorded on pull secrets
pub fn token_scope(identity: &ManagedIdentity, registry_server: &str) -> String {
    format!("{} as {}", registry_server, identity)
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the actual token in debug output
        f.debug_struct("IssuedToken")
            .field("identity", &self.identity)
            .field("registry_server", &self.registry_server)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// `expiry - margin`, saturating at the earliest representable time
pub fn renewal_point(expires_at: DateTime<Utc>, renewal_margin: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(renewal_margin)
        .ok()
        .and_then(|margin| expires_at.checked_sub_signed(margin))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
