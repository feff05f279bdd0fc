// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Token authority client.
//!
//! Issuing a registry token is a two-step exchange: the managed identity first obtains an
//! identity-provider access token, which the registry then trades for a refresh token.
//! Nothing here caches; callers decide when a new token is needed.

pub mod http;

use crate::error::{AcrPullError, Result};
use crate::types::{IssuedToken, ManagedIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

pub use http::HttpTokenExchange;

/// Access token issued by the identity provider for the management audience
#[derive(Clone)]
pub struct AccessToken(pub String);

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Refresh token issued by the registry
#[derive(Clone)]
pub struct RegistryToken {
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues registry credentials for a managed identity
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    async fn issue(&self, identity: &ManagedIdentity, registry_server: &str)
        -> Result<IssuedToken>;
}

/// The two exchanges behind [`TokenAuthority::issue`]
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange_for_access_token(&self, identity: &ManagedIdentity) -> Result<AccessToken>;

    async fn exchange_for_registry_token(
        &self,
        access_token: &AccessToken,
        registry_server: &str,
    ) -> Result<RegistryToken>;
}

/// [`TokenAuthority`] composed from a [`TokenExchange`]
pub struct ManagedIdentityAuthority<E> {
    exchange: E,
}

impl<E: TokenExchange> ManagedIdentityAuthority<E> {
    pub fn new(exchange: E) -> Self {
        Self { exchange }
    }
}

#[async_trait]
impl<E: TokenExchange> TokenAuthority for ManagedIdentityAuthority<E> {
    #[instrument(skip(self), fields(identity = %identity))]
    async fn issue(
        &self,
        identity: &ManagedIdentity,
        registry_server: &str,
    ) -> Result<IssuedToken> {
        identity.validate()?;
        if !is_valid_hostname(registry_server) {
            return Err(AcrPullError::MalformedRequest(format!(
                "'{}' is not a valid registry hostname",
                registry_server
            )));
        }

        let issued_at = Utc::now();
        let access_token = self.exchange.exchange_for_access_token(identity).await?;
        debug!("Obtained identity access token");

        let registry_token = self
            .exchange
            .exchange_for_registry_token(&access_token, registry_server)
            .await?;
        debug!(expires_at = %registry_token.expires_at, "Obtained registry refresh token");

        IssuedToken::new(
            identity.clone(),
            registry_server,
            registry_token.refresh_token,
            issued_at,
            registry_token.expires_at,
        )
    }
}

/// RFC 1123 hostname check
pub fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
