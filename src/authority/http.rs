// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! HTTP token exchange against the instance metadata service and the registry.

use crate::authority::{AccessToken, RegistryToken, TokenExchange};
use crate::constants::authority::{ARM_RESOURCE, EXCHANGE_PATH, IMDS_API_VERSION};
use crate::error::{AcrPullError, Result};
use crate::types::ManagedIdentity;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Longest slice of an error body carried into error messages
const MAX_ERROR_BODY: usize = 256;

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct RegistryTokenResponse {
    refresh_token: String,
}

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Identity,
    Registry,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Identity => f.write_str("identity endpoint"),
            Endpoint::Registry => f.write_str("registry token endpoint"),
        }
    }
}

/// [`TokenExchange`] over HTTP with a bounded per-request timeout
pub struct HttpTokenExchange {
    client: reqwest::Client,
    imds_endpoint: Url,
    registry_scheme: String,
}

impl HttpTokenExchange {
    pub fn new(imds_endpoint: Url, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            imds_endpoint,
            registry_scheme: "https".to_string(),
        })
    }

    /// Talk to registries over another scheme, e.g. plain HTTP against a local test server
    pub fn with_registry_scheme(mut self, scheme: &str) -> Self {
        self.registry_scheme = scheme.to_string();
        self
    }

    fn access_token_url(&self, identity: &ManagedIdentity) -> Url {
        let mut url = self.imds_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("api-version", IMDS_API_VERSION)
                .append_pair("resource", ARM_RESOURCE);
            match identity {
                ManagedIdentity::ResourceId(id) => query.append_pair("mi_res_id", id),
                ManagedIdentity::ClientId(id) => query.append_pair("client_id", id),
            };
        }
        url
    }

    fn exchange_url(&self, registry_server: &str) -> Result<Url> {
        let raw = format!("{}://{}{}", self.registry_scheme, registry_server, EXCHANGE_PATH);
        Url::parse(&raw).map_err(|e| {
            AcrPullError::MalformedRequest(format!("invalid registry server '{}': {}", registry_server, e))
        })
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    #[instrument(skip(self), fields(identity = %identity))]
    async fn exchange_for_access_token(&self, identity: &ManagedIdentity) -> Result<AccessToken> {
        let response = self
            .client
            .get(self.access_token_url(identity))
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| request_error(Endpoint::Identity, e))?;

        let body: AccessTokenResponse = read_json(Endpoint::Identity, response).await?;
        debug!("Identity endpoint issued an access token");
        Ok(AccessToken(body.access_token))
    }

    #[instrument(skip(self, access_token))]
    async fn exchange_for_registry_token(
        &self,
        access_token: &AccessToken,
        registry_server: &str,
    ) -> Result<RegistryToken> {
        let form = [
            ("grant_type", "access_token"),
            ("service", registry_server),
            ("access_token", access_token.0.as_str()),
        ];

        let response = self
            .client
            .post(self.exchange_url(registry_server)?)
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error(Endpoint::Registry, e))?;

        let body: RegistryTokenResponse = read_json(Endpoint::Registry, response).await?;
        let expires_at = token_expiry(&body.refresh_token)?;

        Ok(RegistryToken {
            refresh_token: body.refresh_token,
            expires_at,
        })
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    endpoint: Endpoint,
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(endpoint, status, &body));
    }

    response.json().await.map_err(|e| {
        AcrPullError::InvalidAuthorityResponse(format!("{} sent an unreadable body: {}", endpoint, e))
    })
}

fn request_error(endpoint: Endpoint, err: reqwest::Error) -> AcrPullError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    AcrPullError::TransientNetwork(format!("{} {}: {}", endpoint, kind, err))
}

fn status_error(endpoint: Endpoint, status: StatusCode, body: &str) -> AcrPullError {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    let detail = format!("{} returned {}: {}", endpoint, status, body.trim());

    match status.as_u16() {
        401 | 403 => AcrPullError::IdentityDenied(detail),
        // The identity endpoint answers 400 for identities not assigned to this host
        400 if endpoint == Endpoint::Identity => AcrPullError::IdentityDenied(detail),
        408 | 429 => AcrPullError::TransientNetwork(detail),
        code if code >= 500 => AcrPullError::TransientNetwork(detail),
        _ => AcrPullError::MalformedRequest(detail),
    }
}

/// Read the `exp` claim of a registry refresh token without verifying it
fn token_expiry(jwt: &str) -> Result<DateTime<Utc>> {
    let invalid = |reason: &str| {
        AcrPullError::InvalidAuthorityResponse(format!("registry refresh token {}", reason))
    };

    let payload = jwt.split('.').nth(1).ok_or_else(|| invalid("is not a JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| invalid("has an undecodable payload"))?;
    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|_| invalid("has no numeric exp claim"))?;

    DateTime::from_timestamp(claims.exp, 0).ok_or_else(|| invalid("has an out of range exp claim"))
}
