// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{authority, defaults};
use crate::types::binding::ManagedIdentity;
use anyhow::{bail, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry server used when a binding does not name one
    pub default_acr_server: Option<String>,
    /// Managed identity used when a binding does not name one
    pub default_identity: Option<ManagedIdentity>,
    /// Tokens are renewed this long before they expire
    pub renewal_margin: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Requeue interval after failures that need external remediation
    pub error_requeue: Duration,
    /// Floor for any scheduled token refresh
    pub min_requeue: Duration,
    /// Bound on each call to the token authority
    pub authority_timeout: Duration,
    pub imds_endpoint: Url,
    pub reconcile_concurrency: u16,
    pub health_probe_addr: SocketAddr,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let default_identity = match (
            non_empty("MANAGED_IDENTITY_RESOURCE_ID"),
            non_empty("MANAGED_IDENTITY_CLIENT_ID"),
        ) {
            (Some(_), Some(_)) => bail!(
                "MANAGED_IDENTITY_RESOURCE_ID and MANAGED_IDENTITY_CLIENT_ID are mutually exclusive"
            ),
            (Some(id), None) => Some(ManagedIdentity::ResourceId(id)),
            (None, Some(id)) => Some(ManagedIdentity::ClientId(id)),
            (None, None) => None,
        };

        let secs = |key: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_secs(parse_or(&lookup, key, default)?))
        };

        let backoff_base = secs("BACKOFF_BASE_SECS", defaults::BACKOFF_BASE_SECS)?;
        let backoff_max = secs("BACKOFF_MAX_SECS", defaults::BACKOFF_MAX_SECS)?;
        if backoff_base.is_zero() || backoff_base > backoff_max {
            bail!("BACKOFF_BASE_SECS must be positive and not exceed BACKOFF_MAX_SECS");
        }

        let imds_endpoint = non_empty("IMDS_ENDPOINT")
            .unwrap_or_else(|| authority::IMDS_ENDPOINT.to_string());
        let imds_endpoint =
            Url::parse(&imds_endpoint).context("IMDS_ENDPOINT is not a valid URL")?;

        let health_probe_addr: SocketAddr = non_empty("HEALTH_PROBE_BIND_ADDRESS")
            .unwrap_or_else(|| defaults::HEALTH_PROBE_BIND_ADDRESS.to_string())
            .parse()
            .context("HEALTH_PROBE_BIND_ADDRESS is not a valid socket address")?;

        Ok(Config {
            default_acr_server: non_empty("ACR_SERVER"),
            default_identity,
            renewal_margin: secs("TOKEN_RENEWAL_MARGIN_SECS", defaults::RENEWAL_MARGIN_SECS)?,
            backoff_base,
            backoff_max,
            error_requeue: secs("ERROR_REQUEUE_SECS", defaults::ERROR_REQUEUE_SECS)?,
            min_requeue: secs("MIN_REQUEUE_SECS", defaults::MIN_REQUEUE_SECS)?,
            authority_timeout: secs("AUTHORITY_TIMEOUT_SECS", defaults::AUTHORITY_TIMEOUT_SECS)?,
            imds_endpoint,
            reconcile_concurrency: parse_or(
                &lookup,
                "RECONCILE_CONCURRENCY",
                defaults::RECONCILE_CONCURRENCY,
            )?,
            health_probe_addr,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value '{}'", key, raw)),
        _ => Ok(default),
    }
}
