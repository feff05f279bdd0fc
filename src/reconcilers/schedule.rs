// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Credential assessment, refresh scheduling and retry backoff.

use crate::types::token::renewal_point;
use crate::types::{AcrPullBindingStatus, BindingKey, IssuedToken, ResolvedBinding};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// What is known about a binding's credential at the start of a reconcile
#[derive(Debug, Default)]
pub struct CredentialState<'a> {
    pub cached: Option<&'a IssuedToken>,
    pub status: Option<&'a AcrPullBindingStatus>,
    /// Expiry recorded on the pull secret, `None` when the secret is missing or not ours
    pub secret_expiry: Option<DateTime<Utc>>,
}

/// Decision taken for a binding's credential
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    /// A cached token for the current scope is outside its renewal margin
    Cached(IssuedToken),
    /// No cached token, but status and secret agree on an expiry outside the renewal margin
    Recorded(DateTime<Utc>),
    /// A token for the current scope exists but is inside its renewal margin
    Expiring,
    /// Nothing usable is known
    Unknown,
}

pub fn assess(
    state: &CredentialState<'_>,
    resolved: &ResolvedBinding,
    now: DateTime<Utc>,
    renewal_margin: Duration,
) -> Assessment {
    if let Some(token) = state
        .cached
        .filter(|t| t.issued_for(&resolved.identity, &resolved.acr_server))
    {
        if token.is_usable(now, renewal_margin) {
            return Assessment::Cached(token.clone());
        }
        return if token.is_expired(now) {
            Assessment::Unknown
        } else {
            Assessment::Expiring
        };
    }

    let Some(expiry) = state.status.and_then(|s| recorded_for(s, resolved)) else {
        return Assessment::Unknown;
    };
    if state.secret_expiry.map(|t| t.timestamp()) != Some(expiry.timestamp()) {
        return Assessment::Unknown;
    }

    if now < renewal_point(expiry, renewal_margin) {
        Assessment::Recorded(expiry)
    } else if now < expiry {
        Assessment::Expiring
    } else {
        Assessment::Unknown
    }
}

/// Expiry recorded in status, if it was recorded for the binding's current scope
fn recorded_for(status: &AcrPullBindingStatus, resolved: &ResolvedBinding) -> Option<DateTime<Utc>> {
    let same_scope = status.acr_server.as_deref() == Some(resolved.acr_server.as_str())
        && status.managed_identity.as_ref() == Some(&resolved.identity);
    same_scope.then(|| status.token_expiry()).flatten()
}

/// Delay until `expiry - margin`, never shorter than `min`
pub fn refresh_delay(
    expires_at: DateTime<Utc>,
    renewal_margin: Duration,
    now: DateTime<Utc>,
    min: Duration,
) -> Duration {
    (renewal_point(expires_at, renewal_margin) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(min)
}

/// Capped exponential backoff with multiplicative jitter in `[1, 1.25)`
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// `min(base * 2^(attempt-1) * jitter, max)` for attempts counted from 1
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent) * jitter.clamp(1.0, 1.25);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

/// Uniform jitter factor in `[1, 1.25)`
pub fn random_jitter() -> f64 {
    rand::thread_rng().gen_range(1.0..1.25)
}

/// Consecutive failure counts per binding
#[derive(Clone, Default)]
pub struct BackoffTracker {
    attempts: Arc<DashMap<BindingKey, u32>>,
}

impl BackoffTracker {
    /// Record a failure and return the attempt number it represents
    pub fn record_failure(&self, key: &BindingKey) -> u32 {
        let mut attempts = self.attempts.entry(key.clone()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        *attempts
    }

    pub fn attempts(&self, key: &BindingKey) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }

    pub fn reset(&self, key: &BindingKey) {
        self.attempts.remove(key);
    }
}
