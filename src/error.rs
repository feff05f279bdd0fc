// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::types::binding::BindingCondition;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AcrPullError {
    #[error("Token authority unreachable: {0}")]
    TransientNetwork(String),

    #[error("Managed identity denied: {0}")]
    IdentityDenied(String),

    #[error("Malformed token request: {0}")]
    MalformedRequest(String),

    #[error("Invalid token authority response: {0}")]
    InvalidAuthorityResponse(String),

    #[error("Conflicting update: {0}")]
    StoreConflict(String),

    #[error("Kubernetes API rejected request: {0}")]
    StoreFatal(String),

    #[error("Service account not found: {0}")]
    MissingServiceAccount(String),

    #[error("Invalid binding spec: {0}")]
    InvalidBindingSpec(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AcrPullError>;

/// How a failed reconciliation is rescheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Capped exponential backoff with jitter
    Backoff,
    /// Long fixed interval, waiting for external remediation
    FixedInterval,
    /// No requeue until the binding itself changes
    AwaitSpecChange,
}

impl AcrPullError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::TransientNetwork(_)
            | Self::InvalidAuthorityResponse(_)
            | Self::StoreConflict(_)
            | Self::MissingServiceAccount(_)
            | Self::IdentityDenied(_) => RetryPolicy::Backoff,
            Self::MalformedRequest(_) | Self::StoreFatal(_) | Self::Serialization(_) => {
                RetryPolicy::FixedInterval
            }
            Self::InvalidBindingSpec(_) => RetryPolicy::AwaitSpecChange,
        }
    }

    /// Status condition reported while this error is the latest outcome
    pub fn condition(&self) -> BindingCondition {
        match self {
            Self::TransientNetwork(_)
            | Self::InvalidAuthorityResponse(_)
            | Self::StoreConflict(_)
            | Self::MissingServiceAccount(_) => BindingCondition::Refreshing,
            _ => BindingCondition::Error,
        }
    }
}

impl From<kube::Error> for AcrPullError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => match resp.code {
                409 => Self::StoreConflict(resp.message.clone()),
                400 | 401 | 403 | 422 => Self::StoreFatal(format!("{} ({})", resp.message, resp.code)),
                _ => Self::TransientNetwork(err.to_string()),
            },
            _ => Self::TransientNetwork(err.to_string()),
        }
    }
}

/// True when the error is a Kubernetes 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True when the error is an optimistic-concurrency rejection
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}
