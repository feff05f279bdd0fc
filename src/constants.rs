// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The operator name used as field manager and `managed-by` label value
pub const OPERATOR_NAME: &str = "msi-acrpull";

/// API group of the AcrPullBinding resource
pub const API_GROUP: &str = "msi-acrpull.microsoft.com";

/// Finalizer that detaches pull secrets from service accounts on deletion
pub const FINALIZER: &str = "msi-acrpull.microsoft.com/finalizer";

/// Kubernetes annotation keys used by msi-acrpull
pub mod annotations {
    /// Absolute expiry (RFC 3339) of the token currently stored in a pull secret
    pub const TOKEN_EXPIRY: &str = "msi-acrpull.microsoft.com/token-expiry";
    /// Registry server and identity the stored token was issued for
    pub const TOKEN_SCOPE: &str = "msi-acrpull.microsoft.com/token-scope";
}

/// Kubernetes label keys used by msi-acrpull
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Name of the binding owning a pull secret
    pub const BINDING: &str = "msi-acrpull.microsoft.com/binding";
}

/// Pull secret layout
pub mod secret {
    /// Secret type understood by the kubelet for image pulls
    pub const TYPE: &str = "kubernetes.io/dockerconfigjson";
    /// Data key holding the registry client config
    pub const DATA_KEY: &str = ".dockerconfigjson";
    /// Suffix appended to the binding name when no secret name is given
    pub const NAME_SUFFIX: &str = "-msi-acrpull-secret";
    /// Fixed registry username for tokens obtained through a managed identity
    pub const TOKEN_USERNAME: &str = "00000000-0000-0000-0000-000000000000";
    /// Attempts at read-modify-write before an optimistic-concurrency conflict is surfaced
    pub const CONFLICT_RETRIES: u32 = 5;
}

/// Service account attached to when a binding names none
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Token authority endpoints and parameters
pub mod authority {
    pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
    pub const IMDS_API_VERSION: &str = "2018-02-01";
    /// Audience of the identity-provider token exchanged at the registry
    pub const ARM_RESOURCE: &str = "https://management.azure.com/";
    /// Path of the registry's token-exchange endpoint
    pub const EXCHANGE_PATH: &str = "/oauth2/exchange";
}

/// Default reconciler tunables, in seconds
pub mod defaults {
    pub const RENEWAL_MARGIN_SECS: u64 = 30 * 60;
    pub const BACKOFF_BASE_SECS: u64 = 5;
    pub const BACKOFF_MAX_SECS: u64 = 5 * 60;
    pub const ERROR_REQUEUE_SECS: u64 = 10 * 60;
    pub const MIN_REQUEUE_SECS: u64 = 30;
    pub const AUTHORITY_TIMEOUT_SECS: u64 = 30;
    pub const RECONCILE_CONCURRENCY: u16 = 8;
    pub const HEALTH_PROBE_BIND_ADDRESS: &str = "0.0.0.0:8081";
}

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}
