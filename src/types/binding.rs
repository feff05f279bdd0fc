// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::config::Config;
use crate::constants::{secret, DEFAULT_SERVICE_ACCOUNT, FINALIZER};
use crate::error::{AcrPullError, Result};
use crate::types::token::token_scope;
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Metadata, ObjectValidation, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Desired pull-credential state for one registry
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "msi-acrpull.microsoft.com", version = "v1beta1", kind = "AcrPullBinding")]
#[kube(namespaced)]
#[kube(status = "AcrPullBindingStatus")]
#[kube(shortname = "apb")]
#[kube(printcolumn = r#"{"name":"Server","type":"string","jsonPath":".status.acrServer"}"#)]
#[kube(printcolumn = r#"{"name":"Condition","type":"string","jsonPath":".status.condition"}"#)]
#[kube(printcolumn = r#"{"name":"Expires","type":"string","jsonPath":".status.tokenExpirationTime"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AcrPullBindingSpec {
    /// Identity used to obtain registry tokens; falls back to the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "managed_identity_schema")]
    pub managed_identity: Option<ManagedIdentity>,
    /// Registry hostname; falls back to the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Service accounts the pull secret is attached to; `default` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_names: Option<Vec<String>>,
    /// Namespace scope; must match the binding's own namespace when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A managed identity reference, either by ARM resource ID or by client ID
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ManagedIdentity {
    #[serde(rename = "resourceID")]
    ResourceId(String),
    #[serde(rename = "clientID")]
    ClientId(String),
}

impl ManagedIdentity {
    /// Check that the reference is well-formed
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ResourceId(id) if is_identity_resource_id(id) => Ok(()),
            Self::ResourceId(id) => Err(AcrPullError::MalformedRequest(format!(
                "'{}' is not a user-assigned identity resource ID",
                id
            ))),
            Self::ClientId(id) if is_guid(id) => Ok(()),
            Self::ClientId(id) => Err(AcrPullError::MalformedRequest(format!(
                "'{}' is not a client ID",
                id
            ))),
        }
    }
}

impl fmt::Display for ManagedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceId(id) => write!(f, "resourceID {}", id),
            Self::ClientId(id) => write!(f, "clientID {}", id),
        }
    }
}

/// `/subscriptions/<s>/resourceGroups/<rg>/providers/Microsoft.ManagedIdentity/userAssignedIdentities/<name>`
fn is_identity_resource_id(id: &str) -> bool {
    let parts: Vec<&str> = id.split('/').collect();
    let [root, subs, sub, groups, group, providers, namespace, kind, name] = parts.as_slice() else {
        return false;
    };

    root.is_empty()
        && subs.eq_ignore_ascii_case("subscriptions")
        && groups.eq_ignore_ascii_case("resourceGroups")
        && providers.eq_ignore_ascii_case("providers")
        && namespace.eq_ignore_ascii_case("Microsoft.ManagedIdentity")
        && kind.eq_ignore_ascii_case("userAssignedIdentities")
        && [sub, group, name].iter().all(|s| !s.is_empty())
}

fn is_guid(id: &str) -> bool {
    id.len() == 36
        && id.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Structural schema for [`ManagedIdentity`]: an object with exactly one of its keys
fn managed_identity_schema(_: &mut SchemaGenerator) -> Schema {
    let string = Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        ..Default::default()
    });

    Schema::Object(SchemaObject {
        metadata: Some(Box::new(Metadata {
            description: Some("Exactly one of resourceID or clientID".to_string()),
            ..Default::default()
        })),
        instance_type: Some(InstanceType::Object.into()),
        object: Some(Box::new(ObjectValidation {
            properties: [
                ("resourceID".to_string(), string.clone()),
                ("clientID".to_string(), string),
            ]
            .into_iter()
            .collect(),
            min_properties: Some(1),
            max_properties: Some(1),
            ..Default::default()
        })),
        ..Default::default()
    })
}

/// Observed credential state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum BindingCondition {
    /// The pull secret holds a token outside its renewal margin
    Ready,
    /// A token is being issued or its issuance is being retried
    Refreshing,
    /// The last attempt failed in a way that needs attention
    Error,
}

/// Status fields are always serialized so merge patches clear stale values.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcrPullBindingStatus {
    pub condition: Option<BindingCondition>,
    /// RFC 3339 time of the last successful token issuance
    pub last_token_refresh_time: Option<String>,
    /// RFC 3339 expiry of the token stored in the pull secret
    pub token_expiration_time: Option<String>,
    pub error: Option<String>,
    /// Registry server the recorded token was issued for
    pub acr_server: Option<String>,
    /// Identity the recorded token was issued for
    #[serde(default)]
    #[schemars(schema_with = "managed_identity_schema")]
    pub managed_identity: Option<ManagedIdentity>,
    /// Pull secret attached to service accounts, so a renamed secret can be detached
    #[serde(default)]
    pub secret_name: Option<String>,
    pub observed_generation: Option<i64>,
}

impl AcrPullBindingStatus {
    /// Expiry of the recorded token, if parseable
    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.token_expiration_time.as_deref().and_then(parse_time)
    }
}

impl AcrPullBinding {
    /// Name of the pull secret managed for this binding
    pub fn secret_name(&self) -> String {
        self.spec
            .secret_name
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{}{}", self.name_any(), secret::NAME_SUFFIX))
    }

    /// Service accounts the pull secret should be attached to
    pub fn service_account_names(&self) -> Vec<String> {
        match &self.spec.service_account_names {
            Some(names) => names.iter().filter(|n| !n.is_empty()).cloned().collect(),
            None => vec![DEFAULT_SERVICE_ACCOUNT.to_string()],
        }
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Apply operator defaults and check the binding is actionable
    pub fn resolve(&self, config: &Config) -> Result<ResolvedBinding> {
        let key = BindingKey::for_binding(self)?;

        if let Some(scope) = self.spec.namespace.as_deref().filter(|s| !s.is_empty()) {
            if scope != key.namespace {
                return Err(AcrPullError::InvalidBindingSpec(format!(
                    "namespace '{}' differs from the binding namespace '{}'",
                    scope, key.namespace
                )));
            }
        }

        let identity = self
            .spec
            .managed_identity
            .clone()
            .or_else(|| config.default_identity.clone())
            .ok_or_else(|| {
                AcrPullError::InvalidBindingSpec(
                    "no managed identity given and no default configured".to_string(),
                )
            })?;

        let acr_server = self
            .spec
            .acr_server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| config.default_acr_server.clone())
            .ok_or_else(|| {
                AcrPullError::InvalidBindingSpec(
                    "no ACR server given and no default configured".to_string(),
                )
            })?;

        Ok(ResolvedBinding {
            key,
            identity,
            acr_server,
            secret_name: self.secret_name(),
            service_accounts: self.service_account_names(),
        })
    }
}

/// Identity of a binding within the cluster, used as cache and work-queue key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub namespace: String,
    pub name: String,
}

impl BindingKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_binding(binding: &AcrPullBinding) -> Result<Self> {
        let namespace = binding.namespace().ok_or_else(|| {
            AcrPullError::InvalidBindingSpec(format!("binding {} has no namespace", binding.name_any()))
        })?;
        Ok(Self::new(namespace, binding.name_any()))
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A binding with defaults applied
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedBinding {
    pub key: BindingKey,
    pub identity: ManagedIdentity,
    pub acr_server: String,
    pub secret_name: String,
    pub service_accounts: Vec<String>,
}

impl ResolvedBinding {
    pub fn token_scope(&self) -> String {
        token_scope(&self.identity, &self.acr_server)
    }
}

/// Format a timestamp the way status fields and annotations record it
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
