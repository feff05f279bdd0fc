// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Binding status and finalizer writes

use crate::constants::{FINALIZER, OPERATOR_NAME};
use crate::error::{AcrPullError, Result};
use crate::types::binding::format_time;
use crate::types::{AcrPullBinding, AcrPullBindingStatus, BindingCondition, ResolvedBinding};
use chrono::{DateTime, Utc};
use kube::{
    api::{Patch, PatchParams},
    Api, ResourceExt,
};
use tracing::{debug, instrument};

/// Status after a token for `resolved` with the given expiry is in place.
///
/// `refreshed_at` is set when the token was issued during this reconcile; otherwise
/// the previous refresh time is kept.
pub fn ready_status(
    binding: &AcrPullBinding,
    resolved: &ResolvedBinding,
    expires_at: DateTime<Utc>,
    refreshed_at: Option<DateTime<Utc>>,
) -> AcrPullBindingStatus {
    let previous = binding.status.as_ref();

    AcrPullBindingStatus {
        condition: Some(BindingCondition::Ready),
        last_token_refresh_time: refreshed_at
            .map(format_time)
            .or_else(|| previous.and_then(|s| s.last_token_refresh_time.clone())),
        token_expiration_time: Some(format_time(expires_at)),
        error: None,
        acr_server: Some(resolved.acr_server.clone()),
        managed_identity: Some(resolved.identity.clone()),
        secret_name: Some(resolved.secret_name.clone()),
        observed_generation: binding.metadata.generation,
    }
}

/// Status after a failed reconcile. Token fields keep describing the secret, which a
/// failure never touches.
pub fn failure_status(binding: &AcrPullBinding, err: &AcrPullError) -> AcrPullBindingStatus {
    AcrPullBindingStatus {
        condition: Some(err.condition()),
        error: Some(err.to_string()),
        observed_generation: binding.metadata.generation,
        ..binding.status.clone().unwrap_or_default()
    }
}

/// Merge-patch the status subresource, skipped when nothing changed.
/// Returns whether a write happened.
#[instrument(skip(api, binding, status), fields(binding = %binding.name_any()))]
pub async fn patch_status(
    api: &Api<AcrPullBinding>,
    binding: &AcrPullBinding,
    status: AcrPullBindingStatus,
) -> Result<bool> {
    if binding.status.as_ref() == Some(&status) {
        debug!("Status unchanged, skipping write");
        return Ok(false);
    }

    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &binding.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(true)
}

/// Add the finalizer, keeping any others
pub async fn add_finalizer(api: &Api<AcrPullBinding>, binding: &AcrPullBinding) -> Result<()> {
    if binding.has_finalizer() {
        return Ok(());
    }

    let mut finalizers = binding.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(api, binding, finalizers).await
}

pub async fn remove_finalizer(api: &Api<AcrPullBinding>, binding: &AcrPullBinding) -> Result<()> {
    if !binding.has_finalizer() {
        return Ok(());
    }

    let finalizers: Vec<String> = binding
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(api, binding, finalizers).await
}

/// The resource version makes the patch fail with a conflict if finalizers changed since
/// the binding was read.
async fn patch_finalizers(
    api: &Api<AcrPullBinding>,
    binding: &AcrPullBinding,
    finalizers: Vec<String>,
) -> Result<()> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": binding.resource_version(),
        }
    });

    api.patch(
        &binding.name_any(),
        &PatchParams {
            field_manager: Some(OPERATOR_NAME.to_string()),
            ..Default::default()
        },
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(())
}
