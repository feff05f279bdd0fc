// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Attaching pull secrets to service accounts

use crate::constants::{secret, OPERATOR_NAME};
use crate::error::{is_conflict, is_not_found, AcrPullError, Result};
use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use kube::{
    api::{ListParams, PostParams},
    Api, Client, ResourceExt,
};
use tracing::{debug, info, instrument};

/// Changes made while reconciling service account references
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attachments {
    pub attached: Vec<String>,
    pub detached: Vec<String>,
}

/// `refs` with `secret_name` appended, or `None` when already present
pub fn with_pull_secret(
    refs: &[LocalObjectReference],
    secret_name: &str,
) -> Option<Vec<LocalObjectReference>> {
    if refs.iter().any(|r| r.name == secret_name) {
        return None;
    }
    let mut refs = refs.to_vec();
    refs.push(LocalObjectReference {
        name: secret_name.to_string(),
    });
    Some(refs)
}

/// `refs` without `secret_name`, or `None` when absent
pub fn without_pull_secret(
    refs: &[LocalObjectReference],
    secret_name: &str,
) -> Option<Vec<LocalObjectReference>> {
    if !refs.iter().any(|r| r.name == secret_name) {
        return None;
    }
    Some(
        refs.iter()
            .filter(|r| r.name != secret_name)
            .cloned()
            .collect(),
    )
}

/// Make exactly `service_accounts` in `namespace` reference `secret_name`.
///
/// Missing references are appended, and references held by service accounts no longer
/// listed are removed. Entries belonging to other secrets are left in place and in order.
#[instrument(skip(client, service_accounts))]
pub async fn sync_attachments(
    client: &Client,
    namespace: &str,
    service_accounts: &[String],
    secret_name: &str,
) -> Result<Attachments> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let mut changes = Attachments::default();

    for name in service_accounts {
        if attach(&api, name, secret_name).await? {
            info!("Attached pull secret {} to service account {}/{}", secret_name, namespace, name);
            changes.attached.push(name.clone());
        }
    }

    let holders: Vec<String> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|sa| !service_accounts.contains(&sa.name_any()))
        .filter(|sa| references(sa, secret_name))
        .map(|sa| sa.name_any())
        .collect();

    for name in holders {
        if detach(&api, &name, secret_name).await? {
            info!("Detached pull secret {} from service account {}/{}", secret_name, namespace, name);
            changes.detached.push(name);
        }
    }

    Ok(changes)
}

/// Remove `secret_name` from every service account in `namespace`
pub async fn detach_everywhere(client: &Client, namespace: &str, secret_name: &str) -> Result<Attachments> {
    sync_attachments(client, namespace, &[], secret_name).await
}

fn references(sa: &ServiceAccount, secret_name: &str) -> bool {
    sa.image_pull_secrets
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.name == secret_name)
}

async fn attach(api: &Api<ServiceAccount>, name: &str, secret_name: &str) -> Result<bool> {
    update_pull_secrets(api, name, |refs| with_pull_secret(refs, secret_name))
        .await
        .map_err(|e| match e {
            UpdateError::NotFound => AcrPullError::MissingServiceAccount(name.to_string()),
            UpdateError::Failed(e) => e,
        })
}

async fn detach(api: &Api<ServiceAccount>, name: &str, secret_name: &str) -> Result<bool> {
    match update_pull_secrets(api, name, |refs| without_pull_secret(refs, secret_name)).await {
        Ok(changed) => Ok(changed),
        Err(UpdateError::NotFound) => Ok(false),
        Err(UpdateError::Failed(e)) => Err(e),
    }
}

enum UpdateError {
    NotFound,
    Failed(AcrPullError),
}

impl From<kube::Error> for UpdateError {
    fn from(err: kube::Error) -> Self {
        if is_not_found(&err) {
            UpdateError::NotFound
        } else {
            UpdateError::Failed(err.into())
        }
    }
}

/// Read-modify-replace of `imagePullSecrets`, retried on conflicts
async fn update_pull_secrets<F>(
    api: &Api<ServiceAccount>,
    name: &str,
    change: F,
) -> std::result::Result<bool, UpdateError>
where
    F: Fn(&[LocalObjectReference]) -> Option<Vec<LocalObjectReference>>,
{
    let pp = PostParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    };

    for attempt in 1..=secret::CONFLICT_RETRIES {
        let mut sa = api.get(name).await?;
        let current = sa.image_pull_secrets.clone().unwrap_or_default();
        let Some(refs) = change(&current) else {
            return Ok(false);
        };

        sa.image_pull_secrets = Some(refs);
        match api.replace(name, &pp, &sa).await {
            Ok(_) => return Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!(attempt, "Service account {} changed concurrently, re-reading", name);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(UpdateError::Failed(AcrPullError::StoreConflict(format!(
        "service account {} kept changing after {} attempts",
        name,
        secret::CONFLICT_RETRIES
    ))))
}
