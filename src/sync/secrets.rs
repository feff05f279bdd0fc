// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Pull secret rendering and create-or-update

use crate::constants::{annotations, labels, secret, OPERATOR_NAME};
use crate::error::{is_conflict, AcrPullError, Result};
use crate::types::binding::{format_time, parse_time};
use crate::types::{AcrPullBinding, IssuedToken, ResolvedBinding};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Result of a pull secret sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    /// The secret already holds this token
    Unchanged,
    /// The secret holds a token for the same scope expiring later than the one offered
    Superseded(DateTime<Utc>),
}

impl SyncOutcome {
    /// Expiry of the token the secret holds once `offered` was synced
    pub fn held_expiry(&self, offered: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            SyncOutcome::Superseded(held) => *held,
            _ => offered,
        }
    }
}

#[derive(Serialize)]
struct DockerConfig<'a> {
    auths: BTreeMap<&'a str, DockerAuth<'a>>,
}

#[derive(Serialize)]
struct DockerAuth<'a> {
    username: &'a str,
    password: &'a str,
    auth: String,
}

/// Render the registry client config for a token
pub fn docker_config_json(token: &IssuedToken) -> Result<Vec<u8>> {
    let auth = STANDARD.encode(format!("{}:{}", token.username, token.password()));
    let config = DockerConfig {
        auths: BTreeMap::from([(
            token.registry_server.as_str(),
            DockerAuth {
                username: &token.username,
                password: token.password(),
                auth,
            },
        )]),
    };

    Ok(serde_json::to_vec(&config)?)
}

/// Build the desired pull secret for a binding, owned by the binding
pub fn render_pull_secret(
    binding: &AcrPullBinding,
    resolved: &ResolvedBinding,
    token: &IssuedToken,
) -> Result<Secret> {
    let owner = binding.controller_owner_ref(&()).ok_or_else(|| {
        AcrPullError::InvalidBindingSpec(format!("binding {} has no uid yet", resolved.key))
    })?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(resolved.secret_name.clone()),
            namespace: Some(resolved.key.namespace.clone()),
            labels: Some(BTreeMap::from([
                (labels::MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
                (labels::BINDING.to_string(), resolved.key.name.clone()),
            ])),
            annotations: Some(BTreeMap::from([
                (annotations::TOKEN_EXPIRY.to_string(), format_time(token.expires_at)),
                (annotations::TOKEN_SCOPE.to_string(), token.scope()),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            secret::DATA_KEY.to_string(),
            ByteString(docker_config_json(token)?),
        )])),
        type_: Some(secret::TYPE.to_string()),
        ..Default::default()
    })
}

/// Token expiry recorded on a pull secret
pub fn recorded_expiry(secret: &Secret) -> Option<DateTime<Utc>> {
    secret
        .annotations()
        .get(annotations::TOKEN_EXPIRY)
        .and_then(|v| parse_time(v))
}

/// Registry server and identity the token on a pull secret was issued for
pub fn recorded_scope(secret: &Secret) -> Option<&str> {
    secret
        .annotations()
        .get(annotations::TOKEN_SCOPE)
        .map(String::as_str)
}

/// Whether the secret carries an owner reference with the given uid
pub fn is_owned_by(secret: &Secret, owner_uid: &str) -> bool {
    secret.owner_references().iter().any(|o| o.uid == owner_uid)
}

/// Read a pull secret, `None` when it does not exist
pub async fn get_pull_secret(client: &Client, namespace: &str, name: &str) -> Result<Option<Secret>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    Ok(secrets.get_opt(name).await?)
}

/// Create or update `desired`, re-reading on optimistic-concurrency conflicts.
///
/// An existing secret is only replaced when it is owned by the same binding and differs
/// from `desired`. Within one scope a secret recording a later expiry is kept; a secret
/// recorded for another registry or identity is always replaced.
#[instrument(skip(client, desired), fields(secret = %desired.name_any()))]
pub async fn sync_pull_secret(client: &Client, desired: &Secret) -> Result<SyncOutcome> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let owner_uid = desired
        .owner_references()
        .first()
        .map(|o| o.uid.clone())
        .unwrap_or_default();
    let pp = PostParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    };

    for attempt in 1..=secret::CONFLICT_RETRIES {
        let Some(existing) = secrets.get_opt(&name).await? else {
            match secrets.create(&pp, desired).await {
                Ok(_) => {
                    info!("Created pull secret {}/{}", namespace, name);
                    return Ok(SyncOutcome::Created);
                }
                Err(e) if is_conflict(&e) => {
                    debug!(attempt, "Pull secret appeared concurrently, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if !is_owned_by(&existing, &owner_uid) {
            return Err(AcrPullError::StoreFatal(format!(
                "secret {}/{} exists and is not owned by this binding",
                namespace, name
            )));
        }

        let same_scope =
            recorded_scope(&existing).is_some() && recorded_scope(&existing) == recorded_scope(desired);
        if same_scope {
            if let (Some(held), Some(offered)) = (recorded_expiry(&existing), recorded_expiry(desired)) {
                if held > offered {
                    debug!(%held, %offered, "Pull secret holds a newer token");
                    return Ok(SyncOutcome::Superseded(held));
                }
            }
        }

        if is_up_to_date(&existing, desired) {
            return Ok(SyncOutcome::Unchanged);
        }

        let mut updated = existing;
        updated.data = desired.data.clone();
        updated.type_ = desired.type_.clone();
        updated.labels_mut().extend(desired.labels().clone());
        updated.annotations_mut().extend(desired.annotations().clone());

        match secrets.replace(&name, &pp, &updated).await {
            Ok(_) => {
                info!("Updated pull secret {}/{}", namespace, name);
                return Ok(SyncOutcome::Updated);
            }
            Err(e) if is_conflict(&e) => {
                debug!(attempt, "Pull secret changed concurrently, re-reading");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(AcrPullError::StoreConflict(format!(
        "secret {}/{} kept changing after {} attempts",
        namespace,
        name,
        secret::CONFLICT_RETRIES
    )))
}

fn is_up_to_date(existing: &Secret, desired: &Secret) -> bool {
    let contains = |have: &BTreeMap<String, String>, want: &BTreeMap<String, String>| {
        want.iter().all(|(k, v)| have.get(k) == Some(v))
    };

    existing.data == desired.data
        && existing.type_ == desired.type_
        && contains(existing.labels(), desired.labels())
        && contains(existing.annotations(), desired.annotations())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{secret_path, MockService};
    use crate::types::{AcrPullBindingSpec, BindingKey, ManagedIdentity};
    use chrono::TimeZone;

    const CLIENT_ID: &str = "1b461305-28be-5271-beda-bd9fd2e24251";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000 + secs, 0).unwrap()
    }

    fn make_binding(uid: &str) -> AcrPullBinding {
        let mut binding = AcrPullBinding::new("pull", AcrPullBindingSpec::default());
        binding.metadata.namespace = Some("apps".to_string());
        binding.metadata.uid = Some(uid.to_string());
        binding
    }

    fn make_resolved() -> ResolvedBinding {
        ResolvedBinding {
            key: BindingKey::new("apps", "pull"),
            identity: ManagedIdentity::ClientId(CLIENT_ID.to_string()),
            acr_server: "registry.example.com".to_string(),
            secret_name: "pull-msi-acrpull-secret".to_string(),
            service_accounts: vec!["default".to_string()],
        }
    }

    fn make_token(password: &str, expires: i64) -> IssuedToken {
        IssuedToken::new(
            ManagedIdentity::ClientId(CLIENT_ID.to_string()),
            "registry.example.com",
            password,
            at(0),
            at(expires),
        )
        .unwrap()
    }

    fn desired(password: &str, expires: i64) -> Secret {
        render_pull_secret(&make_binding("uid-pull"), &make_resolved(), &make_token(password, expires))
            .unwrap()
    }

    fn stored_password(mock: &MockService) -> String {
        let stored: Secret =
            serde_json::from_value(mock.object(&secret_path("apps", "pull-msi-acrpull-secret")).unwrap())
                .unwrap();
        let raw = &stored.data.unwrap()[secret::DATA_KEY].0;
        let config: serde_json::Value = serde_json::from_slice(raw).unwrap();
        config["auths"]["registry.example.com"]["password"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_docker_config_layout() {
        let raw = docker_config_json(&make_token("t0ken", 3600)).unwrap();
        let config: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let entry = &config["auths"]["registry.example.com"];

        assert_eq!(entry["username"], secret::TOKEN_USERNAME);
        assert_eq!(entry["password"], "t0ken");
        assert_eq!(
            entry["auth"],
            STANDARD.encode(format!("{}:t0ken", secret::TOKEN_USERNAME))
        );
    }

    #[test]
    fn test_render_pull_secret_metadata() {
        let secret = desired("t0ken", 3600);

        assert_eq!(secret.type_.as_deref(), Some(secret::TYPE));
        assert_eq!(secret.labels()[labels::MANAGED_BY], OPERATOR_NAME);
        assert_eq!(secret.labels()[labels::BINDING], "pull");
        assert_eq!(recorded_expiry(&secret), Some(at(3600)));
        assert_eq!(recorded_scope(&secret), Some(make_resolved().token_scope().as_str()));

        let owner = &secret.owner_references()[0];
        assert_eq!(owner.kind, "AcrPullBinding");
        assert_eq!(owner.uid, "uid-pull");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_render_requires_binding_uid() {
        let mut binding = make_binding("uid-pull");
        binding.metadata.uid = None;

        let err = render_pull_secret(&binding, &make_resolved(), &make_token("t0ken", 3600))
            .unwrap_err();
        assert!(matches!(err, AcrPullError::InvalidBindingSpec(_)));
    }

    #[tokio::test]
    async fn test_creates_missing_secret() {
        let mock = MockService::new();

        let outcome = sync_pull_secret(&mock.client(), &desired("t0ken", 3600)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Created);
        assert_eq!(stored_password(&mock), "t0ken");
    }

    #[tokio::test]
    async fn test_second_sync_is_a_no_op() {
        let mock = MockService::new();
        let client = mock.client();
        sync_pull_secret(&client, &desired("t0ken", 3600)).await.unwrap();
        mock.clear_requests();

        let outcome = sync_pull_secret(&client, &desired("t0ken", 3600)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_renewal_replaces_in_place() {
        let mock = MockService::new();
        let client = mock.client();
        sync_pull_secret(&client, &desired("old", 3600)).await.unwrap();

        let outcome = sync_pull_secret(&client, &desired("new", 7200)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Updated);
        assert_eq!(stored_password(&mock), "new");
        assert_eq!(mock.count("PUT", &secret_path("apps", "pull-msi-acrpull-secret")), 1);
    }

    #[tokio::test]
    async fn test_older_token_never_overwrites_newer() {
        let mock = MockService::new();
        let client = mock.client();
        sync_pull_secret(&client, &desired("newer", 7200)).await.unwrap();

        let outcome = sync_pull_secret(&client, &desired("older", 3600)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Superseded(at(7200)));
        assert_eq!(outcome.held_expiry(at(3600)), at(7200));
        assert_eq!(stored_password(&mock), "newer");
    }

    #[tokio::test]
    async fn test_scope_change_replaces_longer_lived_token() {
        let mock = MockService::new();
        let client = mock.client();
        sync_pull_secret(&client, &desired("old-registry", 7200)).await.unwrap();

        let resolved = ResolvedBinding {
            acr_server: "other.example.com".to_string(),
            ..make_resolved()
        };
        let token = IssuedToken::new(
            resolved.identity.clone(),
            "other.example.com",
            "new-registry",
            at(100),
            at(1900),
        )
        .unwrap();
        let desired = render_pull_secret(&make_binding("uid-pull"), &resolved, &token).unwrap();

        let outcome = sync_pull_secret(&client, &desired).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Updated);
        let stored: Secret = serde_json::from_value(
            mock.object(&secret_path("apps", "pull-msi-acrpull-secret")).unwrap(),
        )
        .unwrap();
        assert_eq!(recorded_expiry(&stored), Some(at(1900)));
        assert_eq!(recorded_scope(&stored), Some(resolved.token_scope().as_str()));
        let config: serde_json::Value =
            serde_json::from_slice(&stored.data.unwrap()[secret::DATA_KEY].0).unwrap();
        let servers: Vec<&String> = config["auths"].as_object().unwrap().keys().collect();
        assert_eq!(servers, vec!["other.example.com"]);
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let mock = MockService::new();
        let client = mock.client();
        sync_pull_secret(&client, &desired("old", 3600)).await.unwrap();
        mock.fail_next("PUT", &secret_path("apps", "pull-msi-acrpull-secret"), 409);

        let outcome = sync_pull_secret(&client, &desired("new", 7200)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Updated);
        assert_eq!(mock.count("PUT", &secret_path("apps", "pull-msi-acrpull-secret")), 2);
        assert_eq!(stored_password(&mock), "new");
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces() {
        let mock = MockService::new();
        let client = mock.client();
        sync_pull_secret(&client, &desired("old", 3600)).await.unwrap();
        for _ in 0..secret::CONFLICT_RETRIES {
            mock.fail_next("PUT", &secret_path("apps", "pull-msi-acrpull-secret"), 409);
        }

        let err = sync_pull_secret(&client, &desired("new", 7200)).await.unwrap_err();

        assert!(matches!(err, AcrPullError::StoreConflict(_)));
        assert_eq!(stored_password(&mock), "old");
    }

    #[tokio::test]
    async fn test_foreign_secret_is_not_overwritten() {
        let mock = MockService::new().with_object(
            &secret_path("apps", "pull-msi-acrpull-secret"),
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": { "name": "pull-msi-acrpull-secret", "namespace": "apps" },
                "type": "Opaque",
                "data": { "token": "aGFuZHMgb2Zm" }
            }),
        );

        let err = sync_pull_secret(&mock.client(), &desired("t0ken", 3600))
            .await
            .unwrap_err();

        assert!(matches!(err, AcrPullError::StoreFatal(_)));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_write_is_fatal() {
        let mock = MockService::new();
        mock.fail_next("POST", "/api/v1/namespaces/apps/secrets", 403);

        let err = sync_pull_secret(&mock.client(), &desired("t0ken", 3600))
            .await
            .unwrap_err();

        assert!(matches!(err, AcrPullError::StoreFatal(_)));
    }
}
