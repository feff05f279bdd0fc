// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Binding reconciler - keeps each binding's pull secret valid and attached.

use crate::authority::TokenAuthority;
use crate::cache::CredentialCache;
use crate::config::Config;
use crate::constants::{labels, OPERATOR_NAME};
use crate::error::{AcrPullError, Result, RetryPolicy};
use crate::reconcilers::schedule::{
    assess, random_jitter, refresh_delay, Assessment, BackoffPolicy, BackoffTracker,
    CredentialState,
};
use crate::reconcilers::status::{
    add_finalizer, failure_status, patch_status, ready_status, remove_finalizer,
};
use crate::sync::secrets::is_owned_by;
use crate::sync::{
    detach_everywhere, get_pull_secret, recorded_expiry, recorded_scope, render_pull_secret,
    sync_attachments, sync_pull_secret, SyncOutcome,
};
use crate::types::{AcrPullBinding, AcrPullBindingStatus, BindingKey, IssuedToken, ResolvedBinding};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    runtime::{controller, controller::Action, Controller},
    Api, Client, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub struct BindingReconciler {
    client: Client,
    config: Config,
    authority: Arc<dyn TokenAuthority>,
    cache: CredentialCache,
    backoff: BackoffTracker,
    policy: BackoffPolicy,
    jitter: fn() -> f64,
}

/// Result of a successful convergence
struct Converged {
    status: AcrPullBindingStatus,
    requeue_after: Duration,
}

impl BindingReconciler {
    pub fn new(client: Client, config: Config, authority: Arc<dyn TokenAuthority>) -> Self {
        let policy = BackoffPolicy::new(config.backoff_base, config.backoff_max);
        Self {
            client,
            config,
            authority,
            cache: CredentialCache::new(),
            backoff: BackoffTracker::default(),
            policy,
            jitter: random_jitter,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let bindings: Api<AcrPullBinding> = Api::all(self.client.clone());
        let secrets: Api<Secret> = Api::all(self.client.clone());
        let owned = WatcherConfig::default()
            .labels(&format!("{}={}", labels::MANAGED_BY, OPERATOR_NAME));
        let concurrency = self.config.reconcile_concurrency;
        let context = Arc::new(self);

        info!(concurrency, "Starting binding controller");

        Controller::new(bindings, WatcherConfig::default())
            .owns(secrets, owned)
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok((binding, _)) => debug!("Reconciled binding: {}", binding),
                    Err(e) => warn!("Reconciliation error: {}", e),
                }
            })
            .await;

        info!("Binding controller stopped");
        Ok(())
    }

    /// Reconcile one binding as of `now`
    pub async fn reconcile_at(&self, binding: &AcrPullBinding, now: DateTime<Utc>) -> Result<Action> {
        let key = BindingKey::for_binding(binding)?;
        let api: Api<AcrPullBinding> = Api::namespaced(self.client.clone(), &key.namespace);

        if binding.is_deleting() {
            return self.release(&api, binding, &key).await;
        }

        add_finalizer(&api, binding).await?;

        match self.converge(binding, &key, now).await {
            Ok(done) => {
                self.backoff.reset(&key);
                patch_status(&api, binding, done.status).await?;
                debug!(binding = %key, requeue_after = ?done.requeue_after, "Credential is current");
                Ok(Action::requeue(done.requeue_after))
            }
            Err(err) => {
                warn!(binding = %key, error = %err, "Failed to refresh pull credential");
                let action = self.failure_action(&key, &err);
                patch_status(&api, binding, failure_status(binding, &err)).await?;
                Ok(action)
            }
        }
    }

    async fn converge(
        &self,
        binding: &AcrPullBinding,
        key: &BindingKey,
        now: DateTime<Utc>,
    ) -> Result<Converged> {
        let resolved = binding.resolve(&self.config)?;
        let margin = self.config.renewal_margin;

        let owner_uid = binding.uid().unwrap_or_default();
        let scope = resolved.token_scope();
        let secret_expiry = get_pull_secret(&self.client, &key.namespace, &resolved.secret_name)
            .await?
            .filter(|s| is_owned_by(s, &owner_uid) && recorded_scope(s) == Some(scope.as_str()))
            .and_then(|s| recorded_expiry(&s));
        let cached = self.cache.get(key);
        let state = CredentialState {
            cached: cached.as_ref(),
            status: binding.status.as_ref(),
            secret_expiry,
        };

        let (expires_at, refreshed_at) = match assess(&state, &resolved, now, margin) {
            Assessment::Cached(token) => {
                let outcome = self.write_secret(binding, &resolved, &token).await?;
                (outcome.held_expiry(token.expires_at), None)
            }
            Assessment::Recorded(expires_at) => {
                debug!(binding = %key, %expires_at, "Using token recorded in status");
                (expires_at, None)
            }
            assessment => {
                info!(binding = %key, ?assessment, server = %resolved.acr_server, "Issuing registry token");
                let token = self.issue(&resolved).await?;
                self.cache.put(key.clone(), token.clone());
                let outcome = self.write_secret(binding, &resolved, &token).await?;
                (outcome.held_expiry(token.expires_at), Some(token.issued_at))
            }
        };

        sync_attachments(
            &self.client,
            &key.namespace,
            &resolved.service_accounts,
            &resolved.secret_name,
        )
        .await?;

        // a renamed secret stays recorded in status until it is detached everywhere
        if let Some(previous) = binding
            .status
            .as_ref()
            .and_then(|s| s.secret_name.as_deref())
            .filter(|name| *name != resolved.secret_name)
        {
            let changes = detach_everywhere(&self.client, &key.namespace, previous).await?;
            info!(binding = %key, secret = previous, detached = ?changes.detached, "Detached renamed pull secret");
        }

        Ok(Converged {
            status: ready_status(binding, &resolved, expires_at, refreshed_at),
            requeue_after: refresh_delay(expires_at, margin, now, self.config.min_requeue),
        })
    }

    /// Both exchanges together may take twice the per-request bound
    async fn issue(&self, resolved: &ResolvedBinding) -> Result<IssuedToken> {
        let bound = self.config.authority_timeout.saturating_mul(2);
        tokio::time::timeout(
            bound,
            self.authority.issue(&resolved.identity, &resolved.acr_server),
        )
        .await
        .unwrap_or_else(|_| {
            Err(AcrPullError::TransientNetwork(format!(
                "token issuance did not complete within {:?}",
                bound
            )))
        })
    }

    async fn write_secret(
        &self,
        binding: &AcrPullBinding,
        resolved: &ResolvedBinding,
        token: &IssuedToken,
    ) -> Result<SyncOutcome> {
        let desired = render_pull_secret(binding, resolved, token)?;
        let outcome = sync_pull_secret(&self.client, &desired).await?;
        debug!(binding = %resolved.key, ?outcome, "Synced pull secret");
        Ok(outcome)
    }

    /// Detach the secret and drop in-memory state; the secret itself goes with the
    /// binding through its owner reference.
    async fn release(
        &self,
        api: &Api<AcrPullBinding>,
        binding: &AcrPullBinding,
        key: &BindingKey,
    ) -> Result<Action> {
        if !binding.has_finalizer() {
            return Ok(Action::await_change());
        }

        let mut secret_names = vec![binding.secret_name()];
        if let Some(recorded) = binding.status.as_ref().and_then(|s| s.secret_name.clone()) {
            if !secret_names.contains(&recorded) {
                secret_names.push(recorded);
            }
        }

        let mut detached = Vec::new();
        for secret_name in &secret_names {
            let changes = detach_everywhere(&self.client, &key.namespace, secret_name).await?;
            detached.extend(changes.detached);
        }
        self.cache.invalidate(key);
        self.backoff.reset(key);
        remove_finalizer(api, binding).await?;

        info!(binding = %key, ?detached, "Released binding");
        Ok(Action::await_change())
    }

    fn failure_action(&self, key: &BindingKey, err: &AcrPullError) -> Action {
        match err.retry_policy() {
            RetryPolicy::Backoff => {
                let attempt = self.backoff.record_failure(key);
                Action::requeue(self.policy.delay(attempt, (self.jitter)()))
            }
            RetryPolicy::FixedInterval => Action::requeue(self.config.error_requeue),
            RetryPolicy::AwaitSpecChange => Action::await_change(),
        }
    }
}

#[instrument(skip(binding, ctx), fields(binding = %format!("{}/{}", binding.namespace().unwrap_or_default(), binding.name_any())))]
async fn reconcile(binding: Arc<AcrPullBinding>, ctx: Arc<BindingReconciler>) -> Result<Action> {
    ctx.reconcile_at(&binding, Utc::now()).await
}

fn error_policy(
    binding: Arc<AcrPullBinding>,
    error: &AcrPullError,
    ctx: Arc<BindingReconciler>,
) -> Action {
    warn!("Reconciliation error: {}", error);
    match BindingKey::for_binding(&binding) {
        Ok(key) => ctx.failure_action(&key, error),
        Err(_) => Action::requeue(ctx.config.error_requeue),
    }
}
