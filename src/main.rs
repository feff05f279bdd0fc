// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use msi_acrpull::authority::{HttpTokenExchange, ManagedIdentityAuthority};
use msi_acrpull::config::Config;
use msi_acrpull::health::{serve_probes, ApiServerCheck};
use msi_acrpull::kubernetes::wait_for_binding_crd;
use msi_acrpull::reconcilers::BindingReconciler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting msi-acrpull operator");

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        "Configuration loaded: default_acr_server={:?}, default_identity={:?}, renewal_margin={:?}",
        config.default_acr_server, config.default_identity, config.renewal_margin
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    // Serve probes while waiting so the pod is not restarted before the CRD is installed
    let probes = tokio::spawn(serve_probes(
        config.health_probe_addr,
        Arc::new(ApiServerCheck::new(client.clone())),
    ));

    info!("Waiting for AcrPullBinding CRD to become available...");
    wait_for_binding_crd(&client).await?;

    let exchange = HttpTokenExchange::new(config.imds_endpoint.clone(), config.authority_timeout)
        .context("failed to build token authority HTTP client")?;
    let authority = Arc::new(ManagedIdentityAuthority::new(exchange));
    let reconciler = BindingReconciler::new(client, config, authority);

    tokio::select! {
        result = reconciler.run() => {
            result?;
            info!("Binding controller shut down");
        }
        result = probes => {
            result.context("health probe server panicked")??;
            warn!("Health probe server stopped unexpectedly");
        }
    }

    Ok(())
}
