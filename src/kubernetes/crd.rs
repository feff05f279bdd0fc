// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CRD availability checking utilities

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::constants::API_GROUP;
use crate::error::Result;
use crate::types::AcrPullBinding;
use kube::{discovery::Discovery, Client, Resource};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Wait until the API server serves the AcrPullBinding resource.
/// Polls with exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_binding_crd(client: &Client) -> Result<()> {
    let mut interval = POLL_INTERVAL_SECS;
    let version = AcrPullBinding::version(&());

    loop {
        match binding_crd_served(client).await {
            Ok(true) => {
                info!("AcrPullBinding CRD ({}/{}) is available", API_GROUP, version);
                return Ok(());
            }
            Ok(false) => {
                info!(
                    "AcrPullBinding CRD ({}/{}) not yet available, waiting {} seconds...",
                    API_GROUP, version, interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for AcrPullBinding CRD: {}, retrying in {} seconds...",
                    e, interval
                );
            }
        }

        sleep(Duration::from_secs(interval)).await;
        interval = next_interval(interval);
    }
}

fn next_interval(interval: u64) -> u64 {
    (interval * 2).min(POLL_MAX_INTERVAL_SECS)
}

async fn binding_crd_served(client: &Client) -> Result<bool> {
    let discovery = Discovery::new(client.clone())
        .filter(&[API_GROUP])
        .run()
        .await?;

    let kind = AcrPullBinding::kind(&());
    let version = AcrPullBinding::version(&());
    let served = discovery
        .groups()
        .filter(|group| group.name() == API_GROUP)
        .flat_map(|group| group.recommended_resources())
        .any(|(ar, _)| ar.kind == kind && ar.version == version);
    Ok(served)
}
