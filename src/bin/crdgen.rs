// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use kube::CustomResourceExt;
use msi_acrpull::types::AcrPullBinding;

fn main() -> Result<()> {
    let crd = serde_yaml::to_string(&AcrPullBinding::crd())
        .context("failed to render AcrPullBinding CRD")?;
    print!("{}", crd);
    Ok(())
}
