// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Liveness and readiness probes backed by an API server reachability check.

use crate::error::Result;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Secret;
use kube::{api::ListParams, Api, Client};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn check(&self) -> Result<()>;
}

/// Reachable when the API server answers a one-item secret list
pub struct ApiServerCheck {
    client: Client,
}

impl ApiServerCheck {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReachabilityCheck for ApiServerCheck {
    async fn check(&self) -> Result<()> {
        let secrets: Api<Secret> = Api::all(self.client.clone());
        secrets.list(&ListParams::default().limit(1)).await?;
        Ok(())
    }
}

pub async fn probe_response(path: &str, check: &dyn ReachabilityCheck) -> (StatusCode, String) {
    match path {
        "/healthz" | "/readyz" => match check.check().await {
            Ok(()) => (StatusCode::OK, "ok".to_string()),
            Err(e) => {
                warn!("Health probe {} failed: {}", path, e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        _ => (StatusCode::NOT_FOUND, "not found".to_string()),
    }
}

/// Bind `addr` and answer probes until the process exits
pub async fn serve_probes(addr: SocketAddr, check: Arc<dyn ReachabilityCheck>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health probe address {}", addr))?;
    info!("Serving health probes on {}", addr);
    serve_on(listener, check).await
}

async fn serve_on(listener: TcpListener, check: Arc<dyn ReachabilityCheck>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept probe connection: {}", e);
                continue;
            }
        };

        let check = check.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let check = check.clone();
                async move {
                    let (status, body) = probe_response(req.uri().path(), check.as_ref()).await;
                    Response::builder()
                        .status(status)
                        .header("content-type", "text/plain")
                        .body(Full::new(Bytes::from(body)))
                }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Probe connection from {} ended: {}", peer, e);
            }
        });
    }
}
