// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities for mocking the Kubernetes API server.
//!
//! [`MockService`] keeps objects in memory keyed by their request path and implements just
//! enough of the API semantics for the reconciler: GET of objects and collections, POST,
//! PUT guarded by `resourceVersion`, JSON merge PATCH (including `/status`) and DELETE.
//! Every request is recorded so tests can assert on writes.

use http::{Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A request seen by the mock API server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Value>,
    failures: VecDeque<(String, String, u16)>,
    requests: Vec<RecordedRequest>,
    resource_version: u64,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// An in-memory Kubernetes API server
#[derive(Clone, Default)]
pub struct MockService {
    state: Arc<Mutex<State>>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object at its resource path
    pub fn with_object(self, path: &str, mut object: Value) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            if object.pointer("/metadata/resourceVersion").is_none() {
                let rv = state.next_resource_version();
                object["metadata"]["resourceVersion"] = json!(rv);
            }
            state.objects.insert(path.to_string(), object);
        }
        self
    }

    /// Fail the next request matching method and path with the given status code
    pub fn fail_next(&self, method: &str, path: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push_back((method.to_string(), path.to_string(), status));
    }

    /// Build a kube Client from this mock service
    pub fn client(&self) -> Client {
        Client::new(self.clone(), "default")
    }

    /// Current stored version of an object
    pub fn object(&self, path: &str) -> Option<Value> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Requests that mutate state
    pub fn writes(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != "GET")
            .collect()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    fn handle(&self, method: &str, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut state = self.state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method: method.to_string(),
            path: path.to_string(),
            body: body.clone(),
        });

        if let Some(pos) = state
            .failures
            .iter()
            .position(|(m, p, _)| m == method && p == path)
        {
            if let Some((_, _, code)) = state.failures.remove(pos) {
                return (code, status_json(code, "injected failure"));
            }
        }

        let path = path.strip_suffix("/status").unwrap_or(path);
        match method {
            "GET" => match state.objects.get(path) {
                Some(object) => (200, object.clone()),
                None if is_collection(path) => (200, list_json(&state.objects, path)),
                None => not_found(path),
            },
            "POST" => {
                let mut object = body.unwrap_or_default();
                let name = object
                    .pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let target = format!("{}/{}", path, name);
                if state.objects.contains_key(&target) {
                    return (409, status_json(409, "already exists"));
                }
                let rv = state.next_resource_version();
                object["metadata"]["resourceVersion"] = json!(rv);
                if object.pointer("/metadata/uid").is_none() {
                    object["metadata"]["uid"] = json!(format!("uid-{}", name));
                }
                state.objects.insert(target, object.clone());
                (201, object)
            }
            "PUT" => {
                let Some(current) = state.objects.get(path) else {
                    return not_found(path);
                };
                let mut object = body.unwrap_or_default();
                let expected = current.pointer("/metadata/resourceVersion").cloned();
                if object.pointer("/metadata/resourceVersion").cloned() != expected {
                    return (409, status_json(409, "the object has been modified"));
                }
                let rv = state.next_resource_version();
                object["metadata"]["resourceVersion"] = json!(rv);
                state.objects.insert(path.to_string(), object.clone());
                (200, object)
            }
            "PATCH" => {
                let Some(mut object) = state.objects.get(path).cloned() else {
                    return not_found(path);
                };
                let patch = body.unwrap_or_default();
                if let Some(expected) = patch
                    .pointer("/metadata/resourceVersion")
                    .filter(|v| !v.is_null())
                {
                    if object.pointer("/metadata/resourceVersion") != Some(expected) {
                        return (409, status_json(409, "the object has been modified"));
                    }
                }
                merge(&mut object, &patch);
                let rv = state.next_resource_version();
                object["metadata"]["resourceVersion"] = json!(rv);
                state.objects.insert(path.to_string(), object.clone());
                (200, object)
            }
            "DELETE" => match state.objects.remove(path) {
                Some(object) => (200, object),
                None => not_found(path),
            },
            _ => (405, status_json(405, "method not allowed")),
        }
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let service = self.clone();

        Box::pin(async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let bytes = req.into_body().collect().await?.to_bytes();
            let body = if bytes.is_empty() {
                None
            } else {
                Some(serde_json::from_slice(&bytes)?)
            };

            let (status, body) = service.handle(&method, &path, body);
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?)
        })
    }
}

/// `/api/v1/namespaces/<ns>/<resource>` and cluster-scoped lists are collections
fn is_collection(path: &str) -> bool {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.iter().position(|s| *s == "namespaces") {
        Some(i) => segments.len() - i == 3,
        None => true,
    }
}

fn list_json(objects: &BTreeMap<String, Value>, collection: &str) -> Value {
    let prefix = format!("{}/", collection);
    let items: Vec<Value> = objects
        .iter()
        .filter(|(path, _)| path.starts_with(&prefix) && !path[prefix.len()..].contains('/'))
        .map(|(_, object)| object.clone())
        .collect();

    json!({ "kind": "List", "apiVersion": "v1", "metadata": {}, "items": items })
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn not_found(path: &str) -> (u16, Value) {
    (404, status_json(404, &format!("{} not found", path)))
}

fn status_json(code: u16, message: &str) -> Value {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        403 => "Forbidden",
        _ => "InternalError",
    };
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    })
}

pub fn secret_path(namespace: &str, name: &str) -> String {
    format!("/api/v1/namespaces/{}/secrets/{}", namespace, name)
}

pub fn service_account_path(namespace: &str, name: &str) -> String {
    format!("/api/v1/namespaces/{}/serviceaccounts/{}", namespace, name)
}

pub fn binding_path(namespace: &str, name: &str) -> String {
    format!(
        "/apis/msi-acrpull.microsoft.com/v1beta1/namespaces/{}/acrpullbindings/{}",
        namespace, name
    )
}

pub fn service_account_json(namespace: &str, name: &str, pull_secrets: &[&str]) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": { "name": name, "namespace": namespace },
        "imagePullSecrets": pull_secrets
            .iter()
            .map(|s| json!({ "name": s }))
            .collect::<Vec<_>>()
    })
}
