#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use model_registry::access::AccessContext;
use model_registry::adapters::{HttpBlobStore, MemoryEventBus};
use model_registry::config::RegistryConfig;
use model_registry::store::{KvStore, SledStore};
use model_registry::versions::RegisterRequest;
use model_registry::Services;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

pub struct TestContext {
    pub services: Services,
    pub store: Arc<dyn KvStore>,
    pub bus: MemoryEventBus,
    pub app: axum::Router,
}

pub fn build_test_context() -> TestContext {
    let store: Arc<dyn KvStore> = Arc::new(SledStore::temporary().expect("temporary sled"));
    let bus = MemoryEventBus::new();
    // s3 uris cannot be verified without an endpoint; registration logs and continues
    let blob = Arc::new(HttpBlobStore::new(None, Duration::from_millis(200)).expect("blob client"));
    let services = model_registry::assemble(&RegistryConfig::default(), store.clone(), Arc::new(bus.clone()), blob).expect("assemble");
    let app = model_registry::api::router(services.state.clone());
    TestContext { services, store, bus, app }
}

pub fn ctx(team: &str, scopes: &[&str]) -> AccessContext {
    AccessContext::new(team, scopes.iter().copied())
}

pub fn register_request(name: &str, version: &str) -> RegisterRequest {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "version": version,
        "framework": "pytorch",
        "artifactUri": format!("s3://models/{name}/{version}/model.pt"),
        "deploymentTarget": "sagemaker",
    }))
    .expect("register request")
}

pub async fn send(app: &axum::Router, method: &str, uri: &str, identity: Option<(&str, &str)>, body: Option<Value>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((team, scopes)) = identity {
        builder = builder.header("x-team-id", team).header("x-scopes", scopes);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(builder.body(body).expect("request")).await.expect("response");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    (status, headers, json)
}
