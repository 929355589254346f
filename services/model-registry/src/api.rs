//! HTTP surface. Caller identity comes from headers set by the upstream
//! gateway; every response carries the request's correlation id.

use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::QueryRejection, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};

use crate::access::AccessContext;
use crate::deployment::{DeploymentService, HistoryQuery, StatusUpdate, TriggerRequest};
use crate::error::RegistryError;
use crate::health::{HealthAggregator, HealthStatus};
use crate::model::ModelMetadata;
use crate::versions::{ListFilter, ModelVersionService, RegisterRequest};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TEAM_HEADER: &str = "x-team-id";
pub const SCOPES_HEADER: &str = "x-scopes";

#[derive(Clone)]
pub struct AppState {
    pub versions: Arc<ModelVersionService>,
    pub deployments: Arc<DeploymentService>,
    pub health: Arc<HealthAggregator>,
}

/// Correlation id stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn correlate(mut req: Request, next: Next) -> Response {
    let id = req.headers().get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));
    let span = info_span!("request", request_id=%id, method=%req.method(), path=%req.uri().path());
    let started = Instant::now();
    let mut resp = next.run(req).instrument(span.clone()).await;
    if let Ok(v) = HeaderValue::from_str(&id) { resp.headers_mut().insert(REQUEST_ID_HEADER, v); }
    span.in_scope(|| info!(status = resp.status().as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "request_completed"));
    resp
}

fn error_body(status: StatusCode, kind: &str, message: &str, details: Option<Value>, request_id: &str) -> Response {
    let mut body = json!({ "error": kind, "message": message, "requestId": request_id });
    if let Some(d) = details { body["details"] = d; }
    (status, Json(body)).into_response()
}

pub struct ApiError { error: RegistryError, request_id: String }

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() { error!(request_id=%self.request_id, error=%self.error, "request_failed"); }
        let message = self.error.to_string();
        match &self.error {
            RegistryError::Validation { details, .. } => error_body(status, self.error.kind(), &message, Some(json!(details)), &self.request_id),
            other => error_body(status, other.kind(), &message, None, &self.request_id),
        }
    }
}

/// Authenticated caller plus the request's correlation id.
pub struct Caller { pub ctx: AccessContext, pub request_id: String }

impl Caller {
    fn fail(&self) -> impl Fn(RegistryError) -> ApiError + '_ {
        move |error| ApiError { error, request_id: self.request_id.clone() }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts.extensions.get::<RequestId>().map(|r| r.0.clone()).unwrap_or_default();
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty());
        let Some(team) = header(TEAM_HEADER) else {
            return Err(error_body(StatusCode::UNAUTHORIZED, "Unauthenticated", "missing caller identity", None, &request_id));
        };
        let scopes: Vec<&str> = header(SCOPES_HEADER).map(|s| s.split(',').map(str::trim).collect()).unwrap_or_default();
        Ok(Caller { ctx: AccessContext::new(team, scopes), request_id })
    }
}

/// Empty bodies deserialize as `T::default()`.
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, RegistryError> {
    if body.iter().all(u8::is_ascii_whitespace) { return Ok(T::default()); }
    serde_json::from_slice(body).map_err(|e| RegistryError::validation("body", e.to_string()))
}

fn required_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, RegistryError> {
    serde_json::from_slice(body).map_err(|e| RegistryError::validation("body", e.to_string()))
}

fn query<T>(q: Result<Query<T>, QueryRejection>) -> Result<T, RegistryError> {
    q.map(|Query(v)| v).map_err(|e| RegistryError::validation("query", e.body_text()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/models", post(register).get(list_models))
        .route("/models/:model_id/versions", get(list_versions))
        .route("/models/:model_id/latest", get(get_latest))
        .route("/models/:model_id/versions/:version", get(get_version).delete(deregister))
        .route("/models/:model_id/versions/:version/metadata", put(update_metadata))
        .route("/models/:model_id/versions/:version/deployments", post(trigger_deployment))
        .route("/deployments", get(deployment_history))
        .route("/deployments/:deployment_id/status", post(update_deployment_status))
        .route("/deployments/:deployment_id/cancel", post(cancel_deployment))
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(middleware::from_fn(correlate))
}

async fn register(State(s): State<AppState>, caller: Caller, body: Bytes) -> Result<Response, ApiError> {
    let req: RegisterRequest = required_body(&body).map_err(caller.fail())?;
    let v = s.versions.register(&caller.ctx, req).await.map_err(caller.fail())?;
    Ok((StatusCode::CREATED, Json(v)).into_response())
}

async fn list_models(State(s): State<AppState>, caller: Caller, q: Result<Query<ListFilter>, QueryRejection>) -> Result<Response, ApiError> {
    let filter = query(q).map_err(caller.fail())?;
    let page = s.versions.list(&caller.ctx, filter).await.map_err(caller.fail())?;
    Ok(Json(page).into_response())
}

async fn list_versions(State(s): State<AppState>, caller: Caller, Path(model_id): Path<String>) -> Result<Response, ApiError> {
    let items = s.versions.list_versions(&caller.ctx, &model_id).await.map_err(caller.fail())?;
    Ok(Json(json!({ "modelId": model_id, "items": items })).into_response())
}

async fn get_latest(State(s): State<AppState>, caller: Caller, Path(model_id): Path<String>) -> Result<Response, ApiError> {
    let v = s.versions.get_latest(&caller.ctx, &model_id).await.map_err(caller.fail())?;
    Ok(Json(v).into_response())
}

async fn get_version(State(s): State<AppState>, caller: Caller, Path((model_id, version)): Path<(String, String)>) -> Result<Response, ApiError> {
    let v = s.versions.get_version(&caller.ctx, &model_id, &version).await.map_err(caller.fail())?;
    Ok(Json(v).into_response())
}

async fn update_metadata(State(s): State<AppState>, caller: Caller, Path((model_id, version)): Path<(String, String)>, body: Bytes) -> Result<Response, ApiError> {
    let metadata: ModelMetadata = required_body(&body).map_err(caller.fail())?;
    let v = s.versions.update_metadata(&caller.ctx, &model_id, &version, metadata).await.map_err(caller.fail())?;
    Ok(Json(v).into_response())
}

async fn deregister(State(s): State<AppState>, caller: Caller, Path((model_id, version)): Path<(String, String)>) -> Result<Response, ApiError> {
    s.versions.deregister(&caller.ctx, &model_id, &version).await.map_err(caller.fail())?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn trigger_deployment(State(s): State<AppState>, caller: Caller, Path((model_id, version)): Path<(String, String)>, body: Bytes) -> Result<Response, ApiError> {
    let req: TriggerRequest = json_body(&body).map_err(caller.fail())?;
    let receipt = s.deployments.trigger_deployment(&caller.ctx, &model_id, &version, req).await.map_err(caller.fail())?;
    Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
}

async fn update_deployment_status(State(s): State<AppState>, caller: Caller, Path(deployment_id): Path<String>, body: Bytes) -> Result<Response, ApiError> {
    let update: StatusUpdate = required_body(&body).map_err(caller.fail())?;
    let entry = s.deployments.update_deployment_status(&caller.ctx, &deployment_id, update).await.map_err(caller.fail())?;
    Ok(Json(entry).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest { #[serde(default)] reason: Option<String> }

async fn cancel_deployment(State(s): State<AppState>, caller: Caller, Path(deployment_id): Path<String>, body: Bytes) -> Result<Response, ApiError> {
    let req: CancelRequest = json_body(&body).map_err(caller.fail())?;
    let entry = s.deployments.cancel_deployment(&caller.ctx, &deployment_id, req.reason).await.map_err(caller.fail())?;
    Ok(Json(entry).into_response())
}

async fn deployment_history(State(s): State<AppState>, caller: Caller, q: Result<Query<HistoryQuery>, QueryRejection>) -> Result<Response, ApiError> {
    let hq = query(q).map_err(caller.fail())?;
    let items = s.deployments.get_history(&caller.ctx, hq).await.map_err(caller.fail())?;
    Ok(Json(json!({ "items": items })).into_response())
}

fn health_code(status: HealthStatus) -> StatusCode {
    if status == HealthStatus::Unhealthy { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK }
}

async fn health(State(s): State<AppState>) -> Response {
    let snapshot = s.health.check().await;
    (health_code(snapshot.status), Json(snapshot)).into_response()
}

async fn live(State(s): State<AppState>) -> Response {
    let mut simple = s.health.simple_check().await;
    if !registry_core::is_live() { simple.status = HealthStatus::Unhealthy; }
    (health_code(simple.status), Json(simple)).into_response()
}

async fn ready() -> Response {
    let ready = registry_core::is_ready();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "ready": ready }))).into_response()
}

async fn metrics() -> Response {
    match registry_core::render_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "InternalError", "message": e.to_string() }))).into_response(),
    }
}
