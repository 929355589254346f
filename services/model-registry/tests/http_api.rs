mod common;

use axum::http::StatusCode;
use common::{build_test_context, send};
use serde_json::json;

const FRAUD: Option<(&str, &str)> = Some(("fraud", "models:read,models:write,models:deploy"));

fn register_body(name: &str, version: &str) -> serde_json::Value {
    json!({
        "name": name,
        "version": version,
        "framework": "xgboost",
        "artifactUri": format!("s3://models/{name}/{version}/model.bin"),
        "deploymentTarget": "kserve",
        "metadata": { "accuracy": 0.97, "tags": ["prod"] }
    })
}

#[tokio::test]
async fn register_deploy_and_report_over_http() {
    let t = build_test_context();
    let (status, headers, body) = send(&t.app, "POST", "/models", FRAUD, Some(register_body("Fraud Model", "1.0.0"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["modelId"], "fraud-model");
    assert!(headers.contains_key("x-request-id"));

    let (status, _, body) = send(&t.app, "POST", "/models", FRAUD, Some(register_body("Fraud Model", "1.0.0"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "DuplicateResource");

    let (status, _, body) = send(&t.app, "POST", "/models/fraud-model/versions/1.0.0/deployments", FRAUD, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let deployment_id = body["deploymentId"].as_str().unwrap().to_string();
    assert_eq!(body["status"], "INITIATED");

    let (status, _, body) = send(&t.app, "POST", &format!("/deployments/{deployment_id}/status"), FRAUD, Some(json!({ "status": "DEPLOYED" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["seq"], 1);

    let (_, _, body) = send(&t.app, "GET", "/models/fraud-model/versions/1.0.0", FRAUD, None).await;
    assert_eq!(body["status"], "DEPLOYED");

    let (status, _, body) = send(&t.app, "GET", "/deployments?modelId=fraud-model&version=1.0.0", FRAUD, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (status, _, body) = send(&t.app, "POST", &format!("/deployments/{deployment_id}/cancel"), FRAUD, Some(json!({ "reason": "late" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "InvalidTransition");
}

#[tokio::test]
async fn identity_and_masking() {
    let t = build_test_context();
    send(&t.app, "POST", "/models", FRAUD, Some(register_body("scorer", "1.0.0"))).await;

    let (status, _, body) = send(&t.app, "GET", "/models/scorer/latest", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["requestId"].is_string());

    let (status, _, body) = send(&t.app, "GET", "/models/scorer/versions/1.0.0", Some(("risk", "models:read")), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "ResourceNotFound");

    let (status, _, _) = send(&t.app, "POST", "/models", Some(("fraud", "models:read")), Some(register_body("other", "1.0.0"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn validation_errors_carry_field_details_and_request_id() {
    let t = build_test_context();
    let app = t.app.clone();
    let resp = {
        use axum::body::Body;
        use axum::http::Request;
        use tower::util::ServiceExt;
        let req = Request::builder()
            .method("POST")
            .uri("/models")
            .header("x-team-id", "fraud")
            .header("x-scopes", "models:write")
            .header("x-request-id", "req-123")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "name": "m", "version": "one", "framework": "onnx", "artifactUri": "s3://b/k", "deploymentTarget": "edge" }).to_string()))
            .unwrap();
        app.oneshot(req).await.unwrap()
    };
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers()["x-request-id"], "req-123");
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["requestId"], "req-123");
    assert_eq!(body["error"], "ValidationError");
    assert!(body["details"]["version"].is_string());

    let (status, _, _) = send(&t.app, "GET", "/models?limit=500", FRAUD, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listing_metadata_and_delete() {
    let t = build_test_context();
    for v in ["1.0.0", "1.2.0", "1.10.0"] {
        send(&t.app, "POST", "/models", FRAUD, Some(register_body("ranker", v))).await;
    }
    let (_, _, body) = send(&t.app, "GET", "/models/ranker/latest", FRAUD, None).await;
    assert_eq!(body["version"], "1.10.0");

    let (_, _, body) = send(&t.app, "GET", "/models?team=fraud&limit=2", FRAUD, None).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert!(body["nextCursor"].is_string());

    let (status, _, body) = send(&t.app, "PUT", "/models/ranker/versions/1.2.0/metadata", FRAUD, Some(json!({ "description": "rebuilt" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"], json!({ "description": "rebuilt" }));

    let (status, _, _) = send(&t.app, "DELETE", "/models/ranker/versions/1.2.0", FRAUD, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, _, body) = send(&t.app, "GET", "/models/ranker/versions", FRAUD, None).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn health_endpoints_answer() {
    let t = build_test_context();
    let (status, _, body) = send(&t.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"].as_array().unwrap().len(), 3);

    let (status, _, body) = send(&t.app, "GET", "/health/live", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    t.bus.set_failing(true);
    let (status, _, body) = send(&t.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");

    let (status, headers, _) = send(&t.app, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["content-type"].to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn scope_header_tolerates_spaces_after_commas() {
    let t = build_test_context();
    let spaced = Some(("fraud", "models:read, models:write"));
    let (status, _, _) = send(&t.app, "POST", "/models", spaced, Some(register_body("spaced", "1.0.0"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _, body) = send(&t.app, "GET", "/models/spaced/versions/1.0.0", spaced, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["modelId"], "spaced");
}
