mod helpers;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use helpers::{settings, wait_for_terminal, Behavior, Harness, ScriptedBackend, PNG_BYTES};
use media_gen_orchestrator::routes;

fn app(harness: &Harness) -> Router {
    routes::router(harness.state.clone(), None)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(app, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn generate(body: Value, user: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/api/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", user)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_submit_poll_and_download() {
    let (backend, _) = ScriptedBackend::new(Behavior::Succeed);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let (status, body) = send_json(
        &app,
        generate(json!({"mode": "image", "prompt": "a lighthouse at dusk"}), "alice"),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: uuid::Uuid = body["jobId"].as_str().unwrap().parse().unwrap();

    wait_for_terminal(harness.orchestrator(), job_id).await;

    let (status, body) = send_json(&app, get(&format!("/api/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Succeeded");
    assert_eq!(body["mode"], "image");
    assert_eq!(body["mime"], "image/png");

    let url = body["url"].as_str().unwrap();
    let path = url.strip_prefix(helpers::BASE_URL).unwrap();
    let (status, headers, bytes) = send(&app, get(path)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/png");
    assert_eq!(bytes, PNG_BYTES);
}

#[tokio::test]
async fn test_malformed_and_invalid_bodies_are_400() {
    let (backend, _) = ScriptedBackend::new(Behavior::Succeed);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let cases = [
        json!({"mode": "hologram", "prompt": "a cube"}),
        json!({"mode": "image"}),
        json!({"mode": "image", "prompt": ""}),
        json!({"mode": "image", "prompt": "   "}),
        json!({"mode": "video", "prompt": "a river"}),
        json!({"mode": "image", "prompt": "a cube", "options": {"duration": 5}}),
        json!({"mode": "image", "prompt": "a cube", "options": {"resolution": "huge"}}),
    ];
    for case in cases {
        let (status, body) = send_json(&app, generate(case.clone(), "alice")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {case}");
        assert!(body["error"].is_string());
    }
    assert_eq!(harness.state.queue.depth(media_gen_orchestrator::models::mode::Mode::Image), 0);
}

#[tokio::test]
async fn test_rejected_prompt_is_422_with_job_id() {
    let (backend, _) = ScriptedBackend::new(Behavior::Succeed);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let (status, body) = send_json(
        &app,
        generate(json!({"mode": "image", "prompt": "a n4ked figure"}), "mallory"),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let job_id = body["jobId"].as_str().unwrap();

    let (status, body) = send_json(&app, get(&format!("/api/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Rejected");
    assert!(body["error"].as_str().unwrap().starts_with("Prompt rejected"));
}

#[tokio::test]
async fn test_rate_limited_submission_is_429() {
    let (backend, _) = ScriptedBackend::new(Behavior::Hang);
    let mut settings = settings();
    settings.rate_limit.max_jobs = 1;
    let harness = Harness::with_backend(backend, settings);
    let app = app(&harness);

    let body = json!({"mode": "image", "prompt": "a tiny boat"});
    let (status, _) = send_json(&app, generate(body.clone(), "alice")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, headers, _) = send(&app, generate(body, "alice")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn test_unknown_job_is_404_and_cancel_is_idempotent() {
    let (backend, _) = ScriptedBackend::new(Behavior::Hang);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let unknown = uuid::Uuid::new_v4();
    let (status, _) = send_json(&app, get(&format!("/api/jobs/{unknown}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(&app, delete(&format!("/api/jobs/{unknown}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["status"].is_null());

    let (_, body) = send_json(
        &app,
        generate(json!({"mode": "image", "prompt": "never finishes"}), "alice"),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let (status, body) = send_json(&app, delete(&format!("/api/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Failed");
    }

    let (_, body) = send_json(&app, get(&format!("/api/jobs/{job_id}"))).await;
    assert_eq!(body["reason"], "Cancelled");
    assert_eq!(body["error"], "Job was cancelled");
}

#[tokio::test]
async fn test_bad_asset_tokens_are_refused() {
    let (backend, _) = ScriptedBackend::new(Behavior::Succeed);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let (status, _) = send_json(&app, get("/api/assets/not-a-token")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_reports_lanes() {
    let (backend, _) = ScriptedBackend::new(Behavior::Succeed);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let (status, body) = send_json(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["queue"]["depth"].as_array().unwrap().len(), 4);
    assert!(body["checks"].get("database").is_none());
}

#[tokio::test]
async fn test_malformed_job_ids_behave_like_unknown_jobs() {
    let (backend, _) = ScriptedBackend::new(Behavior::Succeed);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let (status, body) = send_json(&app, delete("/api/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobId"], "not-a-uuid");
    assert!(body["status"].is_null());

    let (status, body) = send_json(&app, get("/api/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not-a-uuid"));
}

#[tokio::test]
async fn test_styled_image_request_end_to_end() {
    let (backend, _) = ScriptedBackend::new(Behavior::Succeed);
    let harness = Harness::with_backend(backend, settings());
    let app = app(&harness);

    let (status, body) = send_json(
        &app,
        generate(
            json!({
                "mode": "image",
                "prompt": "a red circle",
                "options": {"style": "minimal", "resolution": "512x512"}
            }),
            "alice",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: uuid::Uuid = body["jobId"].as_str().unwrap().parse().unwrap();

    wait_for_terminal(harness.orchestrator(), job_id).await;

    let (status, body) = send_json(&app, get(&format!("/api/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Succeeded");
    assert_eq!(body["mime"], "image/png");
    let url = body["url"].as_str().unwrap();
    assert!(url.starts_with(&format!("{}/api/assets/", helpers::BASE_URL)));

    let (status, headers, _) = send(&app, get(url.strip_prefix(helpers::BASE_URL).unwrap())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/png");
}
