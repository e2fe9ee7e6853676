//! Router-level tests for request validation paths that reject before any
//! backing service is touched. The pool is lazy, so reaching the database
//! would fail loudly; these requests must be turned away at the door.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use streamspace::config::Config;
use streamspace::dispatch::CommandStore;
use streamspace::hub::AgentHub;
use streamspace::store::AppState;

fn test_state() -> AppState {
    let config = Arc::new(Config::load());

    // Lazy pool: no server contact until a query runs.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost:1/streamspace_test")
        .expect("lazy pool");

    let valkey_config =
        fred::types::config::Config::from_url("redis://localhost:1/1").expect("valkey config");
    let valkey =
        fred::clients::Pool::new(valkey_config, None, None, None, 1).expect("valkey pool");

    let hub = Arc::new(AgentHub::new(
        pool.clone(),
        valkey.clone(),
        "cp-test".into(),
    ));
    let commands = CommandStore::new(pool.clone());

    AppState {
        pool,
        valkey,
        hub,
        commands,
        config,
    }
}

fn app() -> Router {
    streamspace::api::router().with_state(test_state())
}

async fn post_json(app: Router, uri: &str, body: &str) -> StatusCode {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_owned()))
                .unwrap(),
        )
        .await
        .unwrap();
    response.status()
}

#[tokio::test]
async fn healthz_is_up() {
    let response = app()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_session_rejects_empty_user() {
    let body = r#"{
        "user": "  ",
        "template": {"spec": {"baseImage": "streamspace/firefox:128"}},
        "resources": {"memory": "1Gi", "cpu": "500m"}
    }"#;
    assert_eq!(
        post_json(app(), "/api/sessions", body).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn create_session_rejects_blank_base_image() {
    let body = r#"{
        "user": "alice",
        "template": {"spec": {"baseImage": ""}},
        "resources": {"memory": "1Gi", "cpu": "500m"}
    }"#;
    assert_eq!(
        post_json(app(), "/api/sessions", body).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn create_session_rejects_template_without_spec() {
    let body = r#"{
        "user": "alice",
        "template": {"name": "firefox-browser"},
        "resources": {"memory": "1Gi", "cpu": "500m"}
    }"#;
    let status = post_json(app(), "/api/sessions", body).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn create_session_rejects_malformed_json() {
    let status = post_json(app(), "/api/sessions", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lifecycle_routes_reject_non_uuid_ids() {
    let status = post_json(app(), "/api/sessions/not-a-uuid/hibernate", "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
