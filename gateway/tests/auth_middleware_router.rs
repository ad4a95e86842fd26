//! Router-level coverage for the bearer/admin auth gates, mirroring the
//! teacher's pattern of mounting a handler behind real middleware without
//! standing up the full app (see `support::gateway_state`).

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{middleware, Router};
use gateway::auth_middleware::{admin_auth_middleware, bearer_auth_middleware};
use tower::ServiceExt;

async fn ok() -> &'static str {
    "ok"
}

#[tokio::test]
async fn bearer_middleware_rejects_missing_and_wrong_tokens() {
    let state = support::gateway_state("correct-key", "admin-key");
    let app = Router::new()
        .route("/v1/ping", get(ok))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth_middleware))
        .with_state(state);

    let no_header = Request::builder().uri("/v1/ping").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(no_header).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let wrong = Request::builder()
        .uri("/v1/ping")
        .header("Authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(wrong).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bearer_middleware_allows_the_configured_key() {
    let state = support::gateway_state("correct-key", "admin-key");
    let app = Router::new()
        .route("/v1/ping", get(ok))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth_middleware))
        .with_state(state);

    let req = Request::builder()
        .uri("/v1/ping")
        .header("Authorization", "Bearer correct-key")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_middleware_gates_on_a_distinct_header_and_key() {
    let state = support::gateway_state("correct-key", "admin-key");
    let app = Router::new()
        .route("/admin/ping", get(ok))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state);

    let wrong = Request::builder()
        .uri("/admin/ping")
        .header("X-Admin-Key", "correct-key")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(wrong).await.unwrap().status(), StatusCode::FORBIDDEN);

    let right = Request::builder()
        .uri("/admin/ping")
        .header("X-Admin-Key", "admin-key")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(right).await.unwrap().status(), StatusCode::OK);
}
