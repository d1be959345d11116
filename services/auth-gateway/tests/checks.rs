use std::sync::Arc;

use auth_gateway::tokens::{Token, TokenRegistry};
use auth_gateway::{build_router, AppState};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common_session::{MockValidator, SessionValidator};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

const COOKIE: &str = "cosign-dice-api";

fn router(mock: &MockValidator) -> Router {
    let registry = TokenRegistry::build(vec![
        Token::new("svc-a", "secret1"),
        Token::new("svc-b", "secret2"),
    ])
    .expect("registry");
    let validator: Arc<dyn SessionValidator> = Arc::new(mock.clone());

    build_router(Arc::new(AppState {
        registry: Arc::new(registry),
        validator,
        session_cookie: COOKIE.to_string(),
    }))
}

async fn get(router: Router, uri: &str, cookie: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method("GET").uri(uri);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }

    let response = router
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .expect("response");
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).expect("json body");
    (parts.status, json)
}

#[tokio::test]
async fn token_and_session_match_is_authorized() {
    let mock = MockValidator::with_sessions(["validcookie"]);

    let (status, body) = get(router(&mock), "/check/svc-a/secret1/validcookie", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "AUTHORIZED");
    assert_eq!(body["valid"], true);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn wrong_key_is_unauthorized_without_contacting_validator() {
    let mock = MockValidator::with_sessions(["validcookie"]);

    let (status, body) = get(router(&mock), "/check/svc-a/wrongsecret/validcookie", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UNAUTHORIZED");
    assert_eq!(body["valid"], false);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn unknown_name_and_wrong_key_look_identical() {
    let mock = MockValidator::with_sessions(["validcookie"]);

    let unknown = get(router(&mock), "/check/svc-z/secret1/validcookie", None).await;
    let wrong_key = get(router(&mock), "/check/svc-a/secret2/validcookie", None).await;

    assert_eq!(unknown, wrong_key);
}

#[tokio::test]
async fn valid_token_with_invalid_session_is_unauthorized() {
    let mock = MockValidator::with_sessions(["othercookie"]);

    let (status, body) = get(router(&mock), "/check/svc-a/secret1/validcookie", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UNAUTHORIZED");
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn revoked_session_is_rechecked_every_time() {
    let mock = MockValidator::with_sessions(["validcookie"]);
    let app = router(&mock);

    let (_, first) = get(app.clone(), "/check/svc-b/secret2/validcookie", None).await;
    mock.revoke("validcookie");
    let (_, second) = get(app, "/check/svc-b/secret2/validcookie", None).await;

    assert_eq!(first["status"], "AUTHORIZED");
    assert_eq!(second["status"], "UNAUTHORIZED");
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn unreachable_validator_is_service_unavailable_for_token_check() {
    let mock = MockValidator::with_sessions(["validcookie"]);
    mock.set_unreachable(true);

    let (status, body) = get(router(&mock), "/check/svc-a/secret1/validcookie", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "SERVICE_UNAVAILABLE");
    assert_eq!(body["valid"], false);
    assert_eq!(body["error"]["code"], "service_unavailable");
}

#[tokio::test]
async fn session_cookie_is_validated() {
    let mock = MockValidator::with_sessions(["abc123"]);
    let app = router(&mock);

    let valid = get(
        app.clone(),
        "/session/valid",
        Some("theme=dark; cosign-dice-api=abc123"),
    )
    .await;
    let invalid = get(app.clone(), "/session/valid", Some("cosign-dice-api=nope")).await;
    let legacy = get(app, "/cosign/valid", Some("cosign-dice-api=abc123")).await;

    assert_eq!(valid.0, StatusCode::OK);
    assert_eq!(valid.1["status"], "AUTHORIZED");
    assert_eq!(invalid.0, StatusCode::OK);
    assert_eq!(invalid.1["status"], "UNAUTHORIZED");
    assert_eq!(legacy.1["status"], "AUTHORIZED");
}

#[tokio::test]
async fn missing_session_cookie_is_unauthorized() {
    let mock = MockValidator::with_sessions(["abc123"]);

    let (status, body) = get(router(&mock), "/session/valid", Some("other=abc123")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UNAUTHORIZED");
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn unreachable_validator_is_service_unavailable_for_session_check() {
    let mock = MockValidator::with_sessions(["abc123"]);
    mock.set_unreachable(true);

    let (status, body) = get(router(&mock), "/session/valid", Some("cosign-dice-api=abc123")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "SERVICE_UNAVAILABLE");
}
