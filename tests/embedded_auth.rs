use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use http_body_util::BodyExt;
use rustpypi::{
    app::build_router,
    auth::AuthHook,
    config::Config,
    error::RegistryError,
    models::Identity,
    runtime,
    storage::{Store, StoreOptions},
};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "embedded-auth-boundary";

/// Accepts `ci-bot` with a fixed token and maps it to the `release-bot` identity.
#[derive(Debug)]
struct TokenHook;

#[async_trait]
impl AuthHook for TokenHook {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Identity>, RegistryError> {
        if username == "ci-bot" && password == "ci-token" {
            return Ok(Some(Identity::new("release-bot")));
        }
        Ok(None)
    }
}

#[derive(Debug)]
struct LockedHook;

#[async_trait]
impl AuthHook for LockedHook {
    async fn authenticate(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<Option<Identity>, RegistryError> {
        Err(RegistryError::http(
            StatusCode::UNAUTHORIZED,
            "account locked",
        ))
    }
}

#[derive(Debug)]
struct PassThroughHook;

#[async_trait]
impl AuthHook for PassThroughHook {}

fn register_request(user: &str, password: &str, name: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\":action\"\r\n\r\nsubmit\r\n\
         --{BOUNDARY}\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\n{name}\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", B64.encode(format!("{user}:{password}"))),
        )
        .body(Body::from(body))
        .expect("request")
}

async fn status_and_body(app: &axum::Router, req: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(req).await.expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn embedded_hook_identity_becomes_package_owner() {
    let dir = TempDir::new().expect("dir");
    let cfg = Config::for_data_dir(dir.path());
    let state = runtime::build_state(&cfg, Some(Arc::new(TokenHook)))
        .await
        .expect("state");
    let store = Arc::clone(&state.store);
    let app = build_router(state);

    let (status, _) = status_and_body(&app, register_request("ci-bot", "ci-token", "hooked")).await;
    assert_eq!(status, StatusCode::OK);
    let package = store.get_package("hooked").await.expect("package");
    assert_eq!(package.owner, "release-bot");

    let (status, _) = status_and_body(&app, register_request("ci-bot", "wrong", "hooked")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unanswered_hook_falls_back_to_local_users() {
    let dir = TempDir::new().expect("dir");
    let cfg = Config::for_data_dir(dir.path());
    let store = Store::open_with_options(
        &cfg,
        StoreOptions {
            auth_hook: Some(Arc::new(PassThroughHook)),
        },
    )
    .await
    .expect("store");
    store.create_user("alice", "alice-pw").await.expect("user");
    drop(store);

    let state = runtime::build_state(&cfg, Some(Arc::new(TokenHook)))
        .await
        .expect("state");
    let store = Arc::clone(&state.store);
    let app = build_router(state);

    let (status, _) = status_and_body(&app, register_request("alice", "alice-pw", "local")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        store.get_package("local").await.expect("package").owner,
        "alice"
    );

    // the hook identity and the local user are distinct owners
    let (status, body) =
        status_and_body(&app, register_request("ci-bot", "ci-token", "local")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "That package is owned by someone else!");
}

#[tokio::test]
async fn hook_errors_reject_the_request() {
    let dir = TempDir::new().expect("dir");
    let cfg = Config::for_data_dir(dir.path());
    let state = runtime::build_state(&cfg, Some(Arc::new(LockedHook)))
        .await
        .expect("state");
    state
        .store
        .create_user("alice", "alice-pw")
        .await
        .expect("user");
    let store = Arc::clone(&state.store);
    let app = build_router(state);

    let (status, body) = status_and_body(&app, register_request("alice", "alice-pw", "demo")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "account locked");
    assert!(store.all_packages().await.is_empty());
}
