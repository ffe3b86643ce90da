//! Exercises the worker-side HTTP surface end to end against a real
//! `LocalProcessRuntime` and `SandboxRouter`, driving requests through
//! `tower::ServiceExt::oneshot` rather than binding a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use opensandbox_core::api::{self, WorkerApiState};
use opensandbox_core::checkpoint::CheckpointStore;
use opensandbox_core::config::Config;
use opensandbox_core::lifecycle::WorkerLifecycle;
use opensandbox_core::pty::PtyManager;
use opensandbox_core::router::SandboxRouter;
use opensandbox_core::runtime::{LocalProcessRuntime, RuntimeHooksAdapter, SandboxRuntime};

fn test_config() -> &'static Config {
    // SAFETY: test-only, set before Config::load's first call in this process.
    unsafe {
        std::env::set_var("OPENSANDBOX_ROLE", "worker");
        std::env::set_var("DATABASE_URL", "postgres://unused/unused");
    }
    Config::load()
}

async fn test_state(workspace: &std::path::Path) -> WorkerApiState {
    let checkpoints = CheckpointStore::new("http://localhost:9//unused-in-these-tests");
    let runtime: Arc<dyn SandboxRuntime> = Arc::new(LocalProcessRuntime::new(workspace, checkpoints));
    let hooks = Arc::new(RuntimeHooksAdapter { runtime: runtime.clone() });
    let router = SandboxRouter::new(hooks);
    let pty = Arc::new(PtyManager::new());
    let lifecycle = Arc::new(WorkerLifecycle::new(runtime, router, pty, workspace.to_path_buf()));
    WorkerApiState { lifecycle, config: test_config() }
}

#[tokio::test]
async fn put_then_get_file_round_trips_through_http() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path()).await;
    state
        .lifecycle
        .runtime
        .create(opensandbox_core::CreateSandboxParams {
            sandbox_id: "sbx-1".into(),
            image_ref: "default".into(),
            envs: vec![],
            memory_mb: 512,
            cpu_count: 1,
            network_enabled: false,
        })
        .await
        .unwrap();
    state.lifecycle.router.register("sbx-1", Duration::from_secs(60));

    let app = api::worker_router(state);

    let put_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/sandboxes/sbx-1/files?path=hello.txt")
                .body(Body::from("hello from a test"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(put_response.status(), StatusCode::NO_CONTENT);

    let get_response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/sandboxes/sbx-1/files?path=hello.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_response.status(), StatusCode::OK);
    let body = get_response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello from a test");
}

#[tokio::test]
async fn get_file_for_unregistered_sandbox_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path()).await;
    let app = api::worker_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/sandboxes/sbx-missing/files?path=hello.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resize_unknown_pty_session_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path()).await;
    state
        .lifecycle
        .runtime
        .create(opensandbox_core::CreateSandboxParams {
            sandbox_id: "sbx-1".into(),
            image_ref: "default".into(),
            envs: vec![],
            memory_mb: 512,
            cpu_count: 1,
            network_enabled: false,
        })
        .await
        .unwrap();
    state.lifecycle.router.register("sbx-1", Duration::from_secs(60));
    let app = api::worker_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandboxes/sbx-1/pty/pty-missing/resize")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"cols":80,"rows":24}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn kill_unknown_pty_session_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path()).await;
    state
        .lifecycle
        .runtime
        .create(opensandbox_core::CreateSandboxParams {
            sandbox_id: "sbx-1".into(),
            image_ref: "default".into(),
            envs: vec![],
            memory_mb: 512,
            cpu_count: 1,
            network_enabled: false,
        })
        .await
        .unwrap();
    state.lifecycle.router.register("sbx-1", Duration::from_secs(60));
    let app = api::worker_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/sandboxes/sbx-1/pty/pty-missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn resize_pty_on_unregistered_sandbox_is_not_found() {
    // Distinct from the registered-but-missing-session case above: here the
    // sandbox itself was never registered with the Router, so the gate
    // rejects before ever reaching `PtyManager`.
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path()).await;
    let app = api::worker_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandboxes/sbx-missing/pty/pty-missing/resize")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"cols":80,"rows":24}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn kill_pty_wakes_a_hibernated_sandbox_before_acting() {
    // Exercises spec §4.4's "worker routes [resize/kill] through its Router
    // so that an unresponsive sandbox is woken before the action" — drives
    // the request through the real HTTP handler rather than calling the
    // Router directly, so a regression back to a direct `pty.kill()` call
    // (bypassing the gate) would leave the sandbox hibernated and this
    // assertion would fail.
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path()).await;
    state
        .lifecycle
        .runtime
        .create(opensandbox_core::CreateSandboxParams {
            sandbox_id: "sbx-1".into(),
            image_ref: "default".into(),
            envs: vec![],
            memory_mb: 512,
            cpu_count: 1,
            network_enabled: false,
        })
        .await
        .unwrap();
    state.lifecycle.router.register("sbx-1", Duration::from_secs(60));
    state.lifecycle.router.hibernate_now("sbx-1").await.unwrap();
    assert_eq!(
        state.lifecycle.router.state_of("sbx-1").await,
        Some(opensandbox_core::router::RouterState::Hibernated)
    );

    let app = api::worker_router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/sandboxes/sbx-1/pty/pty-missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        state.lifecycle.router.state_of("sbx-1").await,
        Some(opensandbox_core::router::RouterState::Running)
    );
}
