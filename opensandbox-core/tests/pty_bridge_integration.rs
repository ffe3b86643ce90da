//! `PtyBridge::create` end to end: a real worker-side `WorkerGrpcService`
//! bound to a loopback port, a real `ControlLifecycle` backed by a per-test
//! Postgres database (via `sqlx::test`), and the registry wiring between
//! them exactly as `opensandboxd`'s combined-role startup does it.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tonic::transport::Server;

use opensandbox_core::checkpoint::CheckpointStore;
use opensandbox_core::config::Config;
use opensandbox_core::grpc::WorkerGrpcService;
use opensandbox_core::lifecycle::{ControlLifecycle, WorkerLifecycle};
use opensandbox_core::metadata::MetadataStore;
use opensandbox_core::metadata::models::{Org, SandboxSession, SandboxStatus};
use opensandbox_core::proto::sandbox_worker_server::SandboxWorkerServer;
use opensandbox_core::pty::PtyManager;
use opensandbox_core::pty_bridge::PtyBridge;
use opensandbox_core::registry::WorkerRegistry;
use opensandbox_core::router::SandboxRouter;
use opensandbox_core::runtime::{LocalProcessRuntime, RuntimeHooksAdapter, SandboxRuntime};

fn test_config() -> &'static Config {
    // SAFETY: test-only, set before Config::load's first call in this process.
    unsafe {
        std::env::set_var("OPENSANDBOX_ROLE", "combined");
        std::env::set_var("DATABASE_URL", "postgres://unused/unused");
    }
    Config::load()
}

fn free_addr() -> std::net::SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Spawns a real worker process-in-miniature: a `LocalProcessRuntime`
/// driven sandbox behind a gRPC server on a loopback port and an HTTP
/// server serving its PTY WebSocket endpoint, returning the addresses a
/// `WorkerRegistry` heartbeat would advertise.
async fn spawn_worker(workspace: &std::path::Path) -> (std::net::SocketAddr, std::net::SocketAddr) {
    let checkpoints = CheckpointStore::new("http://localhost:9//unused-in-these-tests");
    let runtime: Arc<dyn SandboxRuntime> = Arc::new(LocalProcessRuntime::new(workspace, checkpoints));
    let hooks = Arc::new(RuntimeHooksAdapter { runtime: runtime.clone() });
    let router = SandboxRouter::new(hooks);
    let pty = Arc::new(PtyManager::new());
    let lifecycle = Arc::new(WorkerLifecycle::new(runtime, router, pty, workspace.to_path_buf()));

    lifecycle
        .create(
            opensandbox_core::CreateSandboxParams {
                sandbox_id: "sbx-1".into(),
                image_ref: "default".into(),
                envs: vec![],
                memory_mb: 512,
                cpu_count: 1,
                network_enabled: false,
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    lifecycle.router.register("sbx-1", Duration::from_secs(60));

    let grpc_addr = free_addr();
    let service = WorkerGrpcService { lifecycle: lifecycle.clone() };
    tokio::spawn(async move {
        Server::builder()
            .add_service(SandboxWorkerServer::new(service))
            .serve(grpc_addr)
            .await
            .unwrap();
    });

    let http_addr = free_addr();
    let state = opensandbox_core::api::WorkerApiState { lifecycle, config: test_config() };
    let app = opensandbox_core::api::worker_router(state);
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(http_addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    // Give both listeners a moment to come up before the registry dials them.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (grpc_addr, http_addr)
}

async fn control_lifecycle(pool: PgPool) -> Arc<ControlLifecycle> {
    let metadata = MetadataStore::from_pool(pool);
    metadata.init_schema().await.unwrap();
    let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(15)));
    let checkpoints = Arc::new(CheckpointStore::new("http://localhost:9//unused-in-these-tests"));
    Arc::new(ControlLifecycle::new(Arc::new(metadata), registry, checkpoints, test_config()))
}

#[sqlx::test]
async fn create_dispatches_to_the_owning_worker_and_issues_a_scoped_token(pool: PgPool) {
    let tmp = tempfile::tempdir().unwrap();
    let (grpc_addr, http_addr) = spawn_worker(tmp.path()).await;
    let lifecycle = control_lifecycle(pool).await;

    lifecycle
        .metadata()
        .create_org(&Org {
            id: "org-1".into(),
            slug: "org-1-slug".into(),
            plan: "free".into(),
            max_concurrent_sandboxes: 5,
            max_sandbox_timeout_secs: 7200,
            custom_domain: None,
            custom_domain_verified: false,
        })
        .await
        .unwrap();
    lifecycle
        .metadata()
        .create_session(&SandboxSession {
            sandbox_id: "sbx-1".into(),
            org_id: "org-1".into(),
            template: "default".into(),
            region: "local".into(),
            worker_id: Some("wkr-1".into()),
            status: SandboxStatus::Running,
            config_json: serde_json::json!({}),
            metadata_json: serde_json::json!({}),
            started_at: Utc::now(),
            stopped_at: None,
            error_msg: None,
            based_on_template_id: None,
        })
        .await
        .unwrap();
    lifecycle.registry().record_heartbeat(
        "wkr-1",
        "local",
        &grpc_addr.to_string(),
        &http_addr.to_string(),
        10,
        1,
        0.0,
        0.0,
    );

    let bridge = PtyBridge::new(lifecycle);
    let handle = bridge.create("sbx-1", "org-1", 80, 24, "sh").await.unwrap();

    assert!(!handle.session_id.is_empty());
    assert_eq!(handle.worker_http_addr, http_addr.to_string());
    assert!(!handle.token.is_empty());
}

#[sqlx::test]
async fn create_rejects_a_sandbox_owned_by_a_different_org(pool: PgPool) {
    let tmp = tempfile::tempdir().unwrap();
    let (grpc_addr, http_addr) = spawn_worker(tmp.path()).await;
    let lifecycle = control_lifecycle(pool).await;

    lifecycle
        .metadata()
        .create_org(&Org {
            id: "org-1".into(),
            slug: "org-1-slug".into(),
            plan: "free".into(),
            max_concurrent_sandboxes: 5,
            max_sandbox_timeout_secs: 7200,
            custom_domain: None,
            custom_domain_verified: false,
        })
        .await
        .unwrap();
    lifecycle
        .metadata()
        .create_session(&SandboxSession {
            sandbox_id: "sbx-1".into(),
            org_id: "org-1".into(),
            template: "default".into(),
            region: "local".into(),
            worker_id: Some("wkr-1".into()),
            status: SandboxStatus::Running,
            config_json: serde_json::json!({}),
            metadata_json: serde_json::json!({}),
            started_at: Utc::now(),
            stopped_at: None,
            error_msg: None,
            based_on_template_id: None,
        })
        .await
        .unwrap();
    lifecycle.registry().record_heartbeat(
        "wkr-1",
        "local",
        &grpc_addr.to_string(),
        &http_addr.to_string(),
        10,
        1,
        0.0,
        0.0,
    );

    let bridge = PtyBridge::new(lifecycle);
    let result = bridge.create("sbx-1", "org-other", 80, 24, "sh").await;
    assert!(result.is_err());
}
