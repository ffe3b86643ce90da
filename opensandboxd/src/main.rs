//! OpenSandbox daemon entry point.
//!
//! Reads `OPENSANDBOX_ROLE` (control | worker | combined) from
//! [`opensandbox_core::config::Config`] and wires up exactly the
//! components that role needs: the control plane serves the public HTTP
//! API and the subdomain proxy; the worker serves the gRPC control channel
//! and the per-sandbox HTTP/WebSocket data channel; combined runs both in
//! one process without a network hop between them.

use std::sync::Arc;

use opensandbox_core::api::{self, ApiState, WorkerApiState};
use opensandbox_core::checkpoint::CheckpointStore;
use opensandbox_core::config::Config;
use opensandbox_core::grpc::WorkerGrpcService;
use opensandbox_core::heartbeat::{self, HeartbeatConsumer, HeartbeatPayload};
use opensandbox_core::lifecycle::{ControlLifecycle, WorkerLifecycle};
use opensandbox_core::metadata::MetadataStore;
use opensandbox_core::proto::sandbox_worker_server::SandboxWorkerServer;
use opensandbox_core::proxy::SubdomainProxy;
use opensandbox_core::pty::PtyManager;
use opensandbox_core::pty_bridge::PtyBridge;
use opensandbox_core::registry::WorkerRegistry;
use opensandbox_core::router::SandboxRouter;
use opensandbox_core::runtime::{LocalProcessRuntime, RuntimeHooksAdapter, SandboxRuntime};
use tracing::{error, info};

/// Everything the control-plane HTTP router needs, plus the handles other
/// tasks (stale-worker sweep, combined-role heartbeat ingestion) reuse.
struct ControlHandles {
    state: ApiState,
    heartbeats: Arc<HeartbeatConsumer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_log();

    let config = Config::load();
    let worker_id = local_worker_id();
    info!(role = ?config.role, worker_id = %worker_id, "starting opensandboxd");

    let worker = if config.role.is_worker() {
        Some(build_worker(config).await?)
    } else {
        None
    };

    let control = if config.role.is_control() {
        Some(build_control(config).await?)
    } else {
        None
    };

    let mut tasks = tokio::task::JoinSet::new();

    if let Some(handles) = &control {
        let addr = config.control_http_addr;
        let router = api::control_router(handles.state.clone());
        tasks.spawn(async move {
            info!(%addr, "control HTTP API listening");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router).await?;
            anyhow::Ok(())
        });

        let heartbeats = handles.heartbeats.clone();
        let sweep_interval = config.heartbeat_interval;
        tasks.spawn(async move {
            heartbeats.run_stale_sweep(sweep_interval).await;
            anyhow::Ok(())
        });
    }

    if let Some(worker) = worker.clone() {
        let addr = config.worker_http_addr;
        let state = WorkerApiState {
            lifecycle: worker.clone(),
            config,
        };
        let router = api::worker_router(state);
        tasks.spawn(async move {
            info!(%addr, "worker HTTP data channel listening");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router).await?;
            anyhow::Ok(())
        });

        let grpc_addr = config.worker_grpc_addr;
        let service = WorkerGrpcService { lifecycle: worker.clone() };
        tasks.spawn(async move {
            info!(%grpc_addr, "worker gRPC control channel listening");
            tonic::transport::Server::builder()
                .add_service(SandboxWorkerServer::new(service))
                .serve(grpc_addr)
                .await?;
            anyhow::Ok(())
        });

        let local_heartbeats = control.as_ref().map(|c| c.heartbeats.clone());
        spawn_heartbeat_emitter(config, worker_id, local_heartbeats);
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "task failed");
                return Err(e);
            }
            Err(e) => {
                error!(error = %e, "task panicked");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Builds the worker-local pieces: the sandbox runtime, the idle-timeout
/// router gating it, the PTY manager, and the lifecycle wiring that ties
/// them together. `RuntimeHooks` breaks the Router↔LifecycleService cycle.
async fn build_worker(config: &'static Config) -> anyhow::Result<Arc<WorkerLifecycle>> {
    tokio::fs::create_dir_all(&config.sandbox_workspace_root).await.ok();

    let checkpoints = CheckpointStore::new(config.checkpoint_store_base_url.clone());
    let runtime: Arc<dyn SandboxRuntime> =
        Arc::new(LocalProcessRuntime::new(config.sandbox_workspace_root.clone(), checkpoints));
    let hooks = Arc::new(RuntimeHooksAdapter { runtime: runtime.clone() });
    let router = SandboxRouter::new(hooks);
    let pty = Arc::new(PtyManager::new());

    Ok(Arc::new(WorkerLifecycle::new(
        runtime,
        router,
        pty,
        config.sandbox_workspace_root.clone(),
    )))
}

/// Builds the control-plane pieces: the metadata store connection, the
/// worker registry, the checkpoint store client, and the lifecycle/proxy/
/// PTY-bridge/heartbeat wiring on top of them.
async fn build_control(config: &'static Config) -> anyhow::Result<ControlHandles> {
    let metadata = Arc::new(MetadataStore::connect(&config.database_url).await?);
    if truthy_env("OPENSANDBOX_AUTO_INIT_SCHEMA") {
        metadata.init_schema().await?;
        info!("metadata schema ensured (OPENSANDBOX_AUTO_INIT_SCHEMA=true)");
    }

    let registry = Arc::new(WorkerRegistry::new(config.heartbeat_stale_threshold));
    let checkpoints = Arc::new(CheckpointStore::new(config.checkpoint_store_base_url.clone()));
    let lifecycle = Arc::new(ControlLifecycle::new(metadata, registry, checkpoints, config));

    let pty_bridge = Arc::new(PtyBridge::new(lifecycle.clone()));
    let proxy = Arc::new(SubdomainProxy::new(
        lifecycle.clone(),
        config.base_domain.clone(),
        config.proxy_connect_timeout,
        config.proxy_wake_timeout,
    ));
    let heartbeats = Arc::new(HeartbeatConsumer::new(lifecycle.clone()));

    let state = ApiState {
        lifecycle,
        pty_bridge,
        proxy,
        heartbeats: heartbeats.clone(),
    };

    Ok(ControlHandles { state, heartbeats })
}

/// Spawns the worker's heartbeat emitter. In
/// `Role::Combined`, `local_heartbeats` is `Some` and the payload is
/// ingested in-process; otherwise it's POSTed to `control_internal_url`.
fn spawn_heartbeat_emitter(
    config: &'static Config,
    worker_id: String,
    local_heartbeats: Option<Arc<HeartbeatConsumer>>,
) {
    let http_addr = config.worker_http_addr.to_string();
    let grpc_addr = config.worker_grpc_addr.to_string();
    let region = config.default_region.clone();
    let capacity = 10i64;

    let payload_fn = move || HeartbeatPayload {
        worker_id: worker_id.clone(),
        region: region.clone(),
        grpc_addr: grpc_addr.clone(),
        http_addr: http_addr.clone(),
        capacity,
        current_count: opensandbox_core::metrics::metrics()
            .active_sandboxes
            .load(std::sync::atomic::Ordering::Relaxed) as i64,
        cpu_pct: 0.0,
        mem_pct: 0.0,
    };

    let interval = config.heartbeat_interval;
    let internal_url = config.control_internal_url.clone();

    tokio::spawn(async move {
        heartbeat::emit_loop(interval, payload_fn, move |payload| {
            let local_heartbeats = local_heartbeats.clone();
            let internal_url = internal_url.clone();
            async move {
                if let Some(consumer) = local_heartbeats {
                    consumer.ingest(payload).await;
                    return;
                }
                let url = format!("{}/internal/heartbeat", internal_url.trim_end_matches('/'));
                match opensandbox_core::util::http_client() {
                    Ok(client) => {
                        if let Err(e) = client.post(&url).json(&payload).send().await {
                            tracing::warn!(error = %e, "failed to post heartbeat to control plane");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "no HTTP client for heartbeat emission"),
                }
            }
        })
        .await;
    });
}

fn local_worker_id() -> String {
    std::env::var("WORKER_ID").unwrap_or_else(|_| format!("wkr-{}", uuid::Uuid::new_v4()))
}

fn truthy_env(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
