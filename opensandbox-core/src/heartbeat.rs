//! `HeartbeatChannel`: workers publish
//! capacity/load every 5s; the control plane consumes them into its
//! `WorkerRegistry`. This implementation reuses the gRPC control channel
//! itself (a unary RPC called on a timer) rather than standing up a
//! separate bus, since CP and worker already share a gRPC connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::ControlLifecycle;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: String,
    pub region: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub capacity: i64,
    pub current_count: i64,
    pub cpu_pct: f32,
    pub mem_pct: f32,
}

/// Worker-side emitter loop. `publish` performs the actual send (gRPC call,
/// HTTP POST, or direct registry update for combined-role processes).
pub async fn emit_loop<P, Fut>(interval: Duration, payload_fn: impl Fn() -> HeartbeatPayload, publish: P)
where
    P: Fn(HeartbeatPayload) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        publish(payload_fn()).await;
    }
}

/// CP-side consumer: ingests a heartbeat into the registry (the hot path
/// the lifecycle service and proxy read), mirrors it into the durable
/// `workers` table so registration survives a CP restart, and
/// triggers restart reconciliation the first time a
/// worker id is seen. The in-memory registry is authoritative for routing;
/// metadata writes are best-effort and never block ingestion.
pub struct HeartbeatConsumer {
    lifecycle: Arc<ControlLifecycle>,
}

impl HeartbeatConsumer {
    pub fn new(lifecycle: Arc<ControlLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub fn lifecycle(&self) -> &Arc<ControlLifecycle> {
        &self.lifecycle
    }

    pub async fn ingest(&self, payload: HeartbeatPayload) {
        let is_new = self.lifecycle.registry().record_heartbeat(
            &payload.worker_id,
            &payload.region,
            &payload.grpc_addr,
            &payload.http_addr,
            payload.capacity,
            payload.current_count,
            payload.cpu_pct,
            payload.mem_pct,
        );
        if let Err(e) = self
            .lifecycle
            .metadata()
            .upsert_worker_heartbeat(
                &payload.worker_id,
                &payload.region,
                &payload.grpc_addr,
                &payload.http_addr,
                payload.capacity,
                payload.current_count,
            )
            .await
        {
            tracing::warn!(worker_id = %payload.worker_id, error = %e, "failed to persist worker heartbeat");
        }
        if is_new {
            if let Err(e) = self.lifecycle.reconcile_worker_restart(&payload.worker_id).await {
                tracing::warn!(worker_id = %payload.worker_id, error = %e, "restart reconciliation failed");
            }
        }
    }

    /// Spawns the periodic stale-worker sweep. Runs for the lifetime
    /// of the process; intended to be spawned once at CP startup.
    pub async fn run_stale_sweep(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let registry = self.lifecycle.registry();
            registry.sweep_stale();
            if let Ok(stale) = self.lifecycle.metadata().list_stale_workers(registry.stale_threshold()).await {
                for worker in stale {
                    if let Err(e) = self.lifecycle.metadata().mark_worker_unhealthy(&worker.id).await {
                        tracing::warn!(worker_id = %worker.id, error = %e, "failed to mark worker unhealthy in metadata");
                    }
                }
            }
        }
    }
}
