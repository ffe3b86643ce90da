//! `WorkerRegistry`: discovery of live workers, least-loaded
//! selection, and a cache of open gRPC client stubs per worker.
//!
//! Keyed by worker id in a `DashMap` — no separate mutex-guarded `HashMap`,
//! just a concurrent map the heartbeat consumer and the lifecycle service
//! both hit without
//! coordinating.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::transport::Channel;

use crate::error::{OpenSandboxError, Result};
use crate::proto::sandbox_worker_client::SandboxWorkerClient;

#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub id: String,
    pub region: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub capacity: i64,
    pub current_count: i64,
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub healthy: bool,
    pub last_heartbeat: Instant,
}

impl WorkerInfo {
    fn free_capacity(&self) -> i64 {
        (self.capacity - self.current_count).max(0)
    }
}

struct ClientCacheEntry {
    grpc_addr: String,
    client: SandboxWorkerClient<Channel>,
}

/// Live worker discovery plus a gRPC client-stub cache.
///
/// Implements the `RuntimeHooks`-adjacent side of the system: everything the
/// lifecycle service and subdomain proxy need to find and dial a worker,
/// without either of them knowing about connection management.
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerInfo>,
    clients: DashMap<String, ClientCacheEntry>,
    stale_threshold: Duration,
}

impl WorkerRegistry {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            clients: DashMap::new(),
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Ingest a heartbeat, registering the worker on first contact. Returns
    /// whether this worker id was previously unknown to this registry, so
    /// the caller can trigger restart reconciliation.
    pub fn record_heartbeat(
        &self,
        id: &str,
        region: &str,
        grpc_addr: &str,
        http_addr: &str,
        capacity: i64,
        current_count: i64,
        cpu_pct: f32,
        mem_pct: f32,
    ) -> bool {
        let is_new = !self.workers.contains_key(id);
        self.workers.insert(
            id.to_string(),
            WorkerInfo {
                id: id.to_string(),
                region: region.to_string(),
                grpc_addr: grpc_addr.to_string(),
                http_addr: http_addr.to_string(),
                capacity,
                current_count,
                cpu_pct,
                mem_pct,
                healthy: true,
                last_heartbeat: Instant::now(),
            },
        );
        if is_new {
            crate::metrics::metrics().record_worker_registered();
            tracing::info!(worker_id = %id, %region, "worker registered");
        }
        // A changed grpc_addr invalidates the cached client for this worker.
        if let Some(entry) = self.clients.get(id) {
            if entry.grpc_addr != grpc_addr {
                drop(entry);
                self.clients.remove(id);
            }
        }
        is_new
    }

    /// Scan for workers whose heartbeat is older than the stale threshold
    /// and mark them unhealthy. Intended to run on a periodic tick from the
    /// heartbeat consumer task.
    pub fn sweep_stale(&self) {
        let now = Instant::now();
        for mut entry in self.workers.iter_mut() {
            if entry.healthy && now.duration_since(entry.last_heartbeat) > self.stale_threshold {
                entry.healthy = false;
                self.clients.remove(entry.id.as_str());
                crate::metrics::metrics().record_worker_unhealthy();
                tracing::warn!(worker_id = %entry.id, "worker marked unhealthy: heartbeat stale");
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkerInfo> {
        self.workers.get(id).map(|e| e.clone())
    }

    /// Healthy worker with maximum free capacity in `region`, lexicographic
    /// tie-break on id.
    pub fn least_loaded(&self, region: &str) -> Result<WorkerInfo> {
        self.workers
            .iter()
            .filter(|e| e.healthy && e.region == region && e.free_capacity() > 0)
            .map(|e| e.clone())
            .reduce(|best, candidate| {
                match candidate.free_capacity().cmp(&best.free_capacity()) {
                    std::cmp::Ordering::Greater => candidate,
                    std::cmp::Ordering::Equal if candidate.id < best.id => candidate,
                    _ => best,
                }
            })
            .ok_or_else(|| {
                OpenSandboxError::WorkerUnavailable(format!("no healthy worker available in region {region}"))
            })
    }

    /// Fetch (or lazily dial and cache) a gRPC client stub for `worker_id`.
    pub async fn client_for(&self, worker_id: &str) -> Result<SandboxWorkerClient<Channel>> {
        if let Some(entry) = self.clients.get(worker_id) {
            return Ok(entry.client.clone());
        }

        let info = self.get(worker_id).ok_or_else(|| {
            OpenSandboxError::WorkerUnavailable(format!("worker {worker_id} not in registry"))
        })?;
        if !info.healthy {
            return Err(OpenSandboxError::WorkerUnavailable(format!(
                "worker {worker_id} is unhealthy"
            )));
        }

        let endpoint = format!("http://{}", info.grpc_addr);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| OpenSandboxError::WorkerUnavailable(format!("invalid worker address: {e}")))?
            .connect()
            .await?;
        let client = SandboxWorkerClient::new(channel);

        self.clients.insert(
            worker_id.to_string(),
            ClientCacheEntry {
                grpc_addr: info.grpc_addr.clone(),
                client: client.clone(),
            },
        );
        Ok(client)
    }

    pub fn invalidate_client(&self, worker_id: &str) {
        self.clients.remove(worker_id);
    }
}

pub type SharedWorkerRegistry = Arc<WorkerRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(Duration::from_secs(15))
    }

    #[test]
    fn least_loaded_picks_maximum_free_capacity() {
        let reg = registry();
        reg.record_heartbeat("w1", "us", "w1:7070", "w1:7080", 10, 8, 0.0, 0.0);
        reg.record_heartbeat("w2", "us", "w2:7070", "w2:7080", 10, 2, 0.0, 0.0);
        let picked = reg.least_loaded("us").unwrap();
        assert_eq!(picked.id, "w2");
    }

    #[test]
    fn least_loaded_tie_breaks_lexicographically() {
        let reg = registry();
        reg.record_heartbeat("wb", "us", "wb:7070", "wb:7080", 10, 5, 0.0, 0.0);
        reg.record_heartbeat("wa", "us", "wa:7070", "wa:7080", 10, 5, 0.0, 0.0);
        let picked = reg.least_loaded("us").unwrap();
        assert_eq!(picked.id, "wa");
    }

    #[test]
    fn least_loaded_excludes_saturated_workers() {
        let reg = registry();
        reg.record_heartbeat("w1", "us", "w1:7070", "w1:7080", 5, 5, 0.0, 0.0);
        assert!(reg.least_loaded("us").is_err());
    }

    #[test]
    fn least_loaded_errors_on_empty_region() {
        let reg = registry();
        assert!(reg.least_loaded("eu").is_err());
    }

    #[test]
    fn sweep_stale_marks_unhealthy_after_threshold() {
        let reg = WorkerRegistry::new(Duration::from_millis(10));
        reg.record_heartbeat("w1", "us", "w1:7070", "w1:7080", 10, 0, 0.0, 0.0);
        std::thread::sleep(Duration::from_millis(30));
        reg.sweep_stale();
        assert!(!reg.get("w1").unwrap().healthy);
        assert!(reg.least_loaded("us").is_err());
    }
}
