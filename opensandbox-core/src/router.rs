//! `SandboxRouter` — the hard core. Per-worker singleton gating every
//! sandbox-directed operation behind a rolling idle timeout and mediating
//! hibernate/wake without losing or corrupting concurrent requests.
//!
//! The Router knows nothing about gRPC or the metadata store: it depends
//! only on [`RuntimeHooks`], supplied at construction, to break the cycle
//! with the lifecycle wiring that drives it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, oneshot};

use crate::error::{OpenSandboxError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterState {
    Running,
    Hibernating,
    Hibernated,
    Waking,
    Dead,
}

/// The opaque driver a Router entry snapshots to / restores from. Supplied
/// by whatever wires up the lifecycle service; the Router never constructs
/// one itself.
#[async_trait]
pub trait RuntimeHooks: Send + Sync {
    async fn snapshot(&self, sandbox_id: &str) -> Result<(String, u64)>;
    async fn restore(&self, sandbox_id: &str, checkpoint_key: &str) -> Result<()>;
    async fn destroy(&self, sandbox_id: &str) -> Result<()>;
}

struct RouterEntry {
    state: RouterState,
    idle_timeout: Duration,
    deadline: Instant,
    operation_count: u64,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    last_checkpoint_key: Option<String>,
}

impl RouterEntry {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            state: RouterState::Running,
            idle_timeout,
            deadline: Instant::now() + idle_timeout,
            operation_count: 0,
            waiters: Vec::new(),
            last_checkpoint_key: None,
        }
    }

    fn wake_waiters(&mut self, result: &Result<()>) {
        for tx in self.waiters.drain(..) {
            let _ = tx.send(clone_result(result));
        }
    }
}

fn clone_result(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(OpenSandboxError::Upstream(e.to_string())),
    }
}

/// Quiesce budget before an explicit hibernate force-snapshots anyway.
const QUIESCE_TIMEOUT: Duration = Duration::from_secs(10);
const QUIESCE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const REAPER_TICK: Duration = Duration::from_millis(250);

pub struct SandboxRouter {
    entries: DashMap<String, Arc<Mutex<RouterEntry>>>,
    hooks: Arc<dyn RuntimeHooks>,
    notify: Notify,
    shutdown: AtomicU64,
}

impl SandboxRouter {
    pub fn new(hooks: Arc<dyn RuntimeHooks>) -> Arc<Self> {
        let router = Arc::new(Self {
            entries: DashMap::new(),
            hooks,
            notify: Notify::new(),
            shutdown: AtomicU64::new(0),
        });
        let reaper_router = router.clone();
        tokio::spawn(async move { reaper_router.reap_loop().await });
        router
    }

    pub fn register(&self, id: &str, timeout: Duration) {
        self.entries
            .insert(id.to_string(), Arc::new(Mutex::new(RouterEntry::new(timeout))));
        self.notify.notify_one();
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        guard.deadline = Instant::now() + guard.idle_timeout;
        self.notify.notify_one();
        Ok(())
    }

    pub async fn set_timeout(&self, id: &str, timeout: Duration) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock().await;
        guard.idle_timeout = timeout;
        guard.deadline = Instant::now() + timeout;
        self.notify.notify_one();
        Ok(())
    }

    pub fn unregister(&self, id: &str) {
        self.entries.remove(id);
    }

    pub async fn state_of(&self, id: &str) -> Option<RouterState> {
        if let Some(entry) = self.entries.get(id) {
            let guard = entry.lock().await;
            Some(guard.state)
        } else {
            None
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<RouterEntry>>> {
        self.entries
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| OpenSandboxError::NotFound(format!("sandbox {id} not registered on this worker")))
    }

    /// The gate. Ensures the sandbox is running (waking it in place if
    /// hibernated), then runs `op` with `operation_count` held above zero
    /// for the duration — this is what blocks the reaper from hibernating
    /// mid-operation.
    pub async fn route<F, Fut, T>(&self, id: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let entry = self.entry(id)?;
        loop {
            let mut guard = entry.lock().await;
            match guard.state {
                RouterState::Running => {
                    guard.deadline = Instant::now() + guard.idle_timeout;
                    guard.operation_count += 1;
                    drop(guard);

                    let result = op().await;

                    let mut guard = entry.lock().await;
                    guard.operation_count = guard.operation_count.saturating_sub(1);
                    return result;
                }
                RouterState::Hibernated => {
                    let checkpoint_key = guard.last_checkpoint_key.clone().ok_or_else(|| {
                        OpenSandboxError::Internal(format!(
                            "sandbox {id} hibernated with no stored checkpoint key"
                        ))
                    })?;
                    guard.state = RouterState::Waking;
                    let (tx, rx) = oneshot::channel();
                    guard.waiters.push(tx);
                    drop(guard);

                    self.spawn_restore(id.to_string(), entry.clone(), checkpoint_key);
                    rx.await
                        .map_err(|_| OpenSandboxError::Internal("wake waiter dropped".into()))??;
                    // loop back: state should now be Running (or Dead on structural failure)
                }
                RouterState::Hibernating | RouterState::Waking => {
                    let (tx, rx) = oneshot::channel();
                    guard.waiters.push(tx);
                    drop(guard);
                    rx.await
                        .map_err(|_| OpenSandboxError::Internal("waiter dropped".into()))??;
                }
                RouterState::Dead => {
                    return Err(OpenSandboxError::Gone(format!("sandbox {id} is gone")));
                }
            }
        }
    }

    fn spawn_restore(&self, id: String, entry: Arc<Mutex<RouterEntry>>, checkpoint_key: String) {
        let hooks = self.hooks.clone();
        tokio::spawn(async move {
            let result = hooks.restore(&id, &checkpoint_key).await;
            let mut guard = entry.lock().await;
            match &result {
                Ok(()) => {
                    guard.state = RouterState::Running;
                    guard.deadline = Instant::now() + guard.idle_timeout;
                    guard.wake_waiters(&Ok(()));
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "wake-in-place restore failed");
                    // Structural failures (checkpoint missing) kill the entry;
                    // transient ones leave it hibernated for the next retry.
                    guard.state = match e {
                        OpenSandboxError::NotFound(_) => RouterState::Dead,
                        _ => RouterState::Hibernated,
                    };
                    let err = Err(OpenSandboxError::Upstream(e.to_string()));
                    guard.wake_waiters(&err);
                }
            }
        });
    }

    /// Explicit hibernate: waits for quiescence, snapshots,
    /// transitions to hibernated. Used for both CP-driven explicit hibernate
    /// and the reaper's idle-triggered hibernate.
    pub async fn hibernate_now(&self, id: &str) -> Result<(String, u64)> {
        let entry = self.entry(id)?;

        {
            let mut guard = entry.lock().await;
            if guard.state != RouterState::Running {
                return Err(OpenSandboxError::Conflict(format!(
                    "sandbox {id} is not running"
                )));
            }
            guard.state = RouterState::Hibernating;
        }

        let deadline = Instant::now() + QUIESCE_TIMEOUT;
        loop {
            let guard = entry.lock().await;
            if guard.operation_count == 0 {
                break;
            }
            drop(guard);
            if Instant::now() >= deadline {
                tracing::warn!(sandbox_id = %id, "quiesce timeout exceeded, snapshotting anyway");
                break;
            }
            tokio::time::sleep(QUIESCE_POLL_INTERVAL).await;
        }

        match self.hooks.snapshot(id).await {
            Ok((checkpoint_key, size_bytes)) => {
                let mut guard = entry.lock().await;
                guard.state = RouterState::Hibernated;
                guard.last_checkpoint_key = Some(checkpoint_key.clone());
                guard.wake_waiters(&Ok(()));
                crate::metrics::metrics().record_hibernate(true);
                Ok((checkpoint_key, size_bytes))
            }
            Err(e) => {
                let mut guard = entry.lock().await;
                guard.state = RouterState::Running;
                guard.deadline = Instant::now() + guard.idle_timeout;
                crate::metrics::metrics().record_hibernate(false);
                Err(e)
            }
        }
    }

    /// Mark a sandbox hibernated directly, without driving a snapshot —
    /// used when a worker that wins a `Wake` dispatch has no RouterEntry for
    /// the sandbox yet (it hibernated elsewhere, or on this worker before a
    /// restart) and the caller already knows the checkpoint to restore from.
    /// Creates the entry in `Hibernated` state if absent, so a subsequent
    /// `route()` call drives the normal wake-in-place transition instead of
    /// the caller restoring and registering outside the state machine.
    pub async fn mark_hibernated(&self, id: &str, timeout: Duration, checkpoint_key: &str) {
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RouterEntry::new(timeout))))
            .clone();
        let mut guard = entry.lock().await;
        guard.state = RouterState::Hibernated;
        guard.idle_timeout = timeout;
        guard.last_checkpoint_key = Some(checkpoint_key.to_string());
    }

    async fn reap_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(REAPER_TICK) => {}
                _ = self.notify.notified() => {}
            }

            let expired: Vec<String> = {
                let now = Instant::now();
                self.entries
                    .iter()
                    .filter_map(|e| {
                        let key = e.key().clone();
                        let entry = e.value().clone();
                        match entry.try_lock() {
                            Ok(guard) if guard.state == RouterState::Running && now >= guard.deadline => {
                                Some(key)
                            }
                            _ => None,
                        }
                    })
                    .collect()
            };

            for id in expired {
                let router = self.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    match router.hibernate_now(&id).await {
                        Ok(_) => {
                            crate::metrics::metrics().record_reaper_idle_hibernation();
                            tracing::debug!(sandbox_id = %id, "idle timeout: hibernated");
                        }
                        Err(e) => {
                            tracing::warn!(sandbox_id = %id, error = %e, "idle hibernate failed, will retry");
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingHooks {
        snapshots: AtomicU32,
        restores: AtomicU32,
        fail_restore: bool,
    }

    #[async_trait]
    impl RuntimeHooks for CountingHooks {
        async fn snapshot(&self, _id: &str) -> Result<(String, u64)> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            Ok(("checkpoints/sbx/1".to_string(), 1024))
        }

        async fn restore(&self, _id: &str, _checkpoint_key: &str) -> Result<()> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            if self.fail_restore {
                Err(OpenSandboxError::Upstream("restore failed".into()))
            } else {
                Ok(())
            }
        }

        async fn destroy(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn route_runs_op_when_running() {
        let hooks = Arc::new(CountingHooks {
            snapshots: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            fail_restore: false,
        });
        let router = SandboxRouter::new(hooks);
        router.register("sbx-1", Duration::from_secs(60));

        let result = router.route("sbx-1", || async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn touch_resets_deadline() {
        let hooks = Arc::new(CountingHooks {
            snapshots: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            fail_restore: false,
        });
        let router = SandboxRouter::new(hooks);
        router.register("sbx-1", Duration::from_millis(50));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            router.touch("sbx-1").await.unwrap();
        }
        assert_eq!(router.state_of("sbx-1").await, Some(RouterState::Running));
    }

    #[tokio::test]
    async fn hibernate_then_route_wakes_in_place() {
        let hooks = Arc::new(CountingHooks {
            snapshots: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            fail_restore: false,
        });
        let router = SandboxRouter::new(hooks.clone());
        router.register("sbx-1", Duration::from_secs(60));

        let (key, size) = router.hibernate_now("sbx-1").await.unwrap();
        assert_eq!(key, "checkpoints/sbx/1");
        assert_eq!(size, 1024);
        assert_eq!(router.state_of("sbx-1").await, Some(RouterState::Hibernated));

        let result = router.route("sbx-1", || async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
        assert_eq!(router.state_of("sbx-1").await, Some(RouterState::Running));
        assert_eq!(hooks.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mark_hibernated_materializes_entry_for_a_worker_that_never_saw_it() {
        let hooks = Arc::new(CountingHooks {
            snapshots: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            fail_restore: false,
        });
        let router = SandboxRouter::new(hooks.clone());

        // No register() call — this models a worker that wins a Wake
        // dispatch for a sandbox it has never held a RouterEntry for.
        assert_eq!(router.state_of("sbx-1").await, None);
        router
            .mark_hibernated("sbx-1", Duration::from_secs(60), "checkpoints/sbx/1")
            .await;
        assert_eq!(router.state_of("sbx-1").await, Some(RouterState::Hibernated));

        let result = router.route("sbx-1", || async { Ok(9) }).await.unwrap();
        assert_eq!(result, 9);
        assert_eq!(router.state_of("sbx-1").await, Some(RouterState::Running));
        assert_eq!(hooks.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn route_unknown_sandbox_returns_not_found() {
        let hooks = Arc::new(CountingHooks {
            snapshots: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            fail_restore: false,
        });
        let router = SandboxRouter::new(hooks);
        let result = router.route("missing", || async { Ok(()) }).await;
        assert!(matches!(result, Err(OpenSandboxError::NotFound(_))));
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let hooks = Arc::new(CountingHooks {
            snapshots: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            fail_restore: false,
        });
        let router = SandboxRouter::new(hooks);
        router.register("sbx-1", Duration::from_secs(60));
        router.unregister("sbx-1");
        assert_eq!(router.state_of("sbx-1").await, None);
    }

    #[tokio::test]
    async fn idle_timeout_triggers_reaper_hibernation() {
        let hooks = Arc::new(CountingHooks {
            snapshots: AtomicU32::new(0),
            restores: AtomicU32::new(0),
            fail_restore: false,
        });
        let router = SandboxRouter::new(hooks.clone());
        router.register("sbx-1", Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(router.state_of("sbx-1").await, Some(RouterState::Hibernated));
        assert_eq!(hooks.snapshots.load(Ordering::SeqCst), 1);
    }
}
