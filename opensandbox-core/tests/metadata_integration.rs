//! Integration tests against a real Postgres instance, provisioned per-test
//! by `sqlx::test` (a fresh database, migrated by `init_schema` since this
//! store owns no migration directory of its own — see `MetadataStore`'s
//! doc comment). Run with `DATABASE_URL` pointed at a Postgres server able
//! to create databases, the way the pack's own `postgres_integration.rs`
//! tests do.

use chrono::Utc;
use sqlx::PgPool;

use opensandbox_core::metadata::MetadataStore;
use opensandbox_core::metadata::models::{Checkpoint, Org, SandboxSession, SandboxStatus};

async fn store_from_pool(pool: PgPool) -> MetadataStore {
    let store = MetadataStore::from_pool(pool);
    store.init_schema().await.unwrap();
    store
}

fn test_org(id: &str) -> Org {
    Org {
        id: id.into(),
        slug: format!("{id}-slug"),
        plan: "free".into(),
        max_concurrent_sandboxes: 5,
        max_sandbox_timeout_secs: 7200,
        custom_domain: None,
        custom_domain_verified: false,
    }
}

fn test_session(sandbox_id: &str, org_id: &str) -> SandboxSession {
    SandboxSession {
        sandbox_id: sandbox_id.into(),
        org_id: org_id.into(),
        template: "default".into(),
        region: "local".into(),
        worker_id: None,
        status: SandboxStatus::Running,
        config_json: serde_json::json!({}),
        metadata_json: serde_json::json!({}),
        started_at: Utc::now(),
        stopped_at: None,
        error_msg: None,
        based_on_template_id: None,
    }
}

#[sqlx::test]
async fn create_and_fetch_session_round_trips(pool: PgPool) {
    let store = store_from_pool(pool).await;
    store.create_org(&test_org("org-1")).await.unwrap();
    store.create_session(&test_session("sbx-1", "org-1")).await.unwrap();

    let fetched = store.get_session("sbx-1").await.unwrap();
    assert_eq!(fetched.org_id, "org-1");
    assert_eq!(fetched.status, SandboxStatus::Running);
}

#[sqlx::test]
async fn update_session_status_and_worker(pool: PgPool) {
    let store = store_from_pool(pool).await;
    store.create_org(&test_org("org-1")).await.unwrap();
    store.create_session(&test_session("sbx-1", "org-1")).await.unwrap();

    store.update_session_worker("sbx-1", Some("wkr-1")).await.unwrap();
    store
        .update_session_status("sbx-1", SandboxStatus::Hibernated, None)
        .await
        .unwrap();

    let fetched = store.get_session("sbx-1").await.unwrap();
    assert_eq!(fetched.worker_id.as_deref(), Some("wkr-1"));
    assert_eq!(fetched.status, SandboxStatus::Hibernated);
}

#[sqlx::test]
async fn count_active_for_org_excludes_stopped_sessions(pool: PgPool) {
    let store = store_from_pool(pool).await;
    store.create_org(&test_org("org-1")).await.unwrap();
    store.create_session(&test_session("sbx-1", "org-1")).await.unwrap();
    store.create_session(&test_session("sbx-2", "org-1")).await.unwrap();
    store.mark_session_stopped("sbx-2").await.unwrap();

    assert_eq!(store.count_active_for_org("org-1").await.unwrap(), 1);
}

#[sqlx::test]
async fn only_one_active_checkpoint_per_sandbox(pool: PgPool) {
    let store = store_from_pool(pool).await;
    store.create_org(&test_org("org-1")).await.unwrap();
    store.create_session(&test_session("sbx-1", "org-1")).await.unwrap();

    let checkpoint = Checkpoint {
        id: 0,
        sandbox_id: "sbx-1".into(),
        org_id: "org-1".into(),
        checkpoint_key: "checkpoints/sbx-1/1".into(),
        size_bytes: 100,
        region: "local".into(),
        template: "default".into(),
        sandbox_config_json: serde_json::json!({}),
        hibernated_at: Utc::now(),
        restored_at: None,
        expired_at: None,
    };
    let first_id = store.create_checkpoint(&checkpoint).await.unwrap();

    let conflicting = Checkpoint {
        checkpoint_key: "checkpoints/sbx-1/2".into(),
        ..checkpoint.clone()
    };
    assert!(store.create_checkpoint(&conflicting).await.is_err());

    store.expire_checkpoint(first_id).await.unwrap();
    let second_id = store.create_checkpoint(&conflicting).await.unwrap();
    assert_ne!(first_id, second_id);

    let active = store.get_active_checkpoint("sbx-1").await.unwrap();
    assert_eq!(active.id, second_id);
    assert!(active.is_active());
}

#[sqlx::test]
async fn worker_heartbeat_upsert_and_stale_sweep(pool: PgPool) {
    let store = store_from_pool(pool).await;
    store
        .upsert_worker_heartbeat("wkr-1", "local", "wkr-1:7070", "wkr-1:7080", 10, 3)
        .await
        .unwrap();

    let worker = store.get_worker("wkr-1").await.unwrap();
    assert_eq!(worker.free_capacity(), 7);

    let healthy = store.list_healthy_workers("local").await.unwrap();
    assert_eq!(healthy.len(), 1);

    store.mark_worker_unhealthy("wkr-1").await.unwrap();
    let healthy_after = store.list_healthy_workers("local").await.unwrap();
    assert!(healthy_after.is_empty());
}

#[sqlx::test]
async fn list_sessions_for_worker_reconciliation_query(pool: PgPool) {
    let store = store_from_pool(pool).await;
    store.create_org(&test_org("org-1")).await.unwrap();
    let mut session = test_session("sbx-1", "org-1");
    session.worker_id = Some("wkr-1".into());
    store.create_session(&session).await.unwrap();

    let claimed = store.list_sessions_for_worker("wkr-1").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].sandbox_id, "sbx-1");
}
