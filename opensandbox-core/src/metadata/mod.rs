//! `MetadataStore`: the durable system of record.
//!
//! Backed by Postgres via `sqlx`. Row types live in [`models`]; every enum
//! column is stored as `TEXT` and converted by hand (see `models` doc
//! comment) rather than through `query_as!`/`FromRow` derives on enum-bearing
//! rows, so this module never needs a live database to type-check.
//!
//! Migrations are an external concern — [`MetadataStore::init_schema`]
//! exists purely so tests and local development can stand up a database
//! without a separate migration runner.

pub mod models;

use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{OpenSandboxError, Result};
use models::{Checkpoint, Org, PreviewUrl, SandboxSession, SandboxStatus, Template, TemplateStatus, Worker, WorkerStatus};

#[derive(Clone)]
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| OpenSandboxError::Storage(format!("failed to connect to database: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an already-connected pool (tests provisioning a per-test database
    /// via `#[sqlx::test]` have no connection string to call [`Self::connect`] with).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Convenience for local/dev and tests: creates the tables this store
    /// expects if they don't already exist. Production deployments run
    /// migrations externally — this is not a migration
    /// system and never alters existing tables.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS orgs (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                plan TEXT NOT NULL DEFAULT 'free',
                max_concurrent_sandboxes BIGINT NOT NULL DEFAULT 5,
                max_sandbox_timeout_secs BIGINT NOT NULL DEFAULT 7200,
                custom_domain TEXT,
                custom_domain_verified BOOLEAN NOT NULL DEFAULT FALSE
            );

            CREATE TABLE IF NOT EXISTS sandbox_sessions (
                sandbox_id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL REFERENCES orgs(id),
                template TEXT NOT NULL,
                region TEXT NOT NULL,
                worker_id TEXT,
                status TEXT NOT NULL,
                config_json JSONB NOT NULL DEFAULT '{}',
                metadata_json JSONB NOT NULL DEFAULT '{}',
                started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                stopped_at TIMESTAMPTZ,
                error_msg TEXT,
                based_on_template_id TEXT
            );

            CREATE INDEX IF NOT EXISTS sandbox_sessions_org_status_idx
                ON sandbox_sessions (org_id, status);

            CREATE TABLE IF NOT EXISTS checkpoints (
                id BIGSERIAL PRIMARY KEY,
                sandbox_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                checkpoint_key TEXT NOT NULL UNIQUE,
                size_bytes BIGINT NOT NULL,
                region TEXT NOT NULL,
                template TEXT NOT NULL,
                sandbox_config_json JSONB NOT NULL DEFAULT '{}',
                hibernated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                restored_at TIMESTAMPTZ,
                expired_at TIMESTAMPTZ
            );

            CREATE UNIQUE INDEX IF NOT EXISTS checkpoints_one_active_per_sandbox
                ON checkpoints (sandbox_id)
                WHERE restored_at IS NULL AND expired_at IS NULL;

            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                region TEXT NOT NULL,
                grpc_addr TEXT NOT NULL,
                http_addr TEXT NOT NULL,
                capacity BIGINT NOT NULL,
                current_count BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'healthy',
                last_heartbeat TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL REFERENCES orgs(id),
                based_on_sandbox_id TEXT,
                checkpoint_key TEXT,
                image_ref TEXT,
                status TEXT NOT NULL DEFAULT 'processing',
                error_msg TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS preview_urls (
                id BIGSERIAL PRIMARY KEY,
                sandbox_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                hostname TEXT NOT NULL UNIQUE,
                port INTEGER NOT NULL,
                external_cdn_hostname_id TEXT,
                ssl_status TEXT NOT NULL DEFAULT 'pending',
                auth_config_json JSONB NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OpenSandboxError::Storage(format!("failed to initialize schema: {e}")))?;
        Ok(())
    }

    // -- Org ---------------------------------------------------------------

    pub async fn get_org(&self, org_id: &str) -> Result<Org> {
        sqlx::query_as::<_, Org>("SELECT * FROM orgs WHERE id = $1")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(OpenSandboxError::from)
    }

    pub async fn create_org(&self, org: &Org) -> Result<()> {
        sqlx::query(
            "INSERT INTO orgs (id, slug, plan, max_concurrent_sandboxes, max_sandbox_timeout_secs, custom_domain, custom_domain_verified)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&org.id)
        .bind(&org.slug)
        .bind(&org.plan)
        .bind(org.max_concurrent_sandboxes)
        .bind(org.max_sandbox_timeout_secs)
        .bind(&org.custom_domain)
        .bind(org.custom_domain_verified)
        .execute(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    /// Looks up the org whose verified custom hostname matches `domain` —
    /// consulted by the subdomain proxy when a request's Host doesn't match
    /// `*.<baseDomain>`.
    pub async fn get_org_by_custom_domain(&self, domain: &str) -> Result<Org> {
        sqlx::query_as::<_, Org>("SELECT * FROM orgs WHERE custom_domain = $1")
            .bind(domain)
            .fetch_one(&self.pool)
            .await
            .map_err(OpenSandboxError::from)
    }

    // -- SandboxSession ------------------------------------------------------

    fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<SandboxSession> {
        let status: String = row.try_get("status")?;
        Ok(SandboxSession {
            sandbox_id: row.try_get("sandbox_id")?,
            org_id: row.try_get("org_id")?,
            template: row.try_get("template")?,
            region: row.try_get("region")?,
            worker_id: row.try_get("worker_id")?,
            status: SandboxStatus::from_str(&status)?,
            config_json: row.try_get("config_json")?,
            metadata_json: row.try_get("metadata_json")?,
            started_at: row.try_get("started_at")?,
            stopped_at: row.try_get("stopped_at")?,
            error_msg: row.try_get("error_msg")?,
            based_on_template_id: row.try_get("based_on_template_id")?,
        })
    }

    pub async fn create_session(&self, session: &SandboxSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO sandbox_sessions
             (sandbox_id, org_id, template, region, worker_id, status, config_json, metadata_json, started_at, based_on_template_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&session.sandbox_id)
        .bind(&session.org_id)
        .bind(&session.template)
        .bind(&session.region)
        .bind(&session.worker_id)
        .bind(session.status.to_string())
        .bind(&session.config_json)
        .bind(&session.metadata_json)
        .bind(session.started_at)
        .bind(&session.based_on_template_id)
        .execute(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    pub async fn get_session(&self, sandbox_id: &str) -> Result<SandboxSession> {
        let row = sqlx::query("SELECT * FROM sandbox_sessions WHERE sandbox_id = $1")
            .bind(sandbox_id)
            .fetch_one(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Self::session_from_row(&row)
    }

    pub async fn list_sessions_for_org(&self, org_id: &str) -> Result<Vec<SandboxSession>> {
        let rows = sqlx::query("SELECT * FROM sandbox_sessions WHERE org_id = $1 ORDER BY started_at DESC")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        rows.iter().map(Self::session_from_row).collect()
    }

    pub async fn count_active_for_org(&self, org_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sandbox_sessions WHERE org_id = $1 AND status IN ('running', 'hibernated')",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Ok(row.try_get("n")?)
    }

    pub async fn update_session_status(
        &self,
        sandbox_id: &str,
        status: SandboxStatus,
        error_msg: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE sandbox_sessions SET status = $1, error_msg = $2 WHERE sandbox_id = $3")
            .bind(status.to_string())
            .bind(error_msg)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    pub async fn update_session_worker(&self, sandbox_id: &str, worker_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sandbox_sessions SET worker_id = $1 WHERE sandbox_id = $2")
            .bind(worker_id)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    pub async fn mark_session_stopped(&self, sandbox_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sandbox_sessions SET status = 'stopped', stopped_at = now() WHERE sandbox_id = $1",
        )
        .bind(sandbox_id)
        .execute(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    /// Sessions still claimed by `worker_id` — used by the control plane to
    /// reconcile state after a worker restart (its in-memory sandbox map is
    /// gone, but the metadata store still thinks sandboxes are running there).
    pub async fn list_sessions_for_worker(&self, worker_id: &str) -> Result<Vec<SandboxSession>> {
        let rows = sqlx::query(
            "SELECT * FROM sandbox_sessions WHERE worker_id = $1 AND status IN ('running', 'hibernated')",
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        rows.iter().map(Self::session_from_row).collect()
    }

    // -- Checkpoint -----------------------------------------------------------

    fn checkpoint_from_row(row: &sqlx::postgres::PgRow) -> Result<Checkpoint> {
        Ok(Checkpoint {
            id: row.try_get("id")?,
            sandbox_id: row.try_get("sandbox_id")?,
            org_id: row.try_get("org_id")?,
            checkpoint_key: row.try_get("checkpoint_key")?,
            size_bytes: row.try_get("size_bytes")?,
            region: row.try_get("region")?,
            template: row.try_get("template")?,
            sandbox_config_json: row.try_get("sandbox_config_json")?,
            hibernated_at: row.try_get("hibernated_at")?,
            restored_at: row.try_get("restored_at")?,
            expired_at: row.try_get("expired_at")?,
        })
    }

    /// Record a new checkpoint. The partial unique index on
    /// `(sandbox_id) WHERE restored_at IS NULL AND expired_at IS NULL`
    /// enforces "at most one active checkpoint per sandbox" at the database
    /// level; callers should mark the prior checkpoint restored or expired
    /// first.
    pub async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO checkpoints
             (sandbox_id, org_id, checkpoint_key, size_bytes, region, template, sandbox_config_json, hibernated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(&checkpoint.sandbox_id)
        .bind(&checkpoint.org_id)
        .bind(&checkpoint.checkpoint_key)
        .bind(checkpoint.size_bytes)
        .bind(&checkpoint.region)
        .bind(&checkpoint.template)
        .bind(&checkpoint.sandbox_config_json)
        .bind(checkpoint.hibernated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => OpenSandboxError::Conflict(
                format!("sandbox {} already has an active checkpoint", checkpoint.sandbox_id),
            ),
            other => OpenSandboxError::from(other),
        })?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_active_checkpoint(&self, sandbox_id: &str) -> Result<Checkpoint> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE sandbox_id = $1 AND restored_at IS NULL AND expired_at IS NULL",
        )
        .bind(sandbox_id)
        .fetch_one(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Self::checkpoint_from_row(&row)
    }

    pub async fn mark_checkpoint_restored(&self, checkpoint_id: i64) -> Result<()> {
        sqlx::query("UPDATE checkpoints SET restored_at = now() WHERE id = $1")
            .bind(checkpoint_id)
            .execute(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    pub async fn expire_checkpoint(&self, checkpoint_id: i64) -> Result<()> {
        sqlx::query("UPDATE checkpoints SET expired_at = now() WHERE id = $1")
            .bind(checkpoint_id)
            .execute(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    // -- Worker ---------------------------------------------------------------

    fn worker_from_row(row: &sqlx::postgres::PgRow) -> Result<Worker> {
        let status: String = row.try_get("status")?;
        Ok(Worker {
            id: row.try_get("id")?,
            region: row.try_get("region")?,
            grpc_addr: row.try_get("grpc_addr")?,
            http_addr: row.try_get("http_addr")?,
            capacity: row.try_get("capacity")?,
            current_count: row.try_get("current_count")?,
            status: WorkerStatus::from_str(&status)?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }

    /// Upsert a worker row on each heartbeat.
    pub async fn upsert_worker_heartbeat(
        &self,
        id: &str,
        region: &str,
        grpc_addr: &str,
        http_addr: &str,
        capacity: i64,
        current_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, region, grpc_addr, http_addr, capacity, current_count, status, last_heartbeat)
             VALUES ($1, $2, $3, $4, $5, $6, 'healthy', now())
             ON CONFLICT (id) DO UPDATE SET
                region = EXCLUDED.region,
                grpc_addr = EXCLUDED.grpc_addr,
                http_addr = EXCLUDED.http_addr,
                capacity = EXCLUDED.capacity,
                current_count = EXCLUDED.current_count,
                status = 'healthy',
                last_heartbeat = now()",
        )
        .bind(id)
        .bind(region)
        .bind(grpc_addr)
        .bind(http_addr)
        .bind(capacity)
        .bind(current_count)
        .execute(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = $1")
            .bind(worker_id)
            .fetch_one(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Self::worker_from_row(&row)
    }

    pub async fn list_healthy_workers(&self, region: &str) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE region = $1 AND status = 'healthy' ORDER BY id",
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        rows.iter().map(Self::worker_from_row).collect()
    }

    pub async fn mark_worker_unhealthy(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET status = 'unhealthy' WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    /// Workers whose last heartbeat is older than `stale_threshold`, used by
    /// the heartbeat consumer to detect crashed workers between heartbeats.
    pub async fn list_stale_workers(&self, stale_threshold: Duration) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE status = 'healthy' AND last_heartbeat < now() - make_interval(secs => $1)",
        )
        .bind(stale_threshold.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        rows.iter().map(Self::worker_from_row).collect()
    }

    // -- Template ---------------------------------------------------------------

    fn template_from_row(row: &sqlx::postgres::PgRow) -> Result<Template> {
        let status: String = row.try_get("status")?;
        Ok(Template {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            based_on_sandbox_id: row.try_get("based_on_sandbox_id")?,
            checkpoint_key: row.try_get("checkpoint_key")?,
            image_ref: row.try_get("image_ref")?,
            status: TemplateStatus::from_str(&status)?,
            error_msg: row.try_get("error_msg")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn create_template(&self, template: &Template) -> Result<()> {
        sqlx::query(
            "INSERT INTO templates (id, org_id, based_on_sandbox_id, checkpoint_key, image_ref, status, error_msg, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&template.id)
        .bind(&template.org_id)
        .bind(&template.based_on_sandbox_id)
        .bind(&template.checkpoint_key)
        .bind(&template.image_ref)
        .bind(template.status.to_string())
        .bind(&template.error_msg)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Ok(())
    }

    pub async fn get_template(&self, template_id: &str) -> Result<Template> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = $1")
            .bind(template_id)
            .fetch_one(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Self::template_from_row(&row)
    }

    /// Looks up a template scoped to one org — used to resolve an
    /// org-specific template before falling back to a publicly shared one.
    pub async fn get_template_for_org(&self, org_id: &str, template_id: &str) -> Result<Template> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = $1 AND org_id = $2")
            .bind(template_id)
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Self::template_from_row(&row)
    }

    // -- PreviewUrl -------------------------------------------------------------

    pub async fn create_preview_url(&self, preview: &PreviewUrl) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO preview_urls (sandbox_id, org_id, hostname, port, external_cdn_hostname_id, ssl_status, auth_config_json)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(&preview.sandbox_id)
        .bind(&preview.org_id)
        .bind(&preview.hostname)
        .bind(preview.port)
        .bind(&preview.external_cdn_hostname_id)
        .bind(&preview.ssl_status)
        .bind(&preview.auth_config_json)
        .fetch_one(&self.pool)
        .await
        .map_err(OpenSandboxError::from)?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_preview_url_by_hostname(&self, hostname: &str) -> Result<PreviewUrl> {
        sqlx::query_as::<_, PreviewUrl>("SELECT * FROM preview_urls WHERE hostname = $1")
            .bind(hostname)
            .fetch_one(&self.pool)
            .await
            .map_err(OpenSandboxError::from)
    }

    pub async fn list_preview_urls_for_sandbox(&self, sandbox_id: &str) -> Result<Vec<PreviewUrl>> {
        sqlx::query_as::<_, PreviewUrl>("SELECT * FROM preview_urls WHERE sandbox_id = $1")
            .bind(sandbox_id)
            .fetch_all(&self.pool)
            .await
            .map_err(OpenSandboxError::from)
    }

    pub async fn delete_preview_urls_for_sandbox(&self, sandbox_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM preview_urls WHERE sandbox_id = $1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await
            .map_err(OpenSandboxError::from)?;
        Ok(())
    }
}
