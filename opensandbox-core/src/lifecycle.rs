//! `LifecycleService`: Create/Get/Kill/Hibernate/Wake/SaveAsTemplate
//! orchestration. Split into the CP half ([`ControlLifecycle`], which talks
//! to the metadata store, the registry, and dials workers over gRPC) and
//! the worker half ([`WorkerLifecycle`], which drives the local
//! `SandboxRuntime` and `SandboxRouter` and knows nothing about tenants,
//! quotas, or gRPC framing).

use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::error::{OpenSandboxError, Result};
use crate::metadata::MetadataStore;
use crate::metadata::models::{
    Checkpoint, PreviewUrl, SandboxSession, SandboxStatus, Template, TemplateStatus,
};
use crate::proto;
use crate::registry::SharedWorkerRegistry;
use crate::router::SandboxRouter;
use crate::runtime::{CreateSandboxParams as RuntimeCreateParams, ExecResult, SandboxRuntime, SandboxStats};
use crate::token;
use crate::util::new_sandbox_id;

// ---------------------------------------------------------------------------
// Worker half
// ---------------------------------------------------------------------------

/// Drives the worker-local `SandboxRuntime` through the `SandboxRouter`
/// gate. Every operation except `create`/`destroy` goes through
/// `router.route` so idle timeouts and wake-in-place apply uniformly.
pub struct WorkerLifecycle {
    pub runtime: Arc<dyn SandboxRuntime>,
    pub router: Arc<SandboxRouter>,
    pub pty: Arc<crate::pty::PtyManager>,
    workspace_root: std::path::PathBuf,
}

impl WorkerLifecycle {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        router: Arc<SandboxRouter>,
        pty: Arc<crate::pty::PtyManager>,
        workspace_root: std::path::PathBuf,
    ) -> Self {
        Self {
            runtime,
            router,
            pty,
            workspace_root,
        }
    }

    pub async fn create(&self, params: RuntimeCreateParams, idle_timeout: Duration) -> Result<()> {
        let sandbox_id = params.sandbox_id.clone();
        self.runtime.create(params).await?;
        self.router.register(&sandbox_id, idle_timeout);
        crate::metrics::metrics().record_sandbox_created();
        Ok(())
    }

    pub async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        self.router.unregister(sandbox_id);
        self.runtime.destroy(sandbox_id).await?;
        crate::metrics::metrics().record_sandbox_killed();
        Ok(())
    }

    pub async fn exec(
        &self,
        sandbox_id: &str,
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<String>,
    ) -> Result<ExecResult> {
        let runtime = self.runtime.clone();
        let sandbox_id_owned = sandbox_id.to_string();
        self.router
            .route(sandbox_id, move || async move {
                runtime
                    .exec(&sandbox_id_owned, &command, &args, &env, cwd.as_deref())
                    .await
            })
            .await
    }

    pub async fn stats(&self, sandbox_id: &str) -> Result<SandboxStats> {
        let runtime = self.runtime.clone();
        let sandbox_id_owned = sandbox_id.to_string();
        self.router
            .route(sandbox_id, move || async move { runtime.stats(&sandbox_id_owned).await })
            .await
    }

    /// Explicit hibernate, driven by the CP.
    pub async fn hibernate(&self, sandbox_id: &str) -> Result<(String, u64)> {
        self.router.hibernate_now(sandbox_id).await
    }

    /// Explicit wake. If this worker already owns the (hibernated)
    /// RouterEntry, `route`'s no-op drives the normal wake-in-place
    /// transition. Otherwise this worker has never seen the sandbox (or saw
    /// it before a restart) — `mark_hibernated` materializes a `Hibernated`
    /// entry carrying the checkpoint key so the same `route` call drives
    /// the identical state machine instead of restoring outside of it.
    pub async fn wake(&self, sandbox_id: &str, checkpoint_key: &str, idle_timeout: Duration) -> Result<()> {
        if self.router.state_of(sandbox_id).await.is_none() {
            self.router.mark_hibernated(sandbox_id, idle_timeout, checkpoint_key).await;
        }
        self.router.route(sandbox_id, || async { Ok(()) }).await
    }

    pub async fn build_template(&self, template_id: &str, dockerfile: &str) -> Result<String> {
        self.runtime.build_template(template_id, dockerfile).await
    }

    pub async fn create_pty(&self, sandbox_id: &str, cols: u16, rows: u16, shell: &str) -> Result<String> {
        let cwd = self.workspace_root.join(sandbox_id);
        let pty = self.pty.clone();
        let sandbox_id_owned = sandbox_id.to_string();
        let cols_v = cols;
        let rows_v = rows;
        let shell_owned = shell.to_string();
        self.router
            .route(sandbox_id, move || async move {
                pty.create(&sandbox_id_owned, &cwd, cols_v, rows_v, &shell_owned)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// CP half
// ---------------------------------------------------------------------------

pub struct CreateSandboxRequest {
    pub org_id: String,
    pub template: String,
    pub timeout_secs: Option<u64>,
    pub envs: Vec<(String, String)>,
    pub memory_mb: i64,
    pub cpu_count: i64,
    pub network_enabled: bool,
    pub region: Option<String>,
    pub metadata: serde_json::Value,
    /// Port the sandbox's app listens on, if any. Recorded as a preview URL
    /// so the subdomain proxy can route `<sandboxId>-p<port>.<baseDomain>`.
    pub port: Option<u16>,
}

pub struct SandboxView {
    pub sandbox_id: String,
    pub connect_url: Option<String>,
    pub token: Option<String>,
    pub domain: String,
    pub status: SandboxStatus,
    pub region: String,
    pub worker_id: Option<String>,
}

/// CP-side orchestration. Holds no per-sandbox in-memory state of its own —
/// everything durable lives in `MetadataStore`; everything live-worker lives
/// in `WorkerRegistry`.
pub struct ControlLifecycle {
    metadata: Arc<MetadataStore>,
    registry: SharedWorkerRegistry,
    checkpoints: Arc<CheckpointStore>,
    cdn: Arc<dyn crate::cdn::CdnAdapter>,
    config: &'static Config,
}

fn clamp_resources(cpu_count: i64, memory_mb: i64) -> (u32, u32) {
    let cpu = cpu_count.clamp(0, 4) as u32;
    let mem = memory_mb.clamp(0, 2048) as u32;
    (cpu, mem)
}

/// Org id templates are recorded under when they're shared platform-wide
/// rather than owned by one tenant (`BuildTemplate`/`SaveAsTemplate` never
/// write rows here; only a platform operator seeds them).
const PUBLIC_TEMPLATE_ORG_ID: &str = "public";

impl ControlLifecycle {
    /// Defaults to [`crate::cdn::NullCdnAdapter`] — no custom-domain CDN
    /// wired up. Use [`Self::with_cdn`] to plug in a real one.
    pub fn new(
        metadata: Arc<MetadataStore>,
        registry: SharedWorkerRegistry,
        checkpoints: Arc<CheckpointStore>,
        config: &'static Config,
    ) -> Self {
        Self {
            metadata,
            registry,
            checkpoints,
            cdn: Arc::new(crate::cdn::NullCdnAdapter),
            config,
        }
    }

    pub fn with_cdn(mut self, cdn: Arc<dyn crate::cdn::CdnAdapter>) -> Self {
        self.cdn = cdn;
        self
    }

    fn domain_for(&self, sandbox_id: &str) -> String {
        format!("{sandbox_id}.{}", self.config.base_domain)
    }

    fn issue_token(&self, org_id: &str, sandbox_id: &str, worker_id: &str, ttl: Duration) -> Result<String> {
        token::issue(&self.config.token_signing_key, org_id, sandbox_id, worker_id, ttl)
    }

    /// Resolves a requested template name to an image reference: an
    /// org-specific template (created via `SaveAsTemplate`/`BuildTemplate`
    /// for that org) takes precedence, then a publicly shared one. Neither
    /// existing (or existing but not yet `Ready`) is an invalid template.
    async fn resolve_template_image(&self, org_id: &str, template_id: &str) -> Result<String> {
        for scope in [org_id, PUBLIC_TEMPLATE_ORG_ID] {
            if let Ok(template) = self.metadata.get_template_for_org(scope, template_id).await {
                if template.status == TemplateStatus::Ready {
                    return Ok(template.image_ref.clone().unwrap_or_else(|| template_id.to_string()));
                }
            }
        }
        Err(OpenSandboxError::Validation(format!(
            "unknown or not-ready template '{template_id}'"
        )))
    }

    pub async fn create(&self, req: CreateSandboxRequest) -> Result<SandboxView> {
        let org = self.metadata.get_org(&req.org_id).await?;

        let active = self.metadata.count_active_for_org(&req.org_id).await?;
        if active >= org.max_concurrent_sandboxes {
            return Err(OpenSandboxError::Quota("concurrent sandbox limit reached".into()));
        }

        let (cpu_count, memory_mb) = clamp_resources(req.cpu_count, req.memory_mb);
        if req.cpu_count > 4 || req.memory_mb > 2048 {
            return Err(OpenSandboxError::Validation(
                "cpuCount must be <= 4 and memoryMB must be <= 2048".into(),
            ));
        }

        let image_ref = self.resolve_template_image(&req.org_id, &req.template).await?;

        let region = req.region.unwrap_or_else(|| self.config.default_region.clone());
        let worker = self.registry.least_loaded(&region)?;

        let sandbox_id = new_sandbox_id();
        let idle_timeout = Duration::from_secs(
            req.timeout_secs
                .unwrap_or(self.config.default_idle_timeout.as_secs())
                .clamp(self.config.min_idle_timeout.as_secs(), self.config.max_idle_timeout.as_secs()),
        );

        let mut client = self.registry.client_for(&worker.id).await?;
        let envs_json = serde_json::to_string(
            &req.envs.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
        )
        .unwrap_or_default();
        let response = client
            .create_sandbox(proto::CreateSandboxRequest {
                sandbox_id: sandbox_id.clone(),
                org_id: req.org_id.clone(),
                template: req.template.clone(),
                image_ref,
                cpu_count,
                memory_mb,
                network_enabled: req.network_enabled,
                idle_timeout_secs: idle_timeout.as_secs(),
                envs_json,
                metadata_json: req.metadata.to_string(),
            })
            .await?
            .into_inner();

        if response.status != proto::Status::StatusOk as i32 {
            return Err(OpenSandboxError::Upstream(response.error));
        }

        let session = SandboxSession {
            sandbox_id: sandbox_id.clone(),
            org_id: req.org_id.clone(),
            template: req.template.clone(),
            region: region.clone(),
            worker_id: Some(worker.id.clone()),
            status: SandboxStatus::Running,
            config_json: serde_json::json!({
                "cpuCount": cpu_count,
                "memoryMB": memory_mb,
                "networkEnabled": req.network_enabled,
            }),
            metadata_json: req.metadata,
            started_at: chrono::Utc::now(),
            stopped_at: None,
            error_msg: None,
            based_on_template_id: None,
        };
        self.metadata.create_session(&session).await?;

        if let Some(port) = req.port {
            let preview = PreviewUrl {
                id: 0,
                sandbox_id: sandbox_id.clone(),
                org_id: req.org_id.clone(),
                hostname: format!("{sandbox_id}-p{port}.{}", self.config.base_domain),
                port: port as i32,
                external_cdn_hostname_id: None,
                ssl_status: "pending".to_string(),
                auth_config_json: serde_json::json!({}),
            };
            self.metadata.create_preview_url(&preview).await?;
        }

        let tok = self.issue_token(&req.org_id, &sandbox_id, &worker.id, self.config.token_ttl)?;

        Ok(SandboxView {
            sandbox_id: sandbox_id.clone(),
            connect_url: Some(format!("https://{}", self.domain_for(&sandbox_id))),
            token: Some(tok),
            domain: self.domain_for(&sandbox_id),
            status: SandboxStatus::Running,
            region,
            worker_id: Some(worker.id),
        })
    }

    pub async fn get(&self, sandbox_id: &str, org_id: &str) -> Result<SandboxView> {
        let session = self.metadata.get_session(sandbox_id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }

        if session.status == SandboxStatus::Hibernated {
            return Ok(SandboxView {
                sandbox_id: session.sandbox_id.clone(),
                connect_url: None,
                token: None,
                domain: self.domain_for(&session.sandbox_id),
                status: session.status,
                region: session.region,
                worker_id: None,
            });
        }

        let worker_id = session
            .worker_id
            .clone()
            .ok_or_else(|| OpenSandboxError::Internal("running session missing worker_id".into()))?;
        let tok = self.issue_token(org_id, sandbox_id, &worker_id, self.config.token_ttl)?;

        Ok(SandboxView {
            sandbox_id: session.sandbox_id.clone(),
            connect_url: Some(format!("https://{}", self.domain_for(&session.sandbox_id))),
            token: Some(tok),
            domain: self.domain_for(&session.sandbox_id),
            status: session.status,
            region: session.region,
            worker_id: Some(worker_id),
        })
    }

    pub async fn list(&self, org_id: &str) -> Result<Vec<SandboxView>> {
        let sessions = self.metadata.list_sessions_for_org(org_id).await?;
        let mut views = Vec::with_capacity(sessions.len());
        for session in sessions {
            views.push(match self.get(&session.sandbox_id, org_id).await {
                Ok(view) => view,
                Err(_) => SandboxView {
                    sandbox_id: session.sandbox_id.clone(),
                    connect_url: None,
                    token: None,
                    domain: self.domain_for(&session.sandbox_id),
                    status: session.status,
                    region: session.region,
                    worker_id: session.worker_id,
                },
            });
        }
        Ok(views)
    }

    /// Idempotent: killing an already-stopped sandbox is a no-op.
    pub async fn kill(&self, sandbox_id: &str, org_id: &str) -> Result<()> {
        let session = self.metadata.get_session(sandbox_id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }
        if session.status == SandboxStatus::Stopped {
            return Ok(());
        }

        if let Some(worker_id) = &session.worker_id {
            if let Ok(mut client) = self.registry.client_for(worker_id).await {
                let _ = client
                    .destroy_sandbox(proto::DestroySandboxRequest {
                        sandbox_id: sandbox_id.to_string(),
                    })
                    .await;
            }
        }

        self.metadata.mark_session_stopped(sandbox_id).await?;

        for preview in self.metadata.list_preview_urls_for_sandbox(sandbox_id).await? {
            if let Some(cdn_hostname_id) = &preview.external_cdn_hostname_id {
                if let Err(e) = self.cdn.delete_custom_hostname(cdn_hostname_id).await {
                    tracing::warn!(
                        sandbox_id = %sandbox_id, cdn_hostname_id = %cdn_hostname_id, error = %e,
                        "best-effort external CDN hostname cleanup failed"
                    );
                }
            }
        }
        self.metadata.delete_preview_urls_for_sandbox(sandbox_id).await?;
        Ok(())
    }

    pub async fn set_timeout(&self, sandbox_id: &str, org_id: &str, timeout_secs: u64) -> Result<()> {
        let session = self.metadata.get_session(sandbox_id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }
        let worker_id = session
            .worker_id
            .ok_or_else(|| OpenSandboxError::Conflict("sandbox is not running".into()))?;
        let mut client = self.registry.client_for(&worker_id).await?;
        let response = client
            .set_timeout(proto::SetTimeoutRequest {
                sandbox_id: sandbox_id.to_string(),
                idle_timeout_secs: timeout_secs,
            })
            .await?
            .into_inner();
        if response.status != proto::Status::StatusOk as i32 {
            return Err(OpenSandboxError::Upstream(response.error));
        }
        Ok(())
    }

    /// Hibernate an active sandbox. Only valid from status=running.
    pub async fn hibernate(&self, sandbox_id: &str, org_id: &str) -> Result<(String, u64)> {
        let session = self.metadata.get_session(sandbox_id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }
        if session.status != SandboxStatus::Running {
            return Err(OpenSandboxError::Conflict("sandbox is not running".into()));
        }
        let worker_id = session
            .worker_id
            .clone()
            .ok_or_else(|| OpenSandboxError::Internal("running session missing worker_id".into()))?;

        let mut client = self.registry.client_for(&worker_id).await?;
        let response = client
            .hibernate_sandbox(proto::HibernateSandboxRequest {
                sandbox_id: sandbox_id.to_string(),
            })
            .await?
            .into_inner();
        if response.status != proto::Status::StatusOk as i32 {
            return Err(OpenSandboxError::Upstream(response.error));
        }

        let checkpoint = Checkpoint {
            id: 0,
            sandbox_id: sandbox_id.to_string(),
            org_id: org_id.to_string(),
            checkpoint_key: response.checkpoint_key.clone(),
            size_bytes: response.size_bytes as i64,
            region: session.region.clone(),
            template: session.template.clone(),
            sandbox_config_json: session.config_json.clone(),
            hibernated_at: chrono::Utc::now(),
            restored_at: None,
            expired_at: None,
        };
        self.metadata.create_checkpoint(&checkpoint).await?;
        self.metadata
            .update_session_status(sandbox_id, SandboxStatus::Hibernated, None)
            .await?;

        Ok((response.checkpoint_key, response.size_bytes))
    }

    /// Wake a hibernated sandbox. Selects ANY least-loaded worker in the
    /// checkpoint's region — not necessarily the one that hibernated it.
    pub async fn wake(&self, sandbox_id: &str, org_id: &str, idle_timeout_secs: u64) -> Result<SandboxView> {
        let session = self.metadata.get_session(sandbox_id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }
        if session.status != SandboxStatus::Hibernated {
            return Err(OpenSandboxError::Conflict("sandbox is not hibernated".into()));
        }

        let checkpoint = self.metadata.get_active_checkpoint(sandbox_id).await?;
        let worker = self.registry.least_loaded(&checkpoint.region)?;

        let mut client = self.registry.client_for(&worker.id).await?;
        let response = client
            .wake_sandbox(proto::WakeSandboxRequest {
                sandbox_id: sandbox_id.to_string(),
                checkpoint_key: checkpoint.checkpoint_key.clone(),
                idle_timeout_secs,
            })
            .await?
            .into_inner();
        if response.status != proto::Status::StatusOk as i32 {
            return Err(OpenSandboxError::Upstream(response.error));
        }

        self.metadata.mark_checkpoint_restored(checkpoint.id).await?;
        self.metadata
            .update_session_status(sandbox_id, SandboxStatus::Running, None)
            .await?;
        self.metadata.update_session_worker(sandbox_id, Some(&worker.id)).await?;

        crate::metrics::metrics().record_wake(true);

        let tok = self.issue_token(org_id, sandbox_id, &worker.id, self.config.token_ttl)?;
        Ok(SandboxView {
            sandbox_id: sandbox_id.to_string(),
            connect_url: Some(format!("https://{}", self.domain_for(sandbox_id))),
            token: Some(tok),
            domain: self.domain_for(sandbox_id),
            status: SandboxStatus::Running,
            region: checkpoint.region,
            worker_id: Some(worker.id),
        })
    }

    /// Builds a template image from a Dockerfile on any least-loaded worker
    /// in `region`, then records the result as a Template row. Not bound to
    /// an existing sandbox.
    pub async fn build_template(
        &self,
        org_id: &str,
        template_id: &str,
        dockerfile: &str,
        region: &str,
    ) -> Result<Template> {
        let worker = self.registry.least_loaded(region)?;
        let mut client = self.registry.client_for(&worker.id).await?;
        let response = client
            .build_template(proto::BuildTemplateRequest {
                template_id: template_id.to_string(),
                dockerfile: dockerfile.to_string(),
            })
            .await?
            .into_inner();

        let template = if response.status == proto::Status::StatusOk as i32 {
            Template {
                id: template_id.to_string(),
                org_id: org_id.to_string(),
                based_on_sandbox_id: None,
                checkpoint_key: None,
                image_ref: Some(response.image_ref),
                status: TemplateStatus::Ready,
                error_msg: None,
                created_at: chrono::Utc::now(),
            }
        } else {
            Template {
                id: template_id.to_string(),
                org_id: org_id.to_string(),
                based_on_sandbox_id: None,
                checkpoint_key: None,
                image_ref: None,
                status: TemplateStatus::Error,
                error_msg: Some(response.error),
                created_at: chrono::Utc::now(),
            }
        };
        self.metadata.create_template(&template).await?;
        if template.status == TemplateStatus::Error {
            return Err(OpenSandboxError::Upstream(
                template.error_msg.unwrap_or_default(),
            ));
        }
        Ok(template)
    }

    /// Pauses the sandbox, snapshots it under template-named keys, resumes
    /// it, and records the result as a Template row bound to `sandbox_id`.
    pub async fn save_as_template(&self, sandbox_id: &str, org_id: &str, template_id: &str) -> Result<Template> {
        let session = self.metadata.get_session(sandbox_id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }
        let worker_id = session
            .worker_id
            .ok_or_else(|| OpenSandboxError::Conflict("sandbox is not running".into()))?;

        let mut client = self.registry.client_for(&worker_id).await?;
        let response = client
            .save_as_template(proto::SaveAsTemplateRequest {
                sandbox_id: sandbox_id.to_string(),
                template_id: template_id.to_string(),
            })
            .await?
            .into_inner();

        let template = if response.status == proto::Status::StatusOk as i32 {
            Template {
                id: template_id.to_string(),
                org_id: org_id.to_string(),
                based_on_sandbox_id: Some(sandbox_id.to_string()),
                checkpoint_key: Some(response.checkpoint_key),
                image_ref: None,
                status: TemplateStatus::Ready,
                error_msg: None,
                created_at: chrono::Utc::now(),
            }
        } else {
            Template {
                id: template_id.to_string(),
                org_id: org_id.to_string(),
                based_on_sandbox_id: Some(sandbox_id.to_string()),
                checkpoint_key: None,
                image_ref: None,
                status: TemplateStatus::Error,
                error_msg: Some(response.error),
                created_at: chrono::Utc::now(),
            }
        };
        self.metadata.create_template(&template).await?;
        if template.status == TemplateStatus::Error {
            return Err(OpenSandboxError::Upstream(
                template.error_msg.unwrap_or_default(),
            ));
        }
        Ok(template)
    }

    /// Reconciliation on worker startup: sessions the
    /// metadata store still thinks are running on `worker_id` are set to
    /// hibernated (if an active checkpoint exists) or stopped otherwise.
    pub async fn reconcile_worker_restart(&self, worker_id: &str) -> Result<()> {
        let sessions = self.metadata.list_sessions_for_worker(worker_id).await?;
        for session in sessions {
            if session.status != SandboxStatus::Running {
                continue;
            }
            match self.metadata.get_active_checkpoint(&session.sandbox_id).await {
                Ok(_) => {
                    self.metadata
                        .update_session_status(&session.sandbox_id, SandboxStatus::Hibernated, None)
                        .await?;
                }
                Err(_) => {
                    self.metadata
                        .update_session_status(
                            &session.sandbox_id,
                            SandboxStatus::Stopped,
                            Some("worker restarted"),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> &SharedWorkerRegistry {
        &self.registry
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn config(&self) -> &'static Config {
        self.config
    }
}
