//! Durable row types. `MetadataStore` owns these; everything
//! else either goes through it or caches derived, reconstructible state.
//!
//! Status columns are stored as `TEXT` and mapped by hand via
//! `FromStr`/`Display` rather than a native Postgres enum type, so the
//! schema stays a plain external table the migration system (out of scope
//! here) can own without us depending on its column types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OpenSandboxError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Hibernated,
    Stopped,
    Error,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Running => "running",
            SandboxStatus::Hibernated => "hibernated",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SandboxStatus {
    type Err = OpenSandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SandboxStatus::Running),
            "hibernated" => Ok(SandboxStatus::Hibernated),
            "stopped" => Ok(SandboxStatus::Stopped),
            "error" => Ok(SandboxStatus::Error),
            other => Err(OpenSandboxError::Internal(format!(
                "unknown sandbox status '{other}' in database row"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Healthy => "healthy",
            WorkerStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = OpenSandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(WorkerStatus::Healthy),
            "unhealthy" => Ok(WorkerStatus::Unhealthy),
            other => Err(OpenSandboxError::Internal(format!(
                "unknown worker status '{other}' in database row"
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Org {
    pub id: String,
    pub slug: String,
    pub plan: String,
    pub max_concurrent_sandboxes: i64,
    pub max_sandbox_timeout_secs: i64,
    pub custom_domain: Option<String>,
    pub custom_domain_verified: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxSession {
    pub sandbox_id: String,
    pub org_id: String,
    pub template: String,
    pub region: String,
    pub worker_id: Option<String>,
    pub status: SandboxStatus,
    pub config_json: serde_json::Value,
    pub metadata_json: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub based_on_template_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub sandbox_id: String,
    pub org_id: String,
    pub checkpoint_key: String,
    pub size_bytes: i64,
    pub region: String,
    pub template: String,
    pub sandbox_config_json: serde_json::Value,
    pub hibernated_at: DateTime<Utc>,
    pub restored_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn is_active(&self) -> bool {
        self.restored_at.is_none() && self.expired_at.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub region: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub capacity: i64,
    pub current_count: i64,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    pub fn free_capacity(&self) -> i64 {
        (self.capacity - self.current_count).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn sandbox_status_round_trips_through_string() {
        for status in [SandboxStatus::Running, SandboxStatus::Hibernated, SandboxStatus::Stopped, SandboxStatus::Error] {
            assert_eq!(SandboxStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn sandbox_status_rejects_unknown_string() {
        assert!(SandboxStatus::from_str("zombie").is_err());
    }

    #[test]
    fn template_status_round_trips_through_string() {
        for status in [TemplateStatus::Processing, TemplateStatus::Ready, TemplateStatus::Error] {
            assert_eq!(TemplateStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn worker_status_round_trips_through_string() {
        for status in [WorkerStatus::Healthy, WorkerStatus::Unhealthy] {
            assert_eq!(WorkerStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn worker_free_capacity_never_goes_negative() {
        let worker = Worker {
            id: "w1".into(),
            region: "us".into(),
            grpc_addr: "w1:7070".into(),
            http_addr: "w1:7080".into(),
            capacity: 5,
            current_count: 9,
            status: WorkerStatus::Healthy,
            last_heartbeat: Utc::now(),
        };
        assert_eq!(worker.free_capacity(), 0);
    }

    #[test]
    fn checkpoint_is_active_only_without_restore_or_expiry() {
        let base = Checkpoint {
            id: 1,
            sandbox_id: "sbx-1".into(),
            org_id: "org-1".into(),
            checkpoint_key: "checkpoints/sbx-1/1".into(),
            size_bytes: 100,
            region: "us".into(),
            template: "default".into(),
            sandbox_config_json: serde_json::json!({}),
            hibernated_at: Utc::now(),
            restored_at: None,
            expired_at: None,
        };
        assert!(base.is_active());

        let mut restored = base.clone();
        restored.restored_at = Some(Utc::now());
        assert!(!restored.is_active());

        let mut expired = base.clone();
        expired.expired_at = Some(Utc::now());
        assert!(!expired.is_active());
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Processing,
    Ready,
    Error,
}

impl std::fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TemplateStatus::Processing => "processing",
            TemplateStatus::Ready => "ready",
            TemplateStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TemplateStatus {
    type Err = OpenSandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(TemplateStatus::Processing),
            "ready" => Ok(TemplateStatus::Ready),
            "error" => Ok(TemplateStatus::Error),
            other => Err(OpenSandboxError::Internal(format!(
                "unknown template status '{other}' in database row"
            ))),
        }
    }
}

/// A built or saved-from-sandbox image reference, created either by
/// `BuildTemplate` (from a Dockerfile, `image_ref` set) or `SaveAsTemplate`
/// (from a running sandbox's rootfs+workspace, `checkpoint_key` set).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub org_id: String,
    pub based_on_sandbox_id: Option<String>,
    pub checkpoint_key: Option<String>,
    pub image_ref: Option<String>,
    pub status: TemplateStatus,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct PreviewUrl {
    pub id: i64,
    pub sandbox_id: String,
    pub org_id: String,
    pub hostname: String,
    pub port: i32,
    pub external_cdn_hostname_id: Option<String>,
    pub ssl_status: String,
    pub auth_config_json: serde_json::Value,
}
