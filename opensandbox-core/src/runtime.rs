//! `SandboxRuntime`: the worker-local driver that creates, destroys, and
//! operates on one sandbox. Opaque to the
//! spec — the concrete VM/container technology is an external collaborator;
//! [`LocalProcessRuntime`] is one conforming implementation, modeling a
//! sandbox as a directory plus a process group rooted in it, suitable for
//! a single-node or test deployment.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::checkpoint::CheckpointStore;
use crate::error::{OpenSandboxError, Result};
use crate::router::RuntimeHooks;
use crate::util::checkpoint_key;

pub struct CreateSandboxParams {
    pub sandbox_id: String,
    pub image_ref: String,
    pub cpu_count: u32,
    pub memory_mb: u32,
    pub network_enabled: bool,
    pub envs: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct SandboxStats {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The capability set every sandbox execution backend must provide:
/// create, destroy, exec, read/write/list/make/remove file, stats,
/// snapshot, restore, pause, resume.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn create(&self, params: CreateSandboxParams) -> Result<()>;
    async fn destroy(&self, sandbox_id: &str) -> Result<()>;
    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        cwd: Option<&str>,
    ) -> Result<ExecResult>;
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, sandbox_id: &str, path: &str, data: &[u8]) -> Result<()>;
    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<String>>;
    async fn make_dir(&self, sandbox_id: &str, path: &str) -> Result<()>;
    async fn remove(&self, sandbox_id: &str, path: &str) -> Result<()>;
    async fn stats(&self, sandbox_id: &str) -> Result<SandboxStats>;
    /// Serialize the sandbox's state to the checkpoint store, returning
    /// (checkpointKey, sizeBytes).
    async fn snapshot(&self, sandbox_id: &str) -> Result<(String, u64)>;
    async fn restore(&self, sandbox_id: &str, checkpoint_key: &str) -> Result<()>;
    async fn pause(&self, sandbox_id: &str) -> Result<()>;
    async fn resume(&self, sandbox_id: &str) -> Result<()>;
    /// Builds a template image from a Dockerfile, returning its image
    /// reference. Not bound to any running sandbox.
    async fn build_template(&self, template_id: &str, dockerfile: &str) -> Result<String>;
}

struct SandboxHandle {
    workdir: PathBuf,
    created_at: Instant,
}

/// Models a sandbox as a workspace directory under `root_dir`; commands run
/// as child processes rooted at that directory. Snapshot/restore tar the
/// workspace to/from the `CheckpointStore`.
pub struct LocalProcessRuntime {
    root_dir: PathBuf,
    checkpoint_store: CheckpointStore,
    sandboxes: DashMap<String, SandboxHandle>,
}

impl LocalProcessRuntime {
    pub fn new(root_dir: impl Into<PathBuf>, checkpoint_store: CheckpointStore) -> Self {
        Self {
            root_dir: root_dir.into(),
            checkpoint_store,
            sandboxes: DashMap::new(),
        }
    }

    fn workdir(&self, sandbox_id: &str) -> Result<PathBuf> {
        self.sandboxes
            .get(sandbox_id)
            .map(|h| h.workdir.clone())
            .ok_or_else(|| OpenSandboxError::NotFound(format!("sandbox {sandbox_id} not present on this worker")))
    }

    fn resolve(&self, base: &Path, relative: &str) -> Result<PathBuf> {
        let candidate = base.join(relative.trim_start_matches('/'));
        let canonical_base = base
            .canonicalize()
            .map_err(|e| OpenSandboxError::Internal(format!("workspace missing: {e}")))?;
        // Reject escapes out of the sandbox workspace via `..` components.
        let normalized = path_clean(&candidate);
        if !normalized.starts_with(&canonical_base) && !normalized.starts_with(base) {
            return Err(OpenSandboxError::Validation(format!(
                "path '{relative}' escapes the sandbox workspace"
            )));
        }
        Ok(normalized)
    }
}

fn path_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl SandboxRuntime for LocalProcessRuntime {
    async fn create(&self, params: CreateSandboxParams) -> Result<()> {
        let workdir = self.root_dir.join(&params.sandbox_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("failed to create workspace: {e}")))?;
        self.sandboxes.insert(
            params.sandbox_id.clone(),
            SandboxHandle {
                workdir,
                created_at: Instant::now(),
            },
        );
        tracing::info!(sandbox_id = %params.sandbox_id, image = %params.image_ref, "sandbox workspace created");
        Ok(())
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        if let Some((_, handle)) = self.sandboxes.remove(sandbox_id) {
            let _ = tokio::fs::remove_dir_all(&handle.workdir).await;
        }
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        cwd: Option<&str>,
    ) -> Result<ExecResult> {
        let workdir = self.workdir(sandbox_id)?;
        let exec_dir = match cwd {
            Some(rel) => self.resolve(&workdir, rel)?,
            None => workdir,
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&exec_dir)
            .envs(env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| OpenSandboxError::Upstream(format!("exec failed: {e}")))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        let workdir = self.workdir(sandbox_id)?;
        let target = self.resolve(&workdir, path)?;
        let mut file = tokio::fs::File::open(&target)
            .await
            .map_err(|e| OpenSandboxError::NotFound(format!("{path}: {e}")))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("read failed: {e}")))?;
        Ok(buf)
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let workdir = self.workdir(sandbox_id)?;
        let target = self.resolve(&workdir, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("write failed: {e}")))?;
        file.write_all(data)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("write failed: {e}")))?;
        Ok(())
    }

    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<String>> {
        let workdir = self.workdir(sandbox_id)?;
        let target = self.resolve(&workdir, path)?;
        let mut entries = tokio::fs::read_dir(&target)
            .await
            .map_err(|e| OpenSandboxError::NotFound(format!("{path}: {e}")))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("list_dir failed: {e}")))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn make_dir(&self, sandbox_id: &str, path: &str) -> Result<()> {
        let workdir = self.workdir(sandbox_id)?;
        let target = self.resolve(&workdir, path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("make_dir failed: {e}")))
    }

    async fn remove(&self, sandbox_id: &str, path: &str) -> Result<()> {
        let workdir = self.workdir(sandbox_id)?;
        let target = self.resolve(&workdir, path)?;
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| OpenSandboxError::NotFound(format!("{path}: {e}")))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        }
        .map_err(|e| OpenSandboxError::Internal(format!("remove failed: {e}")))
    }

    async fn stats(&self, sandbox_id: &str) -> Result<SandboxStats> {
        let handle = self
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| OpenSandboxError::NotFound(format!("sandbox {sandbox_id} not present")))?;
        Ok(SandboxStats {
            cpu_millis: 0,
            memory_bytes: 0,
            uptime_secs: handle.created_at.elapsed().as_secs(),
        })
    }

    async fn snapshot(&self, sandbox_id: &str) -> Result<(String, u64)> {
        let workdir = self.workdir(sandbox_id)?;
        let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            {
                let mut builder = tar::Builder::new(&mut buf);
                builder.append_dir_all(".", &workdir)?;
                builder.finish()?;
            }
            Ok(buf)
        })
        .await
        .map_err(|e| OpenSandboxError::Internal(format!("snapshot task panicked: {e}")))?
        .map_err(|e| OpenSandboxError::Internal(format!("failed to archive workspace: {e}")))?;

        let key = checkpoint_key(sandbox_id);
        let size = self.checkpoint_store.put(&key, archive.into()).await?;
        Ok((key, size))
    }

    async fn restore(&self, sandbox_id: &str, checkpoint_key: &str) -> Result<()> {
        let archive = self.checkpoint_store.get(checkpoint_key).await?;
        let workdir = self.root_dir.join(sandbox_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("failed to create workspace: {e}")))?;

        let restore_dir = workdir.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut archive_reader = tar::Archive::new(std::io::Cursor::new(&archive[..]));
            archive_reader.unpack(&restore_dir)
        })
        .await
        .map_err(|e| OpenSandboxError::Internal(format!("restore task panicked: {e}")))?
        .map_err(|e| OpenSandboxError::Internal(format!("failed to unpack checkpoint: {e}")))?;

        self.sandboxes.insert(
            sandbox_id.to_string(),
            SandboxHandle {
                workdir,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn pause(&self, _sandbox_id: &str) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _sandbox_id: &str) -> Result<()> {
        Ok(())
    }

    async fn build_template(&self, template_id: &str, dockerfile: &str) -> Result<String> {
        let dir = self.root_dir.join("templates").join(template_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("failed to create template dir: {e}")))?;
        tokio::fs::write(dir.join("Dockerfile"), dockerfile)
            .await
            .map_err(|e| OpenSandboxError::Internal(format!("failed to write dockerfile: {e}")))?;
        Ok(crate::util::template_image_ref(template_id, dockerfile))
    }
}

/// Adapts a [`SandboxRuntime`] to the narrower [`RuntimeHooks`] interface
/// the Router depends on, so the Router stays ignorant of the full runtime
/// capability set.
pub struct RuntimeHooksAdapter {
    pub runtime: Arc<dyn SandboxRuntime>,
}

#[async_trait]
impl RuntimeHooks for RuntimeHooksAdapter {
    async fn snapshot(&self, sandbox_id: &str) -> Result<(String, u64)> {
        self.runtime.snapshot(sandbox_id).await
    }

    async fn restore(&self, sandbox_id: &str, checkpoint_key: &str) -> Result<()> {
        self.runtime.restore(sandbox_id, checkpoint_key).await
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        self.runtime.destroy(sandbox_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> CheckpointStore {
        CheckpointStore::new("http://localhost:9//unused-in-these-tests")
    }

    #[tokio::test]
    async fn create_makes_workspace_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalProcessRuntime::new(tmp.path(), test_store());
        runtime
            .create(CreateSandboxParams {
                sandbox_id: "sbx-1".into(),
                image_ref: "base".into(),
                cpu_count: 1,
                memory_mb: 256,
                network_enabled: false,
                envs: vec![],
            })
            .await
            .unwrap();
        assert!(tmp.path().join("sbx-1").is_dir());
    }

    #[tokio::test]
    async fn write_then_read_file_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalProcessRuntime::new(tmp.path(), test_store());
        runtime
            .create(CreateSandboxParams {
                sandbox_id: "sbx-1".into(),
                image_ref: "base".into(),
                cpu_count: 1,
                memory_mb: 256,
                network_enabled: false,
                envs: vec![],
            })
            .await
            .unwrap();
        runtime.write_file("sbx-1", "hello.txt", b"hi").await.unwrap();
        let data = runtime.read_file("sbx-1", "hello.txt").await.unwrap();
        assert_eq!(data, b"hi");
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalProcessRuntime::new(tmp.path(), test_store());
        runtime
            .create(CreateSandboxParams {
                sandbox_id: "sbx-1".into(),
                image_ref: "base".into(),
                cpu_count: 1,
                memory_mb: 256,
                network_enabled: false,
                envs: vec![],
            })
            .await
            .unwrap();
        let result = runtime.read_file("sbx-1", "../../etc/passwd").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn build_template_writes_dockerfile_and_returns_stable_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalProcessRuntime::new(tmp.path(), test_store());
        let image_ref = runtime.build_template("tpl-1", "FROM scratch").await.unwrap();
        assert!(image_ref.starts_with("template/tpl-1:"));
        assert!(tmp.path().join("templates/tpl-1/Dockerfile").is_file());
    }

    #[tokio::test]
    async fn exec_runs_command_and_captures_output() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = LocalProcessRuntime::new(tmp.path(), test_store());
        runtime
            .create(CreateSandboxParams {
                sandbox_id: "sbx-1".into(),
                image_ref: "base".into(),
                cpu_count: 1,
                memory_mb: 256,
                network_enabled: false,
                envs: vec![],
            })
            .await
            .unwrap();
        let result = runtime
            .exec("sbx-1", "echo", &["ok".to_string()], &[], None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "ok\n");
    }
}
