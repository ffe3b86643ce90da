//! `PTYManager`: per-sandbox PTY sessions with
//! bidirectional byte streaming, backed by `portable-pty`.

use bytes::Bytes;
use dashmap::DashMap;
use portable_pty::{CommandBuilder, NativePtySystem, PtyPair, PtySize, PtySystem};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::{OpenSandboxError, Result};
use crate::util::new_sandbox_id;

pub struct PtySession {
    pub id: String,
    pub sandbox_id: String,
    /// Bytes produced by the PTY, read by the bridge's writer task.
    pub output_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    /// Bytes to feed to the PTY, written by the bridge's reader task.
    input_tx: mpsc::Sender<Bytes>,
    writer_handle: std::thread::JoinHandle<()>,
    reader_handle: std::thread::JoinHandle<()>,
    master: Box<dyn portable_pty::MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl PtySession {
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| OpenSandboxError::Internal(format!("pty resize failed: {e}")))
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| OpenSandboxError::Gone("pty session closed".into()))
    }

    pub async fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.lock().await.take()
    }

    pub fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .map_err(|e| OpenSandboxError::Internal(format!("failed to kill pty child: {e}")))
    }
}

/// Owns every live PTY session on a worker, keyed by session id.
pub struct PtyManager {
    sessions: DashMap<String, Arc<PtySession>>,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Allocate a PTY running `shell` in the sandbox's workspace, wiring
    /// blocking reader/writer threads (the `portable-pty` API is
    /// synchronous) to async channels the PTY bridge can await on.
    pub fn create(
        &self,
        sandbox_id: &str,
        cwd: &std::path::Path,
        cols: u16,
        rows: u16,
        shell: &str,
    ) -> Result<String> {
        let pty_system = NativePtySystem::default();
        let PtyPair { master, slave } = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| OpenSandboxError::Internal(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(cwd);
        let child = slave
            .spawn_command(cmd)
            .map_err(|e| OpenSandboxError::Internal(format!("failed to spawn shell: {e}")))?;
        drop(slave);

        let mut pty_reader = master
            .try_clone_reader()
            .map_err(|e| OpenSandboxError::Internal(format!("failed to clone pty reader: {e}")))?;
        let mut pty_writer = master
            .take_writer()
            .map_err(|e| OpenSandboxError::Internal(format!("failed to take pty writer: {e}")))?;

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(256);
        let reader_handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match pty_reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(256);
        let writer_handle = std::thread::spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if pty_writer.write_all(&chunk).is_err() {
                    break;
                }
            }
        });

        let session_id = new_sandbox_id().replacen("sbx-", "pty-", 1);
        let session = Arc::new(PtySession {
            id: session_id.clone(),
            sandbox_id: sandbox_id.to_string(),
            output_rx: Mutex::new(Some(output_rx)),
            input_tx,
            writer_handle,
            reader_handle,
            master,
            child,
        });
        self.sessions.insert(session_id.clone(), session);
        crate::metrics::metrics().record_pty_created();
        Ok(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.get(session_id).map(|e| e.clone())
    }

    pub fn kill(&self, session_id: &str) -> Result<()> {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            if let Some(mut session) = Arc::into_inner(session) {
                session.kill()?;
                let _ = session.reader_handle.join();
                let _ = session.writer_handle.join();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn create_then_get_returns_same_session() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = PtyManager::new();
        let id = manager.create("sbx-1", tmp.path(), 80, 24, "sh").unwrap();
        let session = manager.get(&id).unwrap();
        assert_eq!(session.sandbox_id, "sbx-1");
        manager.kill(&id).unwrap();
    }

    #[tokio::test]
    async fn shell_output_is_readable_from_output_channel() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = PtyManager::new();
        let id = manager.create("sbx-1", tmp.path(), 80, 24, "sh").unwrap();
        let session = manager.get(&id).unwrap();

        session.send(Bytes::from_static(b"echo pty-hello\n")).await.unwrap();

        let mut rx = session.take_output().await.unwrap();
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline && !String::from_utf8_lossy(&collected).contains("pty-hello") {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
                _ => break,
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("pty-hello"));
        manager.kill(&id).unwrap();
    }

    #[tokio::test]
    async fn kill_removes_the_session() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = PtyManager::new();
        let id = manager.create("sbx-1", tmp.path(), 80, 24, "sh").unwrap();
        manager.kill(&id).unwrap();
        assert!(manager.get(&id).is_none());
    }

    #[tokio::test]
    async fn get_unknown_session_is_none() {
        let manager = PtyManager::new();
        assert!(manager.get("pty-does-not-exist").is_none());
    }
}
