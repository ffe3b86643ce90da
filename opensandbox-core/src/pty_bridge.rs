//! `PTYBridge`: the end-to-end terminal pipe from browser to the
//! worker's kernel PTY, CP half. The worker-side WebSocket endpoint this
//! dials is where the Router Touch-on-inbound-frame keepalive actually
//! happens (the CP holds no Router of its own); see the worker's PTY stream
//! handler in `api.rs`.

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as TtMessage;

use crate::error::{OpenSandboxError, Result};
use crate::lifecycle::ControlLifecycle;
use crate::proto;
use crate::token;

pub struct PtyBridge {
    lifecycle: Arc<ControlLifecycle>,
}

/// A PTY ready to stream: the worker that holds it, the token scoping access
/// to it, and the sessionId the worker assigned.
pub struct PtyHandle {
    pub session_id: String,
    pub worker_http_addr: String,
    pub token: String,
}

impl PtyBridge {
    pub fn new(lifecycle: Arc<ControlLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// PTY create: validate org/running, issue a 5-minute sandbox
    /// token, dispatch CreatePTY to the owning worker.
    pub async fn create(
        &self,
        sandbox_id: &str,
        org_id: &str,
        cols: u16,
        rows: u16,
        shell: &str,
    ) -> Result<PtyHandle> {
        let session = self.lifecycle.metadata().get_session(sandbox_id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }
        let worker_id = session
            .worker_id
            .clone()
            .ok_or_else(|| OpenSandboxError::Conflict("sandbox is not running".into()))?;

        let mut client = self.lifecycle.registry().client_for(&worker_id).await?;
        let response = client
            .create_pty(proto::CreatePtyRequest {
                sandbox_id: sandbox_id.to_string(),
                cols: cols as u32,
                rows: rows as u32,
                shell: shell.to_string(),
            })
            .await?
            .into_inner();
        if response.status != proto::Status::StatusOk as i32 {
            return Err(OpenSandboxError::Upstream(response.error));
        }

        let worker = self
            .lifecycle
            .registry()
            .get(&worker_id)
            .ok_or_else(|| OpenSandboxError::WorkerUnavailable(format!("worker {worker_id} not registered")))?;

        let token = token::issue(
            &self.lifecycle.config().token_signing_key,
            org_id,
            sandbox_id,
            &worker_id,
            self.lifecycle.config().pty_token_ttl,
        )?;

        Ok(PtyHandle {
            session_id: response.session_id,
            worker_http_addr: worker.http_addr,
            token,
        })
    }

    /// PTY stream: dial the worker's PTY WebSocket with the bearer
    /// token and splice frames until either side closes.
    pub async fn bridge(&self, client_socket: WebSocket, sandbox_id: &str, handle: &PtyHandle) {
        let url = format!(
            "ws://{}/sandboxes/{}/pty/{}",
            handle.worker_http_addr, sandbox_id, handle.session_id
        );
        let request = match http::Request::builder()
            .uri(&url)
            .header("Authorization", format!("Bearer {}", handle.token))
            .body(())
        {
            Ok(r) => r,
            Err(_) => return,
        };

        let Ok((worker_socket, _)) = tokio_tungstenite::connect_async(request).await else {
            return;
        };

        let (mut client_tx, mut client_rx) = client_socket.split();
        let (mut worker_tx, mut worker_rx) = worker_socket.split();

        let client_to_worker = async {
            while let Some(Ok(msg)) = client_rx.next().await {
                let bytes: Vec<u8> = match msg {
                    AxumMessage::Binary(b) => b.into(),
                    AxumMessage::Text(t) => t.as_bytes().to_vec(),
                    AxumMessage::Close(_) => break,
                    _ => continue,
                };
                if worker_tx.send(TtMessage::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        };

        let worker_to_client = async {
            while let Some(Ok(msg)) = worker_rx.next().await {
                let bytes: Vec<u8> = match msg {
                    TtMessage::Binary(b) => b.into(),
                    TtMessage::Text(t) => t.as_bytes().to_vec(),
                    TtMessage::Close(_) => break,
                    _ => continue,
                };
                if client_tx.send(AxumMessage::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = client_to_worker => {}
            _ = worker_to_client => {}
        }
    }
}
