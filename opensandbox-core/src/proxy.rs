//! `SubdomainProxy`: CP middleware mapping request hostnames to
//! sandboxes, auto-waking hibernated ones with a single wake per burst of
//! concurrent requests (mediated by the owning worker's Router waiters,
//! not by this proxy — a hibernated session here simply dispatches the
//! same Wake path as the public API; concurrent callers racing to wake the
//! same sandboxId serialize on an in-process lock keyed by sandboxId).

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::OpenSandboxError;
use crate::lifecycle::ControlLifecycle;
use crate::metadata::models::SandboxStatus;

/// Strip a `worker.http_addr` (`host:port`) down to just the host, so a
/// caller can substitute the sandbox's own exposed port.
fn host_only(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

pub struct SubdomainProxy {
    lifecycle: Arc<ControlLifecycle>,
    base_domain: String,
    /// One lock per sandboxId currently waking, so concurrent requests to
    /// the same hibernated sandbox block on the same wake rather than
    /// issuing redundant Wake calls.
    wake_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    connect_timeout: Duration,
    wake_timeout: Duration,
}

#[derive(Clone)]
struct ParsedHost {
    sandbox_id: String,
    port: Option<u16>,
    /// Set when this host was resolved via an org's verified custom domain
    /// rather than `*.<baseDomain>` — `proxy_http` must check the resolved
    /// session's org against this before forwarding, so a custom domain
    /// can never be used to reach another org's sandbox.
    custom_domain_org_id: Option<String>,
}

/// Splits a subdomain label of the form `<sandboxId>` or
/// `<sandboxId>-p<port>` into its parts.
fn parse_sandbox_label(label: &str) -> (String, Option<u16>) {
    if let Some((sandbox_id, port_part)) = label.rsplit_once("-p") {
        if let Ok(port) = port_part.parse::<u16>() {
            return (sandbox_id.to_string(), Some(port));
        }
    }
    (label.to_string(), None)
}

fn parse_host(host: &str, base_domain: &str) -> Option<ParsedHost> {
    let prefix = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    if prefix.is_empty() {
        return None;
    }
    let (sandbox_id, port) = parse_sandbox_label(prefix);
    Some(ParsedHost {
        sandbox_id,
        port,
        custom_domain_org_id: None,
    })
}

impl SubdomainProxy {
    pub fn new(
        lifecycle: Arc<ControlLifecycle>,
        base_domain: String,
        connect_timeout: Duration,
        wake_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            base_domain,
            wake_locks: DashMap::new(),
            connect_timeout,
            wake_timeout,
        }
    }

    /// Whether this request's Host header addresses sandbox traffic rather
    /// than the operator API. Checks `*.<baseDomain>` first, falling back to
    /// a verified org custom domain (`<sandboxId>.<org.customDomain>`).
    /// Runs before authentication for subdomain hosts.
    async fn resolve(&self, headers: &HeaderMap) -> Option<ParsedHost> {
        let host = headers.get(axum::http::header::HOST)?.to_str().ok()?;
        let host = host.split(':').next().unwrap_or(host);

        if let Some(parsed) = parse_host(host, &self.base_domain) {
            return Some(parsed);
        }

        let (label, domain) = host.split_once('.')?;
        let (sandbox_id, port) = parse_sandbox_label(label);
        let org = self.lifecycle.metadata().get_org_by_custom_domain(domain).await.ok()?;
        if !org.custom_domain_verified {
            return None;
        }
        Some(ParsedHost {
            sandbox_id,
            port,
            custom_domain_org_id: Some(org.id),
        })
    }

    async fn wake_lock_for(&self, sandbox_id: &str) -> Arc<AsyncMutex<()>> {
        self.wake_locks
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn ensure_running(&self, sandbox_id: &str, org_id: &str) -> Result<(), Response> {
        let session = match self.lifecycle.metadata().get_session(sandbox_id).await {
            Ok(s) => s,
            Err(e) => return Err(e.into_response()),
        };

        if session.status != SandboxStatus::Hibernated {
            return Ok(());
        }

        let lock = self.wake_lock_for(sandbox_id).await;
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another request may have
        // already woken it while we waited.
        let session = match self.lifecycle.metadata().get_session(sandbox_id).await {
            Ok(s) => s,
            Err(e) => return Err(e.into_response()),
        };
        if session.status != SandboxStatus::Hibernated {
            return Ok(());
        }

        crate::metrics::metrics().record_proxy_inline_wake();
        let wake = self.lifecycle.wake(sandbox_id, org_id, 300);
        match tokio::time::timeout(self.wake_timeout, wake).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into_response()),
            Err(_) => Err((StatusCode::GATEWAY_TIMEOUT, "wake timed out").into_response()),
        }
    }

    /// Plain HTTP reverse-proxy path.
    async fn proxy_http(&self, parsed: &ParsedHost, req: Request) -> Response {
        crate::metrics::metrics().record_proxy_request();
        let sandbox_id = parsed.sandbox_id.as_str();

        let session = match self.lifecycle.metadata().get_session(sandbox_id).await {
            Ok(s) => s,
            Err(e) => {
                crate::metrics::metrics().record_proxy_error();
                return e.into_response();
            }
        };

        if let Some(custom_domain_org_id) = &parsed.custom_domain_org_id {
            if *custom_domain_org_id != session.org_id {
                crate::metrics::metrics().record_proxy_error();
                return StatusCode::NOT_FOUND.into_response();
            }
        }

        if let Err(resp) = self.ensure_running(sandbox_id, &session.org_id).await {
            crate::metrics::metrics().record_proxy_error();
            return resp;
        }

        let session = match self.lifecycle.metadata().get_session(sandbox_id).await {
            Ok(s) => s,
            Err(e) => return e.into_response(),
        };
        let Some(worker_id) = session.worker_id else {
            return OpenSandboxError::WorkerUnavailable("sandbox has no assigned worker".into())
                .into_response();
        };
        let Some(worker) = self.lifecycle.registry().get(&worker_id) else {
            return OpenSandboxError::WorkerUnavailable(format!("worker {worker_id} not registered"))
                .into_response();
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = match parsed.port {
            Some(port) => format!(
                "http://{}:{}{}",
                host_only(&worker.http_addr),
                port,
                path_and_query
            ),
            None => format!("http://{}/sandboxes/{}{}", worker.http_addr, sandbox_id, path_and_query),
        };
        let target_uri: Uri = match target.parse() {
            Ok(u) => u,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };

        self.forward(req, target_uri).await
    }

    /// `Upgrade: websocket` path: same hostname resolution, custom-domain
    /// check, and inline wake as `proxy_http`, then hand the connection off
    /// to `splice_websocket` instead of buffering a request/response.
    async fn proxy_websocket(self: Arc<Self>, parsed: ParsedHost, req: Request, ws: WebSocketUpgrade) -> Response {
        crate::metrics::metrics().record_proxy_request();
        let sandbox_id = parsed.sandbox_id.clone();

        let session = match self.lifecycle.metadata().get_session(&sandbox_id).await {
            Ok(s) => s,
            Err(e) => {
                crate::metrics::metrics().record_proxy_error();
                return e.into_response();
            }
        };

        if let Some(custom_domain_org_id) = &parsed.custom_domain_org_id {
            if *custom_domain_org_id != session.org_id {
                crate::metrics::metrics().record_proxy_error();
                return StatusCode::NOT_FOUND.into_response();
            }
        }

        if let Err(resp) = self.ensure_running(&sandbox_id, &session.org_id).await {
            crate::metrics::metrics().record_proxy_error();
            return resp;
        }

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        ws.on_upgrade(move |socket| async move {
            self.splice_websocket(socket, &sandbox_id, &path).await;
        })
    }

    async fn forward(&self, req: Request, target_uri: Uri) -> Response {
        let client = match crate::util::http_client() {
            Ok(c) => c,
            Err(e) => return e.into_response(),
        };

        let method = req.method().clone();
        let headers = req.headers().clone();
        let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
            Ok(b) => b,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };

        let mut builder = client.request(method, target_uri.to_string());
        for (name, value) in headers.iter() {
            if name == axum::http::header::HOST {
                continue;
            }
            builder = builder.header(name, value);
        }

        let upstream = tokio::time::timeout(
            self.connect_timeout,
            builder.body(body_bytes).send(),
        )
        .await;

        match upstream {
            Ok(Ok(resp)) => {
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = match resp.bytes().await {
                    Ok(b) => b,
                    Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
                };
                let mut response = Response::builder().status(status);
                for (name, value) in headers.iter() {
                    response = response.header(name, value);
                }
                response.body(Body::from(body)).unwrap_or_else(|_| {
                    StatusCode::BAD_GATEWAY.into_response()
                })
            }
            Ok(Err(_)) => StatusCode::BAD_GATEWAY.into_response(),
            Err(_) => StatusCode::GATEWAY_TIMEOUT.into_response(),
        }
    }

    /// WebSocket splice path: dial the worker, then copy
    /// frames bidirectionally until either side closes.
    pub async fn splice_websocket(
        &self,
        client_socket: axum::extract::ws::WebSocket,
        sandbox_id: &str,
        path: &str,
    ) {
        let Some(session) = self.lifecycle.metadata().get_session(sandbox_id).await.ok() else {
            return;
        };
        let Some(worker_id) = session.worker_id else { return };
        let Some(worker) = self.lifecycle.registry().get(&worker_id) else { return };

        let url = format!("ws://{}/sandboxes/{}{}", worker.http_addr, sandbox_id, path);
        let Ok((worker_socket, _)) = tokio_tungstenite::connect_async(url).await else {
            return;
        };

        let (mut client_tx, mut client_rx) = client_socket.split();
        let (mut worker_tx, mut worker_rx) = worker_socket.split();

        // Both channels carry arbitrary bytes through as binary frames
        // regardless of the inbound frame type; the input path accepts any
        // frame type and passes bytes through unchanged.
        let client_to_worker = async {
            while let Some(Ok(msg)) = client_rx.next().await {
                use axum::extract::ws::Message as AxumMsg;
                use tokio_tungstenite::tungstenite::Message as TtMsg;
                let bytes: Vec<u8> = match msg {
                    AxumMsg::Binary(b) => b.into(),
                    AxumMsg::Text(t) => t.as_bytes().to_vec(),
                    AxumMsg::Close(_) => break,
                    _ => continue,
                };
                if worker_tx.send(TtMsg::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        };

        let worker_to_client = async {
            while let Some(Ok(msg)) = worker_rx.next().await {
                use axum::extract::ws::Message as AxumMsg;
                use tokio_tungstenite::tungstenite::Message as TtMsg;
                let bytes: Vec<u8> = match msg {
                    TtMsg::Binary(b) => b.into(),
                    TtMsg::Text(t) => t.as_bytes().to_vec(),
                    TtMsg::Close(_) => break,
                    _ => continue,
                };
                if client_tx.send(AxumMsg::Binary(bytes.into())).await.is_err() {
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

pub async fn subdomain_middleware(
    State(proxy): State<Arc<SubdomainProxy>>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
    next: axum::middleware::Next,
) -> Response {
    match proxy.resolve(req.headers()).await {
        Some(parsed) => match ws {
            Some(upgrade) => proxy.proxy_websocket(parsed, req, upgrade).await,
            None => proxy.proxy_http(&parsed, req).await,
        },
        None => next.run(req).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_subdomain() {
        let parsed = parse_host("sbx-1.sandboxes.local", "sandboxes.local").unwrap();
        assert_eq!(parsed.sandbox_id, "sbx-1");
        assert_eq!(parsed.port, None);
    }

    #[test]
    fn parses_port_suffixed_subdomain() {
        let parsed = parse_host("sbx-1-p8080.sandboxes.local", "sandboxes.local").unwrap();
        assert_eq!(parsed.sandbox_id, "sbx-1");
        assert_eq!(parsed.port, Some(8080));
    }

    #[test]
    fn rejects_unrelated_host() {
        assert!(parse_host("example.com", "sandboxes.local").is_none());
    }

    #[test]
    fn rejects_bare_base_domain() {
        assert!(parse_host("sandboxes.local", "sandboxes.local").is_none());
    }

    #[test]
    fn parse_sandbox_label_splits_off_a_trailing_port() {
        assert_eq!(parse_sandbox_label("sbx-1"), ("sbx-1".to_string(), None));
        assert_eq!(parse_sandbox_label("sbx-1-p3000"), ("sbx-1".to_string(), Some(3000)));
        // non-numeric suffix after "-p" isn't a port, stays part of the id
        assert_eq!(parse_sandbox_label("sbx-1-print"), ("sbx-1-print".to_string(), None));
    }

    #[test]
    fn host_only_strips_the_port_component() {
        assert_eq!(host_only("10.0.0.5:9000"), "10.0.0.5");
        assert_eq!(host_only("worker-a"), "worker-a");
    }
}
