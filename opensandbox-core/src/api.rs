//! `APISurface`: the public HTTP surface, CP and worker halves, plus
//! the authentication extractor that gates it. Router-builder shape (CORS
//! layer, tiered rate-limit layers merged onto one `Router`, `oneshot`-driven
//! tests) generalized to
//! sandbox lifecycle CRUD instead of provisioning/secrets endpoints.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::{OpenSandboxError, Result};
use crate::lifecycle::{ControlLifecycle, CreateSandboxRequest, SandboxView, WorkerLifecycle};
use crate::proto;
use crate::proxy::SubdomainProxy;
use crate::pty_bridge::PtyBridge;
use crate::rate_limit;

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Resolves to the requesting org's id. The external identity provider and
/// API-key CRUD are out of scope; this extractor treats the bearer
/// value (or `session` cookie) as the org id directly and confirms it names
/// a known org, standing in for whatever issues real API keys upstream.
pub struct OrgAuth(pub String);

impl<S> FromRequestParts<S> for OrgAuth
where
    ApiState: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let state = ApiState::from_ref(state);
        let candidate = bearer_or_api_key(&parts.headers).or_else(|| session_cookie(&parts.headers));
        let Some(org_id) = candidate else {
            return Err(OpenSandboxError::Unauthorized("missing API key or session cookie".into())
                .into_response());
        };

        match state.lifecycle.metadata().get_org(&org_id).await {
            Ok(_) => Ok(OrgAuth(org_id)),
            Err(_) => Err(OpenSandboxError::Unauthorized("unknown API key".into()).into_response()),
        }
    }
}

fn bearer_or_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(crate::token::extract_bearer)
        .map(str::to_string)
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|kv| {
        let (name, value) = kv.trim().split_once('=')?;
        (name == "session").then(|| value.to_string())
    })
}

// ---------------------------------------------------------------------------
// CP state and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    pub lifecycle: Arc<ControlLifecycle>,
    pub pty_bridge: Arc<PtyBridge>,
    pub proxy: Arc<SubdomainProxy>,
    pub heartbeats: Arc<crate::heartbeat::HeartbeatConsumer>,
}

fn build_cors_layer() -> CorsLayer {
    use axum::http::{Method, header};

    let origins_env = std::env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default();
    let methods = vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS];
    let headers = vec![header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT, "x-api-key".parse().unwrap()];

    if origins_env.is_empty() || origins_env == "*" {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        let origins: Vec<_> = origins_env.split(',').filter_map(|s| s.trim().parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}

pub fn control_router(state: ApiState) -> Router {
    let read_routes = Router::new()
        .route("/api/sandboxes", get(list_sandboxes))
        .route("/api/sandboxes/{id}", get(get_sandbox))
        .layer(axum::middleware::from_fn(rate_limit::read_rate_limit));

    let write_routes = Router::new()
        .route("/api/sandboxes", post(create_sandbox))
        .route("/api/sandboxes/{id}", delete(kill_sandbox))
        .route("/api/sandboxes/{id}/hibernate", post(hibernate_sandbox))
        .route("/api/sandboxes/{id}/wake", post(wake_sandbox))
        .route("/api/sandboxes/{id}/timeout", post(set_timeout))
        .route("/api/sandboxes/{id}/commands", post(exec_command))
        .route(
            "/api/sandboxes/{id}/files",
            get(get_file).put(put_file).delete(delete_file),
        )
        .route("/api/sandboxes/{id}/pty", post(create_pty))
        .route("/api/sandboxes/{id}/pty/{session_id}", get(pty_stream).delete(kill_pty))
        .route("/api/sandboxes/{id}/pty/{session_id}/resize", post(resize_pty))
        .layer(axum::middleware::from_fn(rate_limit::write_rate_limit));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/internal/heartbeat", post(internal_heartbeat));

    Router::new()
        .merge(health_routes)
        .merge(read_routes)
        .merge(write_routes)
        .layer(axum::middleware::from_fn_with_state(state.proxy.clone(), crate::proxy::subdomain_middleware))
        .layer(build_cors_layer())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    let m = crate::metrics::metrics();
    Json(serde_json::json!({
        "status": "ok",
        "active_sandboxes": m.active_sandboxes.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

async fn metrics_text() -> impl IntoResponse {
    let body = crate::metrics::metrics()
        .snapshot()
        .into_iter()
        .map(|(k, v)| format!("opensandbox_{k} {v}\n"))
        .collect::<String>();
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], body)
}

/// Ingestion endpoint for `heartbeat::emit_loop`'s `publish` closure when the
/// control plane and workers run as separate processes.
/// Combined-role processes skip this entirely and call
/// `HeartbeatConsumer::ingest` in-process.
async fn internal_heartbeat(
    State(state): State<ApiState>,
    Json(payload): Json<crate::heartbeat::HeartbeatPayload>,
) -> impl IntoResponse {
    state.heartbeats.ingest(payload).await;
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Sandbox lifecycle
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    template: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    envs: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    memory_mb: i64,
    #[serde(default)]
    cpu_count: i64,
    #[serde(default)]
    network_enabled: bool,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct SandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "connectURL")]
    connect_url: Option<String>,
    token: Option<String>,
    domain: String,
    status: String,
    region: String,
    #[serde(rename = "workerID")]
    worker_id: Option<String>,
}

impl From<SandboxView> for SandboxResponse {
    fn from(v: SandboxView) -> Self {
        Self {
            sandbox_id: v.sandbox_id,
            connect_url: v.connect_url,
            token: v.token,
            domain: v.domain,
            status: v.status.to_string(),
            region: v.region,
            worker_id: v.worker_id,
        }
    }
}

async fn create_sandbox(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Json(body): Json<CreateBody>,
) -> Response {
    let req = CreateSandboxRequest {
        org_id,
        template: body.template,
        timeout_secs: body.timeout,
        envs: body.envs.into_iter().collect(),
        memory_mb: body.memory_mb,
        cpu_count: body.cpu_count,
        network_enabled: body.network_enabled,
        region: body.region,
        port: body.port,
        metadata: body.metadata,
    };
    match state.lifecycle.create(req).await {
        Ok(view) => (StatusCode::CREATED, Json(SandboxResponse::from(view))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_sandbox(State(state): State<ApiState>, OrgAuth(org_id): OrgAuth, Path(id): Path<String>) -> Response {
    match state.lifecycle.get(&id, &org_id).await {
        Ok(view) => Json(SandboxResponse::from(view)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_sandboxes(State(state): State<ApiState>, OrgAuth(org_id): OrgAuth) -> Response {
    match state.lifecycle.list(&org_id).await {
        Ok(views) => Json(views.into_iter().map(SandboxResponse::from).collect::<Vec<_>>()).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn kill_sandbox(State(state): State<ApiState>, OrgAuth(org_id): OrgAuth, Path(id): Path<String>) -> Response {
    match state.lifecycle.kill(&id, &org_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct HibernateResponse {
    #[serde(rename = "checkpointKey")]
    checkpoint_key: String,
    #[serde(rename = "sizeBytes")]
    size_bytes: u64,
    status: &'static str,
}

async fn hibernate_sandbox(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
) -> Response {
    match state.lifecycle.hibernate(&id, &org_id).await {
        Ok((checkpoint_key, size_bytes)) => Json(HibernateResponse {
            checkpoint_key,
            size_bytes,
            status: "hibernated",
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize, Default)]
struct TimeoutBody {
    #[serde(default)]
    timeout: Option<u64>,
}

async fn wake_sandbox(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
    Json(body): Json<TimeoutBody>,
) -> Response {
    let timeout = body.timeout.unwrap_or(state.lifecycle.config().default_idle_timeout.as_secs());
    match state.lifecycle.wake(&id, &org_id, timeout).await {
        Ok(view) => Json(SandboxResponse::from(view)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn set_timeout(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
    Json(body): Json<TimeoutBody>,
) -> Response {
    let Some(timeout) = body.timeout else {
        return OpenSandboxError::Validation("timeout is required".into()).into_response();
    };
    match state.lifecycle.set_timeout(&id, &org_id, timeout).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Commands (gRPC ExecCommand), files and PTY (proxied to worker HTTP)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CommandBody {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Serialize)]
struct CommandResponse {
    #[serde(rename = "exitCode")]
    exit_code: i32,
    stdout: String,
    stderr: String,
}

async fn exec_command(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
    Json(body): Json<CommandBody>,
) -> Response {
    async fn run(state: &ApiState, id: &str, org_id: &str, body: CommandBody) -> Result<CommandResponse> {
        let session = state.lifecycle.metadata().get_session(id).await?;
        if session.org_id != org_id {
            return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
        }
        let worker_id = session
            .worker_id
            .ok_or_else(|| OpenSandboxError::Conflict("sandbox is not running".into()))?;
        let mut client = state.lifecycle.registry().client_for(&worker_id).await?;
        let response = client
            .exec_command(proto::ExecCommandRequest {
                sandbox_id: id.to_string(),
                command: body.command,
                args: body.args,
                env: body.env.into_iter().collect(),
                cwd: body.cwd.unwrap_or_default(),
                timeout_ms: body.timeout.unwrap_or(30).saturating_mul(1000),
            })
            .await?
            .into_inner();
        if response.status != proto::Status::StatusOk as i32 {
            return Err(OpenSandboxError::Upstream(response.error));
        }
        Ok(CommandResponse {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }

    match run(&state, &id, &org_id, body).await {
        Ok(r) => Json(r).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

/// Every files/PTY route below has the same "find the session, find the
/// worker" preamble; the worker's own HTTP surface (registered by
/// [`worker_router`]) owns the actual file and PTY operations.
async fn worker_base_url(state: &ApiState, id: &str, org_id: &str) -> Result<String> {
    let session = state.lifecycle.metadata().get_session(id).await?;
    if session.org_id != org_id {
        return Err(OpenSandboxError::Forbidden("sandbox belongs to a different org".into()));
    }
    let worker_id = session
        .worker_id
        .ok_or_else(|| OpenSandboxError::Conflict("sandbox is not running".into()))?;
    let worker = state
        .lifecycle
        .registry()
        .get(&worker_id)
        .ok_or_else(|| OpenSandboxError::WorkerUnavailable(format!("worker {worker_id} not registered")))?;
    Ok(format!("http://{}/sandboxes/{}", worker.http_addr, id))
}

async fn get_file(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
) -> Response {
    let base = match worker_base_url(&state, &id, &org_id).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    proxy_to_worker(reqwest::Method::GET, &format!("{base}/files?path={}", urlencoding_encode(&q.path)), None).await
}

async fn put_file(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
    body: axum::body::Bytes,
) -> Response {
    let base = match worker_base_url(&state, &id, &org_id).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    proxy_to_worker(
        reqwest::Method::PUT,
        &format!("{base}/files?path={}", urlencoding_encode(&q.path)),
        Some(body),
    )
    .await
}

async fn delete_file(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
) -> Response {
    let base = match worker_base_url(&state, &id, &org_id).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    proxy_to_worker(
        reqwest::Method::DELETE,
        &format!("{base}/files?path={}", urlencoding_encode(&q.path)),
        None,
    )
    .await
}

fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

async fn proxy_to_worker(method: reqwest::Method, url: &str, body: Option<axum::body::Bytes>) -> Response {
    let client = match crate::util::http_client() {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let mut builder = client.request(method, url);
    if let Some(body) = body {
        builder = builder.body(body);
    }
    match builder.send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            match resp.bytes().await {
                Ok(bytes) => (status, bytes).into_response(),
                Err(_) => StatusCode::BAD_GATEWAY.into_response(),
            }
        }
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Deserialize)]
struct PtyCreateBody {
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
    #[serde(default = "default_shell")]
    shell: String,
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}

#[derive(Serialize)]
struct PtyCreateResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
    token: String,
}

async fn create_pty(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path(id): Path<String>,
    Json(body): Json<PtyCreateBody>,
) -> Response {
    match state.pty_bridge.create(&id, &org_id, body.cols, body.rows, &body.shell).await {
        Ok(handle) => Json(PtyCreateResponse {
            session_id: handle.session_id,
            token: handle.token,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn pty_stream(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path((id, session_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let base = match worker_base_url(&state, &id, &org_id).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    let worker_http_addr = base
        .trim_start_matches("http://")
        .split_once('/')
        .map(|(addr, _)| addr.to_string())
        .unwrap_or_default();

    let tok = match crate::token::issue(
        &state.lifecycle.config().token_signing_key,
        &org_id,
        &id,
        "",
        state.lifecycle.config().pty_token_ttl,
    ) {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let handle = crate::pty_bridge::PtyHandle {
        session_id,
        worker_http_addr,
        token: tok,
    };
    ws.on_upgrade(move |socket| async move { state.pty_bridge.bridge(socket, &id, &handle).await })
}

async fn resize_pty(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path((id, session_id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let base = match worker_base_url(&state, &id, &org_id).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    proxy_to_worker(
        reqwest::Method::POST,
        &format!("{base}/pty/{session_id}/resize"),
        Some(payload.into()),
    )
    .await
}

async fn kill_pty(
    State(state): State<ApiState>,
    OrgAuth(org_id): OrgAuth,
    Path((id, session_id)): Path<(String, String)>,
) -> Response {
    let base = match worker_base_url(&state, &id, &org_id).await {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    proxy_to_worker(reqwest::Method::DELETE, &format!("{base}/pty/{session_id}"), None).await
}

// ---------------------------------------------------------------------------
// Worker-side HTTP surface: files, PTY, and the raw sandbox passthrough that
// the CP's SubdomainProxy and PTYBridge dial into directly.
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WorkerApiState {
    pub lifecycle: Arc<WorkerLifecycle>,
    pub config: &'static crate::config::Config,
}

pub fn worker_router(state: WorkerApiState) -> Router {
    Router::new()
        .route("/sandboxes/{id}/files", get(worker_get_file).put(worker_put_file).delete(worker_delete_file))
        .route("/sandboxes/{id}/pty/{session_id}", get(worker_pty_stream).delete(worker_kill_pty))
        .route("/sandboxes/{id}/pty/{session_id}/resize", post(worker_resize_pty))
        .with_state(state)
}

async fn worker_get_file(
    State(state): State<WorkerApiState>,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
) -> Response {
    let runtime = state.lifecycle.runtime.clone();
    let router = state.lifecycle.router.clone();
    let path = q.path.clone();
    let id_owned = id.clone();
    let result = router
        .route(&id, move || async move { runtime.read_file(&id_owned, &path).await })
        .await;
    match result {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn worker_put_file(
    State(state): State<WorkerApiState>,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
    body: axum::body::Bytes,
) -> Response {
    let runtime = state.lifecycle.runtime.clone();
    let router = state.lifecycle.router.clone();
    let path = q.path.clone();
    let id_owned = id.clone();
    let result = router
        .route(&id, move || async move { runtime.write_file(&id_owned, &path, &body).await })
        .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn worker_delete_file(
    State(state): State<WorkerApiState>,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
) -> Response {
    let runtime = state.lifecycle.runtime.clone();
    let router = state.lifecycle.router.clone();
    let path = q.path.clone();
    let id_owned = id.clone();
    let result = router
        .route(&id, move || async move { runtime.remove(&id_owned, &path).await })
        .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

async fn worker_resize_pty(
    State(state): State<WorkerApiState>,
    Path((id, session_id)): Path<(String, String)>,
    Json(body): Json<ResizeBody>,
) -> Response {
    let pty = state.lifecycle.pty.clone();
    let router = state.lifecycle.router.clone();
    let result = router
        .route(&id, move || async move {
            match pty.get(&session_id) {
                Some(session) => session.resize(body.cols, body.rows).await,
                None => Err(OpenSandboxError::NotFound(format!("pty session {session_id} not found"))),
            }
        })
        .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn worker_kill_pty(
    State(state): State<WorkerApiState>,
    Path((id, session_id)): Path<(String, String)>,
) -> Response {
    let pty = state.lifecycle.pty.clone();
    let router = state.lifecycle.router.clone();
    let result = router
        .route(&id, move || async move { pty.kill(&session_id) })
        .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Every inbound client frame touches the Router for the sandbox
/// (keepalive), independent of whatever's happening to the rest of the
/// sandbox's operations.
async fn worker_pty_stream(
    State(state): State<WorkerApiState>,
    Path((id, session_id)): Path<(String, String)>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(claims) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(crate::token::extract_bearer)
        .and_then(|tok| crate::token::validate(&state.config.token_signing_key, tok).ok())
    else {
        return OpenSandboxError::Unauthorized("missing or invalid pty token".into()).into_response();
    };
    if claims.sandbox_id != id {
        return OpenSandboxError::Forbidden("token not scoped to this sandbox".into()).into_response();
    }

    let Some(session) = state.lifecycle.pty.get(&session_id) else {
        return OpenSandboxError::NotFound(format!("pty session {session_id} not found")).into_response();
    };
    let router = state.lifecycle.router.clone();
    ws.on_upgrade(move |socket| pty_splice(socket, router, id, session))
}

async fn pty_splice(
    socket: axum::extract::ws::WebSocket,
    router: Arc<crate::router::SandboxRouter>,
    sandbox_id: String,
    session: Arc<crate::pty::PtySession>,
) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let Some(mut output_rx) = session.take_output().await else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    let to_client = async move {
        while let Some(chunk) = output_rx.recv().await {
            if ws_tx.send(Message::Binary(chunk.to_vec().into())).await.is_err() {
                break;
            }
        }
    };

    let from_client = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let bytes: bytes::Bytes = match msg {
                Message::Binary(b) => b.into(),
                Message::Text(t) => bytes::Bytes::from(t.as_bytes().to_vec()),
                Message::Close(_) => break,
                _ => continue,
            };
            let _ = router.touch(&sandbox_id).await;
            if session.send(bytes).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = to_client => {}
        _ = from_client => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, header};

    #[test]
    fn bearer_or_api_key_prefers_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static(" org-123 "));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer org-456"));
        assert_eq!(bearer_or_api_key(&headers).as_deref(), Some("org-123"));
    }

    #[test]
    fn bearer_or_api_key_falls_back_to_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer org-456"));
        assert_eq!(bearer_or_api_key(&headers).as_deref(), Some("org-456"));
    }

    #[test]
    fn bearer_or_api_key_absent_when_no_credentials() {
        let headers = HeaderMap::new();
        assert_eq!(bearer_or_api_key(&headers), None);
    }

    #[test]
    fn session_cookie_extracts_named_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; session=org-789; lang=en"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("org-789"));
    }

    #[test]
    fn session_cookie_absent_without_cookie_header() {
        let headers = HeaderMap::new();
        assert_eq!(session_cookie(&headers), None);
    }

    #[test]
    fn urlencoding_encode_preserves_path_separators() {
        assert_eq!(urlencoding_encode("/workspace/a b.txt"), "/workspace/a%20b.txt");
    }

    #[test]
    fn urlencoding_encode_leaves_unreserved_characters_alone() {
        assert_eq!(urlencoding_encode("abc-123_.~/xyz"), "abc-123_.~/xyz");
    }
}
