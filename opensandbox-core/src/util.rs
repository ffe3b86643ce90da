use once_cell::sync::OnceCell;
use reqwest::Client;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{OpenSandboxError, Result};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared HTTP client used by the checkpoint store, subdomain proxy, and PTY
/// bridge. Built once and reused.
pub fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT
        .get_or_try_init(|| {
            Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|err| OpenSandboxError::Internal(format!("failed to build HTTP client: {err}")))
        })
        .map_err(|err| OpenSandboxError::Internal(err.to_string()))
}

/// Unix timestamp in seconds. The Router uses `Instant` (monotonic) for its
/// own deadlines); this wall-clock helper is for
/// persisted timestamps only (SandboxSession/Checkpoint rows, heartbeats).
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn shell_escape(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Generate an opaque sandbox id: `sbx-<uuid-v4>`.
pub fn new_sandbox_id() -> String {
    format!("sbx-{}", uuid::Uuid::new_v4())
}

/// Generate an opaque checkpoint key under the namespace
/// `checkpoints/<sandboxId>/<timestamp>`.
pub fn checkpoint_key(sandbox_id: &str) -> String {
    format!("checkpoints/{sandbox_id}/{}", now_ts())
}

/// Content-addressed image reference for a built template: the concrete
/// image builder is out of scope, but the reference it would hand back
/// still needs to be stable for a given Dockerfile.
pub fn template_image_ref(template_id: &str, dockerfile: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(dockerfile.as_bytes());
    format!("template/{template_id}:{}", hex::encode(&digest[..6]))
}
