//! `CheckpointStore`: blob storage for hibernation snapshots.
//!
//! Talks to an S3-compatible HTTP endpoint with plain PUT/GET/DELETE — no
//! AWS SDK, just `reqwest` against a base URL. Keys are opaque strings
//! namespaced
//! `checkpoints/<sandboxId>/<timestamp>` (see [`crate::util::checkpoint_key`]);
//! this store does not interpret them.

use bytes::Bytes;

use crate::error::{OpenSandboxError, Result};
use crate::util::http_client;

#[derive(Clone)]
pub struct CheckpointStore {
    base_url: String,
}

impl CheckpointStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }

    /// Upload a checkpoint blob, returning its size in bytes.
    pub async fn put(&self, key: &str, body: Bytes) -> Result<u64> {
        let size = body.len() as u64;
        let client = http_client()?;
        let resp = client
            .put(self.object_url(key))
            .header("content-type", "application/octet-stream")
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(OpenSandboxError::Storage(format!(
                "checkpoint upload for {key} failed with status {}",
                resp.status()
            )));
        }
        Ok(size)
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let client = http_client()?;
        let resp = client.get(self.object_url(key)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OpenSandboxError::NotFound(format!("checkpoint {key} not found")));
        }
        if !resp.status().is_success() {
            return Err(OpenSandboxError::Storage(format!(
                "checkpoint download for {key} failed with status {}",
                resp.status()
            )));
        }
        Ok(resp.bytes().await?)
    }

    /// Best-effort delete. A missing object is not an error — checkpoints
    /// may be cleaned up by the caller more than once.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let client = http_client()?;
        let resp = client.delete(self.object_url(key)).send().await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(OpenSandboxError::Storage(format!(
                "checkpoint delete for {key} failed with status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_joins_base_and_key() {
        let store = CheckpointStore::new("http://localhost:9000/bucket/");
        assert_eq!(
            store.object_url("checkpoints/sbx-1/100"),
            "http://localhost:9000/bucket/checkpoints/sbx-1/100"
        );
    }
}
