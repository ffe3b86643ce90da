//! Sandbox-scoped access tokens: a signed tuple `(orgId, sandboxId, workerId, exp)`.
//!
//! PASETO v4.local (symmetric, authenticated encryption) — a plain signed
//! tuple rather than a wallet-address claim, since there is no on-chain
//! identity in this system. The worker validates every
//! request against its own copy of `TOKEN_SIGNING_KEY`, never against the
//! control plane, and `sandbox_id` is bound into the claim so a stale token
//! cannot be replayed against a different sandbox.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{OpenSandboxError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxClaims {
    pub org_id: String,
    pub sandbox_id: String,
    pub worker_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn symmetric_key(key_bytes: &[u8; 32]) -> Result<pasetors::keys::SymmetricKey<pasetors::version4::V4>> {
    pasetors::keys::SymmetricKey::<pasetors::version4::V4>::from(key_bytes)
        .map_err(|e| OpenSandboxError::Internal(format!("failed to build signing key: {e}")))
}

/// Issue a fresh token for (org, sandbox, worker) with the given TTL.
///
/// Every Get/List/Wake mints a new token; tokens rotate rather than being
/// reused across calls.
pub fn issue(
    key_bytes: &[u8; 32],
    org_id: &str,
    sandbox_id: &str,
    worker_id: &str,
    ttl: Duration,
) -> Result<String> {
    let key = symmetric_key(key_bytes)?;
    let now = now_secs();
    let expires_at = now + ttl.as_secs();

    let mut claims = pasetors::claims::Claims::new()
        .map_err(|e| OpenSandboxError::Internal(format!("failed to build claims: {e}")))?;
    claims
        .add_additional("org_id", serde_json::json!(org_id))
        .map_err(|e| OpenSandboxError::Internal(format!("failed to add org_id claim: {e}")))?;
    claims
        .add_additional("sandbox_id", serde_json::json!(sandbox_id))
        .map_err(|e| OpenSandboxError::Internal(format!("failed to add sandbox_id claim: {e}")))?;
    claims
        .add_additional("worker_id", serde_json::json!(worker_id))
        .map_err(|e| OpenSandboxError::Internal(format!("failed to add worker_id claim: {e}")))?;
    claims
        .add_additional("iat", serde_json::json!(now))
        .map_err(|e| OpenSandboxError::Internal(format!("failed to add iat claim: {e}")))?;

    let exp_dt = time::OffsetDateTime::from_unix_timestamp(expires_at as i64)
        .map_err(|e| OpenSandboxError::Internal(format!("invalid expiration: {e}")))?;
    let exp_str = exp_dt
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|e| OpenSandboxError::Internal(format!("failed to format expiration: {e}")))?;
    claims
        .expiration(&exp_str)
        .map_err(|e| OpenSandboxError::Internal(format!("failed to set expiration: {e}")))?;

    pasetors::local::encrypt(&key, &claims, None, None)
        .map_err(|e| OpenSandboxError::Internal(format!("failed to encrypt token: {e}")))
}

/// Validate a token, returning its claims. Does not check sandbox/org binding
/// against a request — callers must compare `claims.sandbox_id`/`org_id`
/// themselves (cross-org / cross-sandbox checks belong to the caller).
pub fn validate(key_bytes: &[u8; 32], token: &str) -> Result<SandboxClaims> {
    let key = symmetric_key(key_bytes)?;

    let untrusted = pasetors::token::UntrustedToken::try_from(token)
        .map_err(|e| OpenSandboxError::Unauthorized(format!("invalid token: {e}")))?;

    let rules = pasetors::claims::ClaimsValidationRules::new();
    let trusted = pasetors::local::decrypt(&key, &untrusted, &rules, None, None)
        .map_err(|e| OpenSandboxError::Unauthorized(format!("token decryption failed: {e}")))?;

    let payload = trusted.payload();
    let json: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| OpenSandboxError::Unauthorized(format!("invalid token payload: {e}")))?;

    let field = |name: &str| -> Result<String> {
        json.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| OpenSandboxError::Unauthorized(format!("missing {name} claim")))
    };

    let org_id = field("org_id")?;
    let sandbox_id = field("sandbox_id")?;
    let worker_id = field("worker_id")?;
    let issued_at = json.get("iat").and_then(|v| v.as_u64()).unwrap_or(0);

    let exp_str = json
        .get("exp")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OpenSandboxError::Unauthorized("missing exp claim".into()))?;
    let exp_dt =
        time::OffsetDateTime::parse(exp_str, &time::format_description::well_known::Rfc3339)
            .map_err(|e| OpenSandboxError::Unauthorized(format!("invalid exp format: {e}")))?;
    let expires_at = exp_dt.unix_timestamp() as u64;

    if now_secs() > expires_at {
        return Err(OpenSandboxError::Unauthorized("token expired".into()));
    }

    Ok(SandboxClaims {
        org_id,
        sandbox_id,
        worker_id,
        issued_at,
        expires_at,
    })
}

/// Extract a Bearer token from an `Authorization` header value.
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn round_trips_claims() {
        let key = test_key();
        let token = issue(&key, "org-1", "sbx-1", "worker-1", Duration::from_secs(3600)).unwrap();
        let claims = validate(&key, &token).unwrap();
        assert_eq!(claims.org_id, "org-1");
        assert_eq!(claims.sandbox_id, "sbx-1");
        assert_eq!(claims.worker_id, "worker-1");
    }

    #[test]
    fn rejects_expired_token() {
        let key = test_key();
        let token = issue(&key, "org-1", "sbx-1", "worker-1", Duration::from_secs(0)).unwrap();
        // Expiration is second-granularity; a zero-TTL token is already expired
        // or expires within the same second — sleep past the boundary.
        std::thread::sleep(Duration::from_millis(1100));
        assert!(validate(&key, &token).is_err());
    }

    #[test]
    fn rejects_token_signed_with_different_key() {
        let key = test_key();
        let other_key = [9u8; 32];
        let token = issue(&key, "org-1", "sbx-1", "worker-1", Duration::from_secs(60)).unwrap();
        assert!(validate(&other_key, &token).is_err());
    }

    #[test]
    fn extract_bearer_token() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("bearer xyz"), Some("xyz"));
        assert_eq!(extract_bearer("Basic abc"), None);
    }
}
