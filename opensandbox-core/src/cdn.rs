//! `CdnAdapter`: the external edge CDN that terminates TLS for custom
//! hostnames (§1 Out of scope, §6 Subdomain conventions). Opaque to the
//! spec beyond the three operations it names —
//! `CreateCustomHostname`/`GetCustomHostname`/`DeleteCustomHostname` — so
//! this is a capability trait the same way [`crate::runtime::SandboxRuntime`]
//! stands in for the concrete VM/container technology.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Clone, Debug)]
pub struct CustomHostnameStatus {
    pub id: String,
    pub hostname: String,
    pub ssl_status: String,
}

/// Registers/looks up/removes a custom hostname with the edge CDN that
/// terminates TLS in front of `SubdomainProxy`. A sandbox's own
/// `<sandboxId>.<baseDomain>` hostname never goes through this adapter —
/// only org `customDomain`-backed preview URLs do.
#[async_trait]
pub trait CdnAdapter: Send + Sync {
    async fn create_custom_hostname(&self, hostname: &str) -> Result<CustomHostnameStatus>;
    async fn get_custom_hostname(&self, id: &str) -> Result<CustomHostnameStatus>;
    async fn delete_custom_hostname(&self, id: &str) -> Result<()>;
}

/// No-op adapter for deployments with no custom-domain CDN wired up (the
/// default: every sandbox is reachable on `<sandboxId>.<baseDomain>`
/// without registering anything externally). Logs and succeeds so `kill`'s
/// best-effort cleanup never fails a request over it.
pub struct NullCdnAdapter;

#[async_trait]
impl CdnAdapter for NullCdnAdapter {
    async fn create_custom_hostname(&self, hostname: &str) -> Result<CustomHostnameStatus> {
        tracing::debug!(%hostname, "NullCdnAdapter: no CDN configured, skipping hostname registration");
        Ok(CustomHostnameStatus {
            id: hostname.to_string(),
            hostname: hostname.to_string(),
            ssl_status: "none".to_string(),
        })
    }

    async fn get_custom_hostname(&self, id: &str) -> Result<CustomHostnameStatus> {
        Ok(CustomHostnameStatus {
            id: id.to_string(),
            hostname: id.to_string(),
            ssl_status: "none".to_string(),
        })
    }

    async fn delete_custom_hostname(&self, id: &str) -> Result<()> {
        tracing::debug!(hostname_id = %id, "NullCdnAdapter: no CDN configured, skipping hostname deletion");
        Ok(())
    }
}
