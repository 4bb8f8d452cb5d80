//! [`CredentialSource`] backed by developer-portal accounts.

use crate::client::{CreateOutcome, PORTAL_BASE, PortalClient};
use async_trait::async_trait;
use clashgate_config::PortalConfig;
use clashgate_types::{Credential, CredentialSource, Result};
use std::time::SystemTime;

/// Provisions keys for the proxy's current public IP across a range of
/// portal accounts.
pub struct PortalSource {
    config: PortalConfig,
    base: String,
}

impl PortalSource {
    #[must_use]
    pub fn new(config: PortalConfig) -> Self {
        Self::with_base(config, PORTAL_BASE)
    }

    /// Targets a portal at `base` instead of the public one.
    #[must_use]
    pub fn with_base(config: PortalConfig, base: impl Into<String>) -> Self {
        Self {
            config,
            base: base.into(),
        }
    }

    /// Brings one account to `keys_per_account` keys valid for the current
    /// IP and returns them.
    async fn provision_account(&self, email: &str) -> Result<Vec<Credential>> {
        let client = PortalClient::new(&self.base)?;
        let ip = client.login(email, &self.config.password).await?;
        let name = self.config.key_name.as_str();
        let want = self.config.keys_per_account;

        let (current, stale): (Vec<_>, Vec<_>) = client
            .list_keys()
            .await?
            .into_iter()
            .filter(|k| k.name == name)
            .partition(|k| k.allows(&ip));

        for key in &stale {
            client.revoke(&key.id).await?;
        }
        if !stale.is_empty() {
            tracing::info!(email, revoked = stale.len(), %ip, "revoked keys bound to another IP");
        }

        let mut keys: Vec<Credential> = current.into_iter().map(|k| Credential::new(k.key)).collect();
        keys.truncate(want);

        let description = format!(
            "Created on {}",
            humantime::format_rfc3339_seconds(SystemTime::now())
        );
        while keys.len() < want {
            match client.create(name, &description, &ip).await? {
                CreateOutcome::Created(key) => keys.push(key),
                CreateOutcome::TooManyKeys => {
                    tracing::warn!(email, have = keys.len(), want, "portal key limit reached");
                    break;
                }
            }
        }
        tracing::debug!(email, keys = keys.len(), %ip, "account provisioned");
        Ok(keys)
    }
}

#[async_trait]
impl CredentialSource for PortalSource {
    async fn acquire(&self) -> Result<Vec<Credential>> {
        let mut all = Vec::new();
        for email in self.config.emails() {
            all.extend(self.provision_account(&email).await?);
        }
        tracing::info!(keys = all.len(), "portal provisioning complete");
        Ok(all)
    }

    fn name(&self) -> &'static str {
        "portal"
    }
}
