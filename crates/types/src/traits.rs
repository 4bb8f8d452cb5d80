//! Async traits shared across all clashgate crates.
//!
//! Cross-crate abstractions live here so that higher layers depend only on
//! `clashgate-types`, not on each other.

use crate::{Credential, Result};
use async_trait::async_trait;

/// Supplies the credential list the key pool rotates through.
///
/// Implementations run out of the request path: at startup and from the
/// background refresher. Retry and backoff are the caller's concern.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Obtain the full, ordered credential list.
    async fn acquire(&self) -> Result<Vec<Credential>>;

    /// Short name used in log fields.
    fn name(&self) -> &'static str;
}

/// A fixed credential list, typically parsed from configuration.
#[derive(Debug, Clone)]
pub struct StaticSource {
    keys: Vec<Credential>,
}

impl StaticSource {
    /// Creates a source that always yields `keys`.
    #[must_use]
    pub fn new(keys: Vec<Credential>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl CredentialSource for StaticSource {
    async fn acquire(&self) -> Result<Vec<Credential>> {
        Ok(self.keys.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
