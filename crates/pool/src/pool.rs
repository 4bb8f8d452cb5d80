//! Round-robin credential pool.

use arc_swap::ArcSwap;
use clashgate_types::{Credential, GatewayError, Result, credential};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The set of credentials eligible for selection, in rotation order.
///
/// Selection is a single atomic increment: concurrent callers never block
/// and each call advances the cursor exactly once. The list is replaced
/// wholesale on refresh, so a caller sees either the old or the new list,
/// never a mix. The pool is never empty.
pub struct KeyPool {
    /// Current credential list, atomically swappable.
    keys: ArcSwap<Vec<Credential>>,
    /// Monotonic selection counter; wraps on overflow, which only perturbs
    /// fairness for a single cycle.
    cursor: AtomicUsize,
}

fn non_empty(keys: Vec<Credential>) -> Result<Vec<Credential>> {
    let keys = credential::normalize(keys.iter().map(Credential::expose));
    if keys.is_empty() {
        Err(GatewayError::Config(
            "credential list is empty after removing blank entries".into(),
        ))
    } else {
        Ok(keys)
    }
}

impl KeyPool {
    /// Builds a pool from raw strings, trimming and de-duplicating them.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if no usable credential remains.
    pub fn load<I, S>(raw: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_credentials(credential::normalize(raw))
    }

    /// Builds a pool from already-parsed credentials.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if `keys` has no usable entry.
    pub fn from_credentials(keys: Vec<Credential>) -> Result<Self> {
        let keys = non_empty(keys)?;
        Ok(Self {
            keys: ArcSwap::from_pointee(keys),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Returns the next credential in rotation.
    pub fn next(&self) -> Credential {
        let keys = self.keys.load();
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % keys.len();
        keys[idx].clone()
    }

    /// Atomically replaces the credential list. Returns the new pool size.
    ///
    /// The cursor is kept, so rotation continues from its current position
    /// modulo the new size.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if `keys` has no usable entry; the
    /// previous list stays active.
    pub fn refresh(&self, keys: Vec<Credential>) -> Result<usize> {
        let keys = non_empty(keys)?;
        let len = keys.len();
        self.keys.store(Arc::new(keys));
        Ok(len)
    }

    /// Number of credentials in the current list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    /// Always `false`; present for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.load().is_empty()
    }

    /// A consistent view of the current list.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Credential>> {
        self.keys.load_full()
    }
}
