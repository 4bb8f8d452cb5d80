//! Aggregate token-bucket admission sized to the credential pool.

use arc_swap::ArcSwap;
use clashgate_types::{GatewayError, Result};
use governor::{
    Quota, RateLimiter as Bucket,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

type DirectBucket = Bucket<NotKeyed, InMemoryState, DefaultClock>;

/// A shared token bucket whose capacity and refill rate are both
/// `per_key_rps × pool_size`.
///
/// Requests wait for a token up to the acquire timeout, then fail with
/// [`GatewayError::RateLimited`] without touching the upstream.
pub struct RateLimiter {
    bucket: ArcSwap<DirectBucket>,
    per_key_rps: u32,
    capacity: AtomicU32,
    acquire_timeout: Duration,
}

fn aggregate_rate(per_key_rps: u32, pool_size: usize) -> Result<NonZeroU32> {
    u32::try_from(pool_size)
        .ok()
        .and_then(|n| per_key_rps.checked_mul(n))
        .and_then(NonZeroU32::new)
        .ok_or_else(|| {
            GatewayError::Config(format!(
                "invalid rate limit: {per_key_rps} rps per key × {pool_size} keys"
            ))
        })
}

impl RateLimiter {
    /// Creates a limiter for a pool of `pool_size` keys.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the aggregate rate is zero or
    /// overflows.
    pub fn new(per_key_rps: u32, pool_size: usize, acquire_timeout: Duration) -> Result<Self> {
        let rate = aggregate_rate(per_key_rps, pool_size)?;
        Ok(Self {
            bucket: ArcSwap::from_pointee(Bucket::direct(Quota::per_second(rate))),
            per_key_rps,
            capacity: AtomicU32::new(rate.get()),
            acquire_timeout,
        })
    }

    /// Waits for a token for at most the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimited`] if no token became available.
    pub async fn acquire(&self) -> Result<()> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Waits for a token for at most `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimited`] if no token became available.
    pub async fn acquire_within(&self, deadline: Duration) -> Result<()> {
        let bucket = self.bucket.load_full();
        if bucket.check().is_ok() {
            return Ok(());
        }
        tokio::time::timeout(deadline, bucket.until_ready())
            .await
            .map_err(|_| GatewayError::RateLimited)
    }

    /// Re-sizes the bucket after the pool changed. The new bucket starts full.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the new aggregate rate is invalid;
    /// the current bucket stays in place.
    pub fn resize(&self, pool_size: usize) -> Result<()> {
        let rate = aggregate_rate(self.per_key_rps, pool_size)?;
        if rate.get() == self.capacity() {
            return Ok(());
        }
        self.bucket.store(Arc::new(Bucket::direct(Quota::per_second(rate))));
        self.capacity.store(rate.get(), Ordering::Relaxed);
        tracing::debug!(capacity = rate.get(), "rate limiter resized");
        Ok(())
    }

    /// Tokens per second (and burst size) currently allowed.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }
}
