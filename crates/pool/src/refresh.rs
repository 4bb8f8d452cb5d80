//! Background credential refresh.
//!
//! Runs a [`CredentialSource`] on a fixed period and swaps the result into
//! the [`KeyPool`]. Failures back off exponentially (with jitter) and never
//! touch the serving path: the previous credentials stay active.

use crate::{KeyPool, RateLimiter};
use clashgate_types::{Credential, CredentialSource, GatewayError, Result};
use rand::Rng as _;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Exponential backoff for the `attempt`-th consecutive failure (1-based),
/// capped at five minutes, plus up to 25% random jitter.
#[must_use]
pub fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let base = exp.min(BACKOFF_MAX);
    let jitter_ms = u64::try_from(base.as_millis() / 4).unwrap_or(0);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Runs `source` until it yields at least one credential, up to
/// `max_attempts` times.
///
/// # Errors
///
/// Returns the last source error, or [`GatewayError::Config`] if every
/// attempt produced an empty list.
pub async fn acquire_with_retry(
    source: &dyn CredentialSource,
    max_attempts: u32,
) -> Result<Vec<Credential>> {
    let mut last_err = None;
    for attempt in 1..=max_attempts.max(1) {
        match source.acquire().await {
            Ok(keys) if !keys.is_empty() => return Ok(keys),
            Ok(_) => {
                last_err = Some(GatewayError::Config(format!(
                    "credential source `{}` returned no keys",
                    source.name()
                )));
            }
            Err(e) => last_err = Some(e),
        }
        if attempt < max_attempts {
            let delay = backoff(attempt);
            tracing::warn!(
                source = source.name(),
                attempt,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = last_err.as_ref().map(ToString::to_string),
                "credential acquisition failed"
            );
            tokio::time::sleep(delay).await;
        }
    }
    Err(last_err.unwrap_or_else(|| GatewayError::Config("no credential attempts made".into())))
}

/// Periodically refreshes a [`KeyPool`] from a [`CredentialSource`].
pub struct Refresher {
    pool: Arc<KeyPool>,
    limiter: Option<Arc<RateLimiter>>,
    source: Arc<dyn CredentialSource>,
    interval: Duration,
}

impl Refresher {
    /// Creates a refresher; `limiter`, if given, is re-sized with the pool.
    pub fn new(
        pool: Arc<KeyPool>,
        limiter: Option<Arc<RateLimiter>>,
        source: Arc<dyn CredentialSource>,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            limiter,
            source,
            interval,
        }
    }

    /// Fetches credentials once and installs them. Returns the new pool size.
    ///
    /// # Errors
    ///
    /// Returns the source error, or [`GatewayError::Config`] for an empty
    /// list; the pool is left untouched in both cases.
    pub async fn refresh_once(&self) -> Result<usize> {
        let keys = self.source.acquire().await?;
        let size = self.pool.refresh(keys)?;
        if let Some(limiter) = &self.limiter {
            limiter.resize(size)?;
        }
        Ok(size)
    }

    /// Spawns the refresh loop. It stops when `shutdown` changes or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut delay = self.interval;
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                delay = match self.refresh_once().await {
                    Ok(size) => {
                        failures = 0;
                        tracing::info!(source = self.source.name(), keys = size, "credentials refreshed");
                        self.interval
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let retry = backoff(failures).min(self.interval);
                        tracing::warn!(
                            source = self.source.name(),
                            error = %e,
                            failures,
                            "credential refresh failed, keeping current keys"
                        );
                        retry
                    }
                };
            }
            tracing::debug!(source = self.source.name(), "refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Yields `generation-N` keys, failing on the calls listed in `fail_on`.
    struct CountingSource {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        size: usize,
    }

    impl CountingSource {
        fn new(size: usize, fail_on: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
                size,
            }
        }
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn acquire(&self) -> Result<Vec<Credential>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&n) {
                return Err(GatewayError::Portal(format!("call {n} failed")));
            }
            Ok((0..self.size)
                .map(|i| Credential::new(format!("gen{n}-{i}")))
                .collect())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = backoff(1);
        assert!(first >= Duration::from_secs(2) && first <= Duration::from_millis(2_500));
        let third = backoff(3);
        assert!(third >= Duration::from_secs(8));
        let huge = backoff(40);
        assert!(huge >= BACKOFF_MAX && huge <= BACKOFF_MAX + BACKOFF_MAX / 4);
    }

    #[tokio::test]
    async fn test_refresh_once_swaps_pool_and_limiter() {
        let pool = Arc::new(KeyPool::load(["seed"]).unwrap());
        let limiter = Arc::new(RateLimiter::new(10, 1, Duration::from_secs(1)).unwrap());
        let refresher = Refresher::new(
            Arc::clone(&pool),
            Some(Arc::clone(&limiter)),
            Arc::new(CountingSource::new(3, vec![])),
            Duration::from_secs(60),
        );
        assert_eq!(refresher.refresh_once().await.unwrap(), 3);
        assert_eq!(pool.len(), 3);
        assert_eq!(limiter.capacity(), 30);
        assert!(pool.next().expose().starts_with("gen1-"));
    }

    #[tokio::test]
    async fn test_refresh_once_failure_keeps_pool() {
        let pool = Arc::new(KeyPool::load(["seed"]).unwrap());
        let refresher = Refresher::new(
            Arc::clone(&pool),
            None,
            Arc::new(CountingSource::new(2, vec![1])),
            Duration::from_secs(60),
        );
        assert!(refresher.refresh_once().await.is_err());
        assert_eq!(pool.next().expose(), "seed");
    }

    #[tokio::test]
    async fn test_refresh_once_empty_result_keeps_pool() {
        let pool = Arc::new(KeyPool::load(["seed"]).unwrap());
        let refresher = Refresher::new(
            Arc::clone(&pool),
            None,
            Arc::new(CountingSource::new(0, vec![])),
            Duration::from_secs(60),
        );
        assert!(matches!(
            refresher.refresh_once().await,
            Err(GatewayError::Config(_))
        ));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_refreshes_and_stops() {
        let pool = Arc::new(KeyPool::load(["seed"]).unwrap());
        let source = Arc::new(CountingSource::new(2, vec![]));
        let (tx, rx) = watch::channel(false);
        let handle = Refresher::new(
            Arc::clone(&pool),
            None,
            Arc::clone(&source) as Arc<dyn CredentialSource>,
            Duration::from_secs(60),
        )
        .spawn(rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(pool.next().expose().starts_with("gen2-"));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_retries_sooner_after_failure() {
        let pool = Arc::new(KeyPool::load(["seed"]).unwrap());
        let source = Arc::new(CountingSource::new(1, vec![1]));
        let (_tx, rx) = watch::channel(false);
        let _handle = Refresher::new(
            Arc::clone(&pool),
            None,
            Arc::clone(&source) as Arc<dyn CredentialSource>,
            Duration::from_secs(600),
        )
        .spawn(rx);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(pool.next().expose(), "seed");
        // First backoff is at most 2.5s, far shorter than the period.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.next().expose(), "gen2-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_recovers() {
        let source = CountingSource::new(2, vec![1, 2]);
        let keys = acquire_with_retry(&source, 5).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_gives_up() {
        let source = CountingSource::new(2, vec![1, 2, 3]);
        let err = acquire_with_retry(&source, 3).await.unwrap_err();
        assert!(matches!(err, GatewayError::Portal(_)));
    }
}
