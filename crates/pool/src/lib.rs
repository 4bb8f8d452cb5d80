//! Credential pool, aggregate admission control and background refresh.
//!
//! [`KeyPool`] hands out one credential per forwarded request in strict
//! round-robin order. [`RateLimiter`] caps total throughput at the pool's
//! combined per-key allowance. [`Refresher`] swaps in fresh credentials from
//! a [`CredentialSource`](clashgate_types::CredentialSource) off the request
//! path.

pub mod limiter;
pub mod pool;
pub mod refresh;

pub use limiter::RateLimiter;
pub use pool::KeyPool;
pub use refresh::{Refresher, acquire_with_retry, backoff};
