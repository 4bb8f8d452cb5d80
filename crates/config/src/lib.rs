//! Configuration loading and hot-reloading for the clashgate proxy.
//!
//! Uses figment to layer built-in defaults, an optional YAML file and the
//! environment, and notify + arc-swap for live file watching.

pub mod schema;
pub mod watcher;

pub use schema::{Config, LogConfig, PortalConfig, RateLimitConfig, UPSTREAM_BASE};
pub use watcher::ConfigWatcher;
