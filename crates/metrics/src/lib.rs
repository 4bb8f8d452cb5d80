//! Rolling request statistics for the proxy.
//!
//! A fixed ring of per-second slots covers the last 24 hours at one-second
//! resolution. Every forwarded request adds one sample; `/stats` scans the
//! ring for each reporting [`Window`].

pub mod ring;
pub mod window;

pub use ring::{BUCKETS, Clock, ManualClock, MetricsRing, SystemClock};
pub use window::{StatsSnapshot, WINDOWS, Window, WindowStats};
