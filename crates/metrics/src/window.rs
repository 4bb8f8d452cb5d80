//! Reporting windows and the `/stats` snapshot.

use crate::ring::{Clock, MetricsRing};
use serde::{Serialize, Serializer};
use std::time::{Duration, UNIX_EPOCH};

/// A named lookback duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub label: &'static str,
    pub seconds: u32,
}

impl Window {
    const fn new(label: &'static str, seconds: u32) -> Self {
        Self { label, seconds }
    }
}

/// Windows reported by `/stats`, shortest first.
pub const WINDOWS: [Window; 8] = [
    Window::new("10s", 10),
    Window::new("1m", 60),
    Window::new("5m", 5 * 60),
    Window::new("15m", 15 * 60),
    Window::new("1h", 60 * 60),
    Window::new("6h", 6 * 60 * 60),
    Window::new("12h", 12 * 60 * 60),
    Window::new("24h", 24 * 60 * 60),
];

/// Aggregates for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub requests: u64,
    pub avg_rps: f64,
    pub avg_latency_ms: Option<f64>,
}

/// JSON body of `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// RFC 3339 UTC timestamp, second precision.
    pub now: String,
    #[serde(serialize_with = "serialize_windows")]
    pub windows: Vec<(&'static str, WindowStats)>,
}

impl StatsSnapshot {
    /// Looks up a window by label.
    #[must_use]
    pub fn window(&self, label: &str) -> Option<&WindowStats> {
        self.windows
            .iter()
            .find_map(|(l, stats)| (*l == label).then_some(stats))
    }
}

/// Serializes the window list as a JSON object, preserving order.
fn serialize_windows<S>(
    windows: &[(&'static str, WindowStats)],
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(windows.iter().map(|(label, stats)| (*label, stats)))
}

impl<C: Clock> MetricsRing<C> {
    /// Computes stats for every window in `windows`.
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot_for(&self, windows: &[Window]) -> StatsSnapshot {
        let secs = u64::try_from(self.clock().now_secs()).unwrap_or(0);
        let now = humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs));
        let windows = windows
            .iter()
            .map(|w| {
                let requests = self.window_sum(w.seconds);
                let stats = WindowStats {
                    requests,
                    avg_rps: requests as f64 / f64::from(w.seconds),
                    avg_latency_ms: self.window_latency_avg_ms(w.seconds),
                };
                (w.label, stats)
            })
            .collect();
        StatsSnapshot {
            now: now.to_string(),
            windows,
        }
    }

    /// Computes stats for the standard [`WINDOWS`].
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_for(&WINDOWS)
    }
}
