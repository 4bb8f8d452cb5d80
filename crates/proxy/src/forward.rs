//! The forwarding pipeline: one inbound request, one upstream attempt.

use crate::rewrite;
use axum::{
    body::{Body, HttpBody as _},
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, Response,
        header::{
            ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE,
            ETAG, EXPIRES, LAST_MODIFIED,
        },
    },
};
use clashgate_config::{Config, UPSTREAM_BASE};
use clashgate_metrics::MetricsRing;
use clashgate_types::{Credential, GatewayError, Result};
use futures_util::{Stream, TryStreamExt as _};
use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

/// Upstream response headers relayed to the client. Everything else,
/// hop-by-hop headers included, is dropped.
pub const RELAYED_HEADERS: [HeaderName; 5] =
    [CACHE_CONTROL, EXPIRES, ETAG, LAST_MODIFIED, CONTENT_TYPE];

/// Records one metrics sample when dropped.
///
/// Created when a request enters the pipeline and moved along with it, so
/// every exit (error return, client disconnect, body end) records exactly
/// once.
pub struct RequestTimer {
    metrics: Arc<MetricsRing>,
    started: Instant,
}

impl RequestTimer {
    #[must_use]
    pub fn start(metrics: Arc<MetricsRing>) -> Self {
        Self {
            metrics,
            started: Instant::now(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.metrics.record(self.started.elapsed());
    }
}

/// Upstream body stream that owns the request's timer.
struct TimedStream<S> {
    inner: S,
    _timer: RequestTimer,
}

impl<S: Stream + Unpin> Stream for TimedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Turns inbound requests into upstream requests and relays the answer.
#[derive(Clone)]
pub struct Forwarder {
    http: reqwest::Client,
    base: String,
    tag_shorthand: bool,
}

impl Forwarder {
    /// Creates a forwarder for the public upstream API.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base(UPSTREAM_BASE, config.upstream_timeout(), config.tag_shorthand)
    }

    /// Creates a forwarder against `base`, which must include the `/v1`
    /// prefix.
    ///
    /// `timeout` bounds the whole upstream exchange, body included.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn with_base(base: impl Into<String>, timeout: Duration, tag_shorthand: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base: base.into(),
            tag_shorthand,
        })
    }

    /// Forwards `req` using `key` and streams the upstream response back.
    ///
    /// Upstream statuses, 3xx and error codes included, are relayed
    /// verbatim. `timer` records when the returned body is dropped, or
    /// right away on error.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Timeout`] if the upstream did not answer in time.
    /// - [`GatewayError::Transport`] on any other failure before a response.
    /// - [`GatewayError::BadRequest`] if the inbound body could not be read
    ///   (for example, corrupt gzip).
    pub async fn forward(
        &self,
        req: Request<Body>,
        key: &Credential,
        timer: RequestTimer,
    ) -> Result<Response<Body>> {
        let (parts, body) = req.into_parts();
        let url = rewrite::upstream_url(
            &self.base,
            parts.uri.path(),
            parts.uri.query(),
            &parts.method,
            self.tag_shorthand,
        );

        let mut builder = self
            .http
            .request(parts.method.clone(), &url)
            .header(ACCEPT, "application/json")
            .header(ACCEPT_ENCODING, "identity")
            .header(AUTHORIZATION, key.bearer());

        let body_failed = Arc::new(AtomicBool::new(false));
        if rewrite::is_write(&parts.method) {
            let content_type = parts
                .headers
                .get(CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/json"));
            builder = builder.header(CONTENT_TYPE, content_type);
            if !body.is_end_stream() {
                let flag = Arc::clone(&body_failed);
                let stream = body
                    .into_data_stream()
                    .inspect_err(move |_| flag.store(true, Ordering::Release));
                builder = builder.body(reqwest::Body::wrap_stream(stream));
            } else {
                builder = builder
                    .header(CONTENT_LENGTH, "0")
                    .body(reqwest::Body::from(""));
            }
        }

        let upstream = match builder.send().await {
            Ok(resp) => resp,
            Err(e) if body_failed.load(Ordering::Acquire) => {
                tracing::debug!(error = %e, "inbound body unreadable");
                return Err(GatewayError::BadRequest(
                    "request body could not be decoded".into(),
                ));
            }
            Err(e) => {
                let err = GatewayError::from(e);
                tracing::warn!(method = %parts.method, path = parts.uri.path(), error = %err, "upstream call failed");
                return Err(err);
            }
        };

        let status = upstream.status();
        let headers = relayed_headers(upstream.headers());
        tracing::debug!(method = %parts.method, path = parts.uri.path(), %status, "upstream responded");

        let stream = TimedStream {
            inner: Box::pin(upstream.bytes_stream()),
            _timer: timer,
        };
        let mut resp = Response::new(Body::from_stream(stream));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        Ok(resp)
    }
}

fn relayed_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in &RELAYED_HEADERS {
        for value in upstream.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
