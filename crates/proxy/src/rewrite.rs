//! Inbound URI → upstream URL.
//!
//! Works on the raw, still percent-encoded path and query. Nothing here
//! decodes, so `%23` (an encoded `#` starting a player or clan tag) reaches
//! the upstream byte for byte.

use axum::http::Method;

/// Prefix the proxy route is mounted under; the upstream base already ends
/// with it.
pub const MOUNT_PREFIX: &str = "/v1";

/// Query parameter accepted from clients but rejected by the upstream on
/// write requests.
const FIELDS_PARAM: &str = "fields";

/// Methods that carry a request body.
#[must_use]
pub fn is_write(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Removes every `name` pair from a raw query string, keeping the order
/// and encoding of the rest.
#[must_use]
pub fn strip_query_param(query: &str, name: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(name))
        .collect::<Vec<_>>()
        .join("&")
}

/// Builds the upstream URL for an inbound request.
///
/// `path` is the raw inbound path including [`MOUNT_PREFIX`]. With
/// `tag_shorthand`, each `!` in the path becomes `%23`.
#[must_use]
pub fn upstream_url(
    base: &str,
    path: &str,
    query: Option<&str>,
    method: &Method,
    tag_shorthand: bool,
) -> String {
    let suffix = path.strip_prefix(MOUNT_PREFIX).unwrap_or(path);
    let mut url = String::with_capacity(base.len() + path.len() + query.map_or(0, str::len) + 1);
    url.push_str(base.trim_end_matches('/'));
    if tag_shorthand {
        url.push_str(&suffix.replace('!', "%23"));
    } else {
        url.push_str(suffix);
    }

    let query = match query {
        Some(q) if is_write(method) => strip_query_param(q, FIELDS_PARAM),
        Some(q) => q.to_string(),
        None => String::new(),
    };
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }
    url
}
