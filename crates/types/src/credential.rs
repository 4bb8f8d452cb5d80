//! Bearer credential representation and list normalisation.

use std::{collections::HashSet, fmt, sync::Arc};

/// An opaque bearer token for the upstream API.
///
/// Identity is the string value. Cloning is cheap (shared allocation), and
/// the `Debug` output never reveals the token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    /// Wraps a raw token string.
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(Arc::from(token.as_ref()))
    }

    /// Returns the raw token for use in an `Authorization` header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Formats the `Authorization` header value.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail: String = self
            .0
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        write!(f, "Credential(…{tail})")
    }
}

impl From<&str> for Credential {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Credential {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Trims every entry, drops blank ones and removes duplicates while keeping
/// the first occurrence's position.
pub fn normalize<I, S>(raw: I) -> Vec<Credential>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|s| {
            let trimmed = s.as_ref().trim();
            (!trimmed.is_empty() && seen.insert(trimmed.to_string()))
                .then(|| Credential::new(trimmed))
        })
        .collect()
}

/// Splits a comma-separated credential list (the `COC_KEYS` format) and
/// normalises it.
#[must_use]
pub fn parse_list(raw: &str) -> Vec<Credential> {
    normalize(raw.split(','))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_token() {
        let c = Credential::new("eyJsecret-token-abcd");
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("secret"));
        assert!(dbg.ends_with("abcd)"));
    }

    #[test]
    fn test_bearer_header() {
        assert_eq!(Credential::new("k1").bearer(), "Bearer k1");
    }

    #[test]
    fn test_normalize_trims_and_dedups() {
        let keys = normalize(["  a ", "", "b", "   ", "a", "c"]);
        let raw: Vec<_> = keys.iter().map(Credential::expose).collect();
        assert_eq!(raw, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_list_whitespace_only() {
        assert!(parse_list(" , ,,  ").is_empty());
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_parse_list_keeps_order() {
        let keys = parse_list("k3, k1,k2");
        let raw: Vec<_> = keys.iter().map(Credential::expose).collect();
        assert_eq!(raw, vec!["k3", "k1", "k2"]);
    }
}
