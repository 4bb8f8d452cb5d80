//! Reading the caller IP out of the portal session token.
//!
//! The token is never verified: it only tells us which address the portal
//! saw, and the portal itself enforces that binding.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use clashgate_types::{GatewayError, Result};

fn portal_err(msg: impl Into<String>) -> GatewayError {
    GatewayError::Portal(msg.into())
}

/// Decodes the claims section of a JWT without checking its signature.
///
/// # Errors
///
/// Returns [`GatewayError::Portal`] if the token is not three dot-separated
/// parts or the payload is not base64url-encoded JSON.
pub fn decode_claims(token: &str) -> Result<serde_json::Value> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(portal_err("session token is not a JWT")),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| portal_err(format!("session token payload: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Extracts the public IP from the `limits` claim: the first entry of type
/// `client` carries the caller's CIDR, whose address part is returned.
///
/// # Errors
///
/// Returns [`GatewayError::Portal`] if the claim is missing or malformed.
pub fn client_ip(token: &str) -> Result<String> {
    let claims = decode_claims(token)?;
    let limits = claims
        .get("limits")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| portal_err("limits claim missing from session token"))?;
    let client = limits
        .iter()
        .find(|l| l.get("type").and_then(serde_json::Value::as_str) == Some("client"))
        .ok_or_else(|| portal_err("no client entry in limits claim"))?;
    let cidr = client
        .get("cidrs")
        .and_then(serde_json::Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| portal_err("client limit has no CIDR ranges"))?
        .as_str()
        .ok_or_else(|| portal_err("CIDR range is not a string"))?;
    let ip = cidr.split('/').next().unwrap_or(cidr);
    Ok(ip.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Builds an unsigned token around `claims`.
    pub(crate) fn token(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS512","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2ln")
    }

    #[test]
    fn test_client_ip_from_limits() {
        let t = token(&json!({
            "iss": "supercell",
            "limits": [
                {"tier": "developer/silver", "type": "throttling"},
                {"cidrs": ["203.0.113.7/32"], "type": "client"}
            ]
        }));
        assert_eq!(client_ip(&t).unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_cidr_without_prefix_length() {
        let t = token(&json!({"limits": [{"type": "client", "cidrs": ["198.51.100.1"]}]}));
        assert_eq!(client_ip(&t).unwrap(), "198.51.100.1");
    }

    #[test]
    fn test_missing_client_entry() {
        let t = token(&json!({"limits": [{"type": "throttling"}]}));
        assert!(matches!(client_ip(&t), Err(GatewayError::Portal(_))));
    }

    #[test]
    fn test_empty_cidrs() {
        let t = token(&json!({"limits": [{"type": "client", "cidrs": []}]}));
        assert!(client_ip(&t).is_err());
    }

    #[test]
    fn test_not_a_jwt() {
        assert!(matches!(decode_claims("abc"), Err(GatewayError::Portal(_))));
        assert!(decode_claims("a.!!!.c").is_err());
    }
}
