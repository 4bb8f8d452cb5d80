//! Session-scoped HTTP client for the developer portal.

use clashgate_types::{Credential, GatewayError, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Base URL of the developer portal API.
pub const PORTAL_BASE: &str = "https://developer.clashofclans.com/api";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A key as returned by `/apikey/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalKey {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cidr_ranges: Vec<String>,
    #[serde(default)]
    pub key: String,
}

impl PortalKey {
    /// Whether this key is usable from `ip`.
    #[must_use]
    pub fn allows(&self, ip: &str) -> bool {
        self.cidr_ranges
            .iter()
            .any(|r| r == ip || r.strip_suffix("/32") == Some(ip))
    }
}

#[derive(Deserialize)]
struct KeyList {
    #[serde(default)]
    keys: Vec<PortalKey>,
}

#[derive(Deserialize)]
struct CreatedKey {
    key: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    key: Option<CreatedKey>,
    error: Option<String>,
    description: Option<String>,
}

/// Result of asking the portal for a new key.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Credential),
    /// The account already holds the portal's maximum number of keys.
    TooManyKeys,
}

/// One logged-in portal session.
///
/// The portal authenticates follow-up calls with the cookie set by
/// `/login`, so every account needs its own client.
pub struct PortalClient {
    http: reqwest::Client,
    base: String,
}

impl PortalClient {
    /// Creates a client with an empty cookie jar against `base`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Logs in and returns the public IP the portal associates with this
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Portal`] on rejected credentials or an
    /// unreadable session token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::Portal(format!(
                "invalid credentials for {email}"
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Portal(format!(
                "login for {email} failed with {status}"
            )));
        }
        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("temporaryAPIToken")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| GatewayError::Portal("login response has no session token".into()))?;
        crate::jwt::client_ip(token)
    }

    /// Lists every key of the logged-in account.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Portal`] on a non-success status.
    pub async fn list_keys(&self) -> Result<Vec<PortalKey>> {
        let resp = self.http.post(self.url("/apikey/list")).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::Portal(format!(
                "listing keys failed with {status}"
            )));
        }
        Ok(resp.json::<KeyList>().await?.keys)
    }

    /// Revokes key `id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Portal`] on a non-success status.
    pub async fn revoke(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/apikey/revoke"))
            .json(&json!({ "id": id }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(GatewayError::Portal(format!(
                "revoking key {id} failed with {status}: {body}"
            )))
        }
    }

    /// Creates a key bound to `ip` with the `clash` scope.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Portal`] if the portal reports an error other
    /// than `too-many-keys` or returns no key.
    pub async fn create(&self, name: &str, description: &str, ip: &str) -> Result<CreateOutcome> {
        let resp = self
            .http
            .post(self.url("/apikey/create"))
            .json(&json!({
                "name": name,
                "description": description,
                "cidrRanges": [ip],
                "scopes": ["clash"],
            }))
            .send()
            .await?;
        let body: CreateResponse = resp.json().await?;
        match (body.key, body.error.as_deref()) {
            (_, Some("too-many-keys")) => Ok(CreateOutcome::TooManyKeys),
            (Some(k), None) if !k.key.is_empty() => Ok(CreateOutcome::Created(Credential::new(k.key))),
            (_, err) => Err(GatewayError::Portal(format!(
                "key creation failed: {}",
                err.or(body.description.as_deref())
                    .unwrap_or("no key in response")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::tests::token;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_token(ip: &str) -> String {
        token(&json!({"limits": [{"type": "client", "cidrs": [format!("{ip}/32")]}]}))
    }

    #[test]
    fn test_key_allows_exact_and_host_cidr() {
        let key = PortalKey {
            id: "1".into(),
            name: "n".into(),
            cidr_ranges: vec!["10.0.0.1/32".into(), "10.0.0.2".into()],
            key: "k".into(),
        };
        assert!(key.allows("10.0.0.1"));
        assert!(key.allows("10.0.0.2"));
        assert!(!key.allows("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_login_returns_ip_and_keeps_session_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(body_json(json!({"email": "a@x.io", "password": "pw"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "session=abc; Path=/")
                    .set_body_json(json!({"temporaryAPIToken": session_token("192.0.2.10")})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apikey/list"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{"id": "k1", "name": "clashgate", "cidrRanges": ["192.0.2.10"], "key": "tok"}]
            })))
            .mount(&server)
            .await;

        let client = PortalClient::new(&server.uri()).unwrap();
        assert_eq!(client.login("a@x.io", "pw").await.unwrap(), "192.0.2.10");
        let keys = client.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "tok");
    }

    #[tokio::test]
    async fn test_login_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let client = PortalClient::new(&server.uri()).unwrap();
        let err = client.login("bad@x.io", "pw").await.unwrap_err();
        assert!(err.to_string().contains("invalid credentials for bad@x.io"));
    }

    #[tokio::test]
    async fn test_create_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apikey/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": {"key": "new-1"}})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apikey/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"error": "too-many-keys", "description": "limit reached"}),
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apikey/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "bad-scope"})))
            .mount(&server)
            .await;

        let client = PortalClient::new(&server.uri()).unwrap();
        match client.create("n", "d", "1.2.3.4").await.unwrap() {
            CreateOutcome::Created(c) => assert_eq!(c.expose(), "new-1"),
            CreateOutcome::TooManyKeys => panic!("expected a key"),
        }
        assert!(matches!(
            client.create("n", "d", "1.2.3.4").await.unwrap(),
            CreateOutcome::TooManyKeys
        ));
        let err = client.create("n", "d", "1.2.3.4").await.unwrap_err();
        assert!(err.to_string().contains("bad-scope"));
    }

    #[tokio::test]
    async fn test_revoke_failure_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apikey/revoke"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let client = PortalClient::new(&server.uri()).unwrap();
        let err = client.revoke("k9").await.unwrap_err();
        assert!(matches!(err, GatewayError::Portal(_)));
        assert!(err.to_string().contains("k9"));
    }
}
