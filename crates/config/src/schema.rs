use clashgate_types::{Credential, GatewayError, credential};
use figment::{
    Figment,
    providers::{Env, Format as _, Serialized, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, path::Path, time::Duration};

/// Base URL of the upstream API. Not configurable.
pub const UPSTREAM_BASE: &str = "https://api.clashofclans.com/v1";

fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8011
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_upstream_timeout() -> u64 {
    15
}
fn default_per_key_rps() -> u32 {
    30
}
fn default_acquire_timeout() -> u64 {
    5
}
fn default_key_name() -> String {
    "clashgate".to_string()
}
fn default_keys_per_account() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Accepts a YAML list, a comma-separated string (`COC_KEYS`), or a single
/// numeric key as parsed from `CLASHGATE_KEYS`.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyList {
    List(Vec<String>),
    Csv(String),
    Number(u64),
}

fn deserialize_keys<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match KeyList::deserialize(deserializer)? {
        KeyList::List(keys) => keys,
        KeyList::Csv(raw) => raw.split(',').map(str::to_string).collect(),
        KeyList::Number(n) => vec![n.to_string()],
    })
}

/// Aggregate token-bucket admission in front of the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether admission control is applied (defaults to `false`).
    #[serde(default)]
    pub enabled: bool,
    /// Requests per second the upstream allows for a single key.
    #[serde(default = "default_per_key_rps")]
    pub per_key_rps: u32,
    /// How long a request may wait for a token before getting a 429.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_key_rps: default_per_key_rps(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Developer-portal accounts used to provision keys automatically.
#[derive(Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Account email with a `{}`, `{x}` or `%d` placeholder for the index.
    pub email_template: String,
    pub min_index: u32,
    pub max_index: u32,
    /// Password shared by every account.
    pub password: String,
    /// Name given to keys created by the proxy; only these are managed.
    #[serde(default = "default_key_name")]
    pub key_name: String,
    /// Keys to keep per account (the portal allows at most 10).
    #[serde(default = "default_keys_per_account")]
    pub keys_per_account: usize,
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalConfig")
            .field("email_template", &self.email_template)
            .field("min_index", &self.min_index)
            .field("max_index", &self.max_index)
            .field("password", &"<redacted>")
            .field("key_name", &self.key_name)
            .field("keys_per_account", &self.keys_per_account)
            .finish()
    }
}

impl PortalConfig {
    /// Renders one email per account index, in index order.
    #[must_use]
    pub fn emails(&self) -> Vec<String> {
        (self.min_index..=self.max_index)
            .map(|i| {
                let n = i.to_string();
                self.email_template
                    .replace("{x}", &n)
                    .replace("{}", &n)
                    .replace("%d", &n)
            })
            .collect()
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen port (defaults to 8011).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen address (defaults to `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Static credential list, in rotation order.
    #[serde(default, deserialize_with = "deserialize_keys")]
    pub keys: Vec<String>,
    /// Hard ceiling for one upstream round trip, body included.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Rewrite `!` in forwarded paths to `%23` (tag shorthand).
    #[serde(default = "default_true")]
    pub tag_shorthand: bool,
    /// Gzip responses for clients that accept it.
    #[serde(default)]
    pub compress_responses: bool,
    /// Period of the background credential refresh; `0` disables it.
    #[serde(default)]
    pub refresh_interval_secs: u64,
    /// Automatic key provisioning; used when `keys` is empty.
    #[serde(default)]
    pub portal: Option<PortalConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            keys: Vec::new(),
            upstream_timeout_secs: default_upstream_timeout(),
            rate_limit: RateLimitConfig::default(),
            tag_shorthand: true,
            compress_responses: false,
            refresh_interval_secs: 0,
            portal: None,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Parses configuration from a YAML string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
    }

    /// Loads configuration from a file path, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn from_file(path: &Path) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .extract()
    }

    /// Loads defaults, then the optional YAML file, then the environment.
    ///
    /// `CLASHGATE_*` variables address any field (`__` separates nested
    /// keys); `COC_KEYS`, `HOST` and `PORT` are honoured as-is.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if a source cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment
            .merge(Env::prefixed("CLASHGATE_").split("__"))
            .merge(Env::raw().only(&["HOST", "PORT"]));
        // Taken verbatim: `Env` would turn a digit-only key into an integer.
        if let Some(keys) = Env::var("COC_KEYS") {
            figment = figment.merge(Serialized::default("keys", keys));
        }
        figment.extract()
    }

    /// Checks the invariants the server relies on before binding.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] describing the first violation.
    pub fn validate(&self) -> clashgate_types::Result<()> {
        if self.credentials().is_empty() && self.portal.is_none() {
            return Err(GatewayError::Config(
                "no API keys configured: set COC_KEYS, `keys`, or a `portal` section".into(),
            ));
        }
        if self.port == 0 {
            return Err(GatewayError::Config("port must be non-zero".into()));
        }
        if self.upstream_timeout_secs == 0 {
            return Err(GatewayError::Config(
                "upstream_timeout_secs must be non-zero".into(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.per_key_rps == 0 {
            return Err(GatewayError::Config(
                "rate_limit.per_key_rps must be non-zero".into(),
            ));
        }
        if let Some(portal) = &self.portal {
            if portal.min_index > portal.max_index {
                return Err(GatewayError::Config(format!(
                    "portal.min_index ({}) exceeds portal.max_index ({})",
                    portal.min_index, portal.max_index
                )));
            }
            if portal.keys_per_account == 0 {
                return Err(GatewayError::Config(
                    "portal.keys_per_account must be non-zero".into(),
                ));
            }
        }
        Ok(())
    }

    /// The static key list, trimmed and de-duplicated.
    #[must_use]
    pub fn credentials(&self) -> Vec<Credential> {
        credential::normalize(&self.keys)
    }

    /// `host:port` listen address.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Background refresh period, if enabled.
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
port: 9000
host: "127.0.0.1"
keys:
  - "key-a"
  - " key-b "
  - "key-a"
rate_limit:
  enabled: true
  per_key_rps: 10
portal:
  email_template: "bot+{x}@example.com"
  min_index: 1
  max_index: 3
  password: "hunter2"
"#;

    #[test]
    fn test_default_config() {
        let c = Config::default();
        assert_eq!(c.port, 8011);
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.upstream_timeout_secs, 15);
        assert!(c.keys.is_empty());
        assert!(c.tag_shorthand);
        assert!(!c.rate_limit.enabled);
        assert!(c.refresh_interval().is_none());
    }

    #[test]
    fn test_from_yaml_port_and_host() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_from_yaml_keys_normalized() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        let keys: Vec<_> = c.credentials().iter().map(|k| k.expose().to_string()).collect();
        assert_eq!(keys, vec!["key-a", "key-b"]);
    }

    #[test]
    fn test_from_yaml_keys_csv_string() {
        let c = Config::from_yaml("keys: \"k1, k2,k3\"").unwrap();
        assert_eq!(c.credentials().len(), 3);
    }

    #[test]
    fn test_from_yaml_rate_limit_defaults_applied() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        assert!(c.rate_limit.enabled);
        assert_eq!(c.rate_limit.per_key_rps, 10);
        assert_eq!(c.rate_limit.acquire_timeout_secs, 5);
    }

    #[test]
    fn test_portal_emails() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        let portal = c.portal.unwrap();
        assert_eq!(
            portal.emails(),
            vec![
                "bot+1@example.com",
                "bot+2@example.com",
                "bot+3@example.com"
            ]
        );
        assert_eq!(portal.key_name, "clashgate");
        assert_eq!(portal.keys_per_account, 10);
    }

    #[test]
    fn test_portal_debug_redacts_password() {
        let c = Config::from_yaml(SAMPLE_YAML).unwrap();
        let dbg = format!("{:?}", c.portal.unwrap());
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let c = Config::from_yaml("keys: [\"  \", \"\"]").unwrap();
        let err = c.validate().unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_validate_accepts_portal_without_keys() {
        let c = Config::from_yaml(
            "portal: {email_template: \"a{}@b.c\", min_index: 1, max_index: 1, password: p}",
        )
        .unwrap();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_portal_range() {
        let c = Config::from_yaml(
            "keys: [k]\nportal: {email_template: \"a{}@b.c\", min_index: 5, max_index: 1, password: p}",
        )
        .unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let c = Config::from_yaml("keys: [k]\nupstream_timeout_secs: 0").unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_load_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("COC_KEYS", "a, b,,c");
            jail.set_env("PORT", "9100");
            jail.set_env("CLASHGATE_RATE_LIMIT__ENABLED", "true");
            let c = Config::load(None)?;
            assert_eq!(c.port, 9100);
            assert_eq!(c.credentials().len(), 3);
            assert!(c.rate_limit.enabled);
            Ok(())
        });
    }

    #[test]
    fn test_digit_only_keys_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("COC_KEYS", "012345");
            let c = Config::load(None)?;
            assert_eq!(c.keys, vec!["012345"]);
            Ok(())
        });
        figment::Jail::expect_with(|jail| {
            jail.set_env("CLASHGATE_KEYS", "12345");
            let c = Config::load(None)?;
            assert_eq!(c.keys, vec!["12345"]);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("clashgate.yaml", "port: 7000\nkeys: [file-key]\n")?;
            jail.set_env("PORT", "7001");
            let c = Config::load(Some(Path::new("clashgate.yaml")))?;
            assert_eq!(c.port, 7001);
            assert_eq!(c.keys, vec!["file-key"]);
            Ok(())
        });
    }
}
