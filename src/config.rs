use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::fs;

/// Global configuration instance
static CONFIG: OnceLock<RelayConfig> = OnceLock::new();

/// Load the global configuration from `dir`, once per process
pub async fn init_config(
    dir: &Path,
) -> Result<&'static RelayConfig, Box<dyn std::error::Error + Send + Sync>> {
    let config = RelayConfig::load(dir).await?;
    Ok(CONFIG.get_or_init(|| config))
}

/// The global configuration; defaults apply until `init_config` has run
pub fn get_config() -> &'static RelayConfig {
    CONFIG.get_or_init(RelayConfig::default)
}

/// Deployment mode, selected by `environment` in relay.toml or `RELAY_ENV`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
    Test,
}

/// Relay configuration
///
/// Loaded from `relay.toml`, then overridden by environment variables
/// (`PORT`, `SECURE`, `RELAY_ENV`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Listen port (env PORT overrides)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Implicit TLS on accept instead of STARTTLS (env SECURE overrides)
    #[serde(default)]
    pub secure: bool,
    /// The FQDNs under which this relay publishes itself as MX; recipient
    /// domains must list every one of them
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,
    /// Maximum on-wire message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Accept untrusted downstream certificates; explicit test-only flag,
    /// never derived from the environment name
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub dkim: DkimConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            port: default_port(),
            secure: false,
            exchanges: default_exchanges(),
            max_message_size: default_max_message_size(),
            rate_limit: RateLimitConfig::default(),
            tls: TlsConfig::default(),
            dkim: DkimConfig::default(),
            danger_accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max")]
    pub max: u64,
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max: default_rate_limit_max(), window_ms: default_rate_limit_window_ms() }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Paths to the inbound TLS material; required in production
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

/// Outbound signing identity; required in production
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Signing domain (d= tag)
    pub domain: Option<String>,
    /// Selector (s= tag)
    #[serde(default = "default_dkim_selector")]
    pub selector: String,
    /// PKCS#8 PEM private key path
    pub private_key: Option<PathBuf>,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self { domain: None, selector: default_dkim_selector(), private_key: None }
    }
}

fn default_port() -> u16 {
    25
}

fn default_exchanges() -> Vec<String> {
    vec!["mx1.forwardemail.net".to_string(), "mx2.forwardemail.net".to_string()]
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024
}

fn default_rate_limit_max() -> u64 {
    100
}

fn default_rate_limit_window_ms() -> u64 {
    60 * 60 * 1000
}

fn default_dkim_selector() -> String {
    "default".to_string()
}

impl RelayConfig {
    /// Load configuration from `relay.toml` under `dir`, falling back to
    /// defaults, then apply environment variable overrides
    pub async fn load(dir: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let config_path = dir.join("relay.toml");
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(secure) = std::env::var("SECURE") {
            self.secure = secure == "1" || secure.eq_ignore_ascii_case("true");
        }
        if let Ok(env) = std::env::var("RELAY_ENV") {
            match env.to_lowercase().as_str() {
                "production" => self.environment = Environment::Production,
                "development" => self.environment = Environment::Development,
                "test" => self.environment = Environment::Test,
                _ => {}
            }
        }
    }

    /// EHLO name used on both sides of the relay
    pub fn ehlo_name(&self) -> &str {
        self.exchanges.first().map(|s| s.as_str()).unwrap_or("localhost")
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Configuration for tests: loopback-friendly, accepts any certificate
    pub fn for_tests() -> Self {
        Self {
            environment: Environment::Test,
            port: 0,
            danger_accept_invalid_certs: true,
            ..Self::default()
        }
    }

    /// Generate a sample configuration file
    pub fn sample() -> String {
        let sample = Self {
            environment: Environment::Production,
            port: 25,
            secure: false,
            exchanges: default_exchanges(),
            max_message_size: default_max_message_size(),
            rate_limit: RateLimitConfig::default(),
            tls: TlsConfig {
                cert: Some(PathBuf::from("/etc/relay/tls/cert.pem")),
                key: Some(PathBuf::from("/etc/relay/tls/key.pem")),
                ca: Some(PathBuf::from("/etc/relay/tls/ca.pem")),
            },
            dkim: DkimConfig {
                domain: Some("forwardemail.net".to_string()),
                selector: default_dkim_selector(),
                private_key: Some(PathBuf::from("/etc/relay/dkim/private.pem")),
            },
            danger_accept_invalid_certs: false,
        };
        toml::to_string_pretty(&sample).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 25);
        assert_eq!(config.max_message_size, 25 * 1024 * 1024);
        assert_eq!(config.rate_limit.max, 100);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(3600));
        assert_eq!(
            config.exchanges,
            vec!["mx1.forwardemail.net", "mx2.forwardemail.net"]
        );
        assert_eq!(config.ehlo_name(), "mx1.forwardemail.net");
        assert!(config.is_production());
        assert!(!config.danger_accept_invalid_certs);
    }

    #[test]
    fn test_sample_parses_back() {
        let sample = RelayConfig::sample();
        let parsed: RelayConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.dkim.domain.as_deref(), Some("forwardemail.net"));
        assert_eq!(parsed.dkim.selector, "default");
    }

    #[test]
    fn test_partial_config() {
        let parsed: RelayConfig = toml::from_str(
            "environment = \"test\"\n[rate_limit]\nmax = 2\n",
        )
        .unwrap();
        assert_eq!(parsed.environment, Environment::Test);
        assert_eq!(parsed.rate_limit.max, 2);
        assert_eq!(parsed.rate_limit.window_ms, default_rate_limit_window_ms());
    }

    #[test]
    fn test_for_tests_flags() {
        let config = RelayConfig::for_tests();
        assert!(config.danger_accept_invalid_certs);
        assert!(!config.is_production());
    }
}
