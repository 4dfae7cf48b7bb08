//! Sentinel certificate monitor configuration
//!
//! The agent reads a TOML file:
//!
//! ```toml
//! metrics_file = "/var/lib/node_exporter/certmon.prom"
//!
//! [identity]
//! node_name = "node-1"
//! datacenter = "dc1"
//! dns_sans = ["node-1.dc1.internal"]
//! ip_sans = ["10.0.0.7"]
//!
//! [renewal]
//! fallback_leeway_secs = 10
//! fallback_retry_secs = 60
//!
//! [cache]
//! directory = "/var/lib/sentinel-certmon/certs"
//!
//! [issuer]
//! url = "https://issuer.internal:8501/v1/agent/certificate"
//! token_file = "/etc/sentinel-certmon/token"
//!
//! [initial]
//! cert_file = "/etc/sentinel-certmon/cert.pem"
//! key_file = "/etc/sentinel-certmon/key.pem"
//! ```
//!
//! `CERTMON_TOKEN`, `CERTMON_NODE_NAME` and `CERTMON_DATACENTER` override the
//! corresponding file settings.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::{Validate, ValidationError};

mod error;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use validate::{check_files, FileReport};

/// Overrides `issuer.token`
pub const ENV_TOKEN: &str = "CERTMON_TOKEN";

/// Overrides `identity.node_name`
pub const ENV_NODE_NAME: &str = "CERTMON_NODE_NAME";

/// Overrides `identity.datacenter`
pub const ENV_DATACENTER: &str = "CERTMON_DATACENTER";

/// Root agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Identity requested from the issuer
    #[serde(default)]
    #[validate(nested)]
    pub identity: IdentityConfig,

    /// Renewal timing
    #[serde(default)]
    #[validate(nested)]
    pub renewal: RenewalConfig,

    /// Certificate directory kept fresh by the caching agent
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Fallback issuance endpoint
    #[validate(nested)]
    pub issuer: IssuerConfig,

    /// Certificate already held at startup
    #[serde(default)]
    pub initial: Option<InitialConfig>,

    /// Write metrics in the Prometheus text format to this file
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,

    /// Seconds between metrics file writes
    #[serde(default = "default_metrics_interval_secs")]
    #[validate(range(min = 1))]
    pub metrics_interval_secs: u64,
}

/// Identity attributes
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    #[serde(default)]
    #[validate(length(min = 1, message = "node_name is required"))]
    pub node_name: String,

    #[serde(default = "default_datacenter")]
    #[validate(length(min = 1))]
    pub datacenter: String,

    #[serde(default)]
    pub dns_sans: Vec<String>,

    #[serde(default)]
    pub ip_sans: Vec<IpAddr>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            datacenter: default_datacenter(),
            dns_sans: Vec::new(),
            ip_sans: Vec::new(),
        }
    }
}

/// Renewal timing. A zero leeway selects the built-in default.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RenewalConfig {
    #[serde(default = "default_fallback_leeway_secs")]
    pub fallback_leeway_secs: u64,

    #[serde(default = "default_fallback_retry_secs")]
    #[validate(range(min = 1))]
    pub fallback_retry_secs: u64,

    #[serde(default = "default_resubscribe_delay_secs")]
    #[validate(range(min = 1))]
    pub resubscribe_delay_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            fallback_leeway_secs: default_fallback_leeway_secs(),
            fallback_retry_secs: default_fallback_retry_secs(),
            resubscribe_delay_secs: default_resubscribe_delay_secs(),
        }
    }
}

impl RenewalConfig {
    pub fn fallback_leeway(&self) -> Duration {
        Duration::from_secs(self.fallback_leeway_secs)
    }

    pub fn fallback_retry(&self) -> Duration {
        Duration::from_secs(self.fallback_retry_secs)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_secs(self.resubscribe_delay_secs)
    }
}

/// Watched certificate directory
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_cert_file")]
    #[validate(length(min = 1))]
    pub cert_file: String,

    #[serde(default = "default_key_file")]
    #[validate(length(min = 1))]
    pub key_file: String,

    /// CA bundle file name; unset when the chain lives in `cert_file`
    #[serde(default = "default_ca_file")]
    pub ca_file: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            ca_file: default_ca_file(),
        }
    }
}

/// Fallback issuance endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_token_source"))]
pub struct IssuerConfig {
    #[validate(url)]
    pub url: String,

    #[serde(default = "default_issuer_timeout_secs")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    /// Agent token, inline
    #[serde(default)]
    pub token: Option<String>,

    /// Agent token, read from a file on every issuance attempt
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

impl IssuerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Certificate material held at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitialConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn validate_token_source(issuer: &IssuerConfig) -> Result<(), ValidationError> {
    if issuer.token.is_some() && issuer.token_file.is_some() {
        let mut error = ValidationError::new("token_source");
        error.message = Some("set either issuer.token or issuer.token_file, not both".into());
        return Err(error);
    }
    Ok(())
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

fn default_fallback_leeway_secs() -> u64 {
    10
}

fn default_fallback_retry_secs() -> u64 {
    60
}

fn default_resubscribe_delay_secs() -> u64 {
    1
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from("/var/lib/sentinel-certmon/certs")
}

fn default_cert_file() -> String {
    "cert.pem".to_string()
}

fn default_key_file() -> String {
    "key.pem".to_string()
}

fn default_ca_file() -> Option<String> {
    Some("ca.pem".to_string())
}

fn default_issuer_timeout_secs() -> u64 {
    30
}

fn default_metrics_interval_secs() -> u64 {
    15
}

impl AgentConfig {
    /// Parse TOML without applying overrides or validating.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load, apply environment overrides and validate.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        info!(
            path = %path.display(),
            node_name = %config.identity.node_name,
            datacenter = %config.identity.datacenter,
            "Loaded certificate monitor configuration"
        );
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(token) = lookup(ENV_TOKEN) {
            debug!(var = ENV_TOKEN, "Using agent token from environment");
            self.issuer.token = Some(token);
            self.issuer.token_file = None;
        }
        if let Some(node_name) = lookup(ENV_NODE_NAME) {
            debug!(var = ENV_NODE_NAME, node_name = %node_name, "Overriding node name");
            self.identity.node_name = node_name;
        }
        if let Some(datacenter) = lookup(ENV_DATACENTER) {
            debug!(var = ENV_DATACENTER, datacenter = %datacenter, "Overriding datacenter");
            self.identity.datacenter = datacenter;
        }
    }
}
