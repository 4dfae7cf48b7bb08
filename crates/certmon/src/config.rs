//! Certificate monitor configuration
//!
//! All options are plain values fixed at construction time. Zero durations
//! mean "unset" and are replaced with the defaults by [`CertMonitorConfig::normalized`].

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::certificate::CertificateValue;

/// Default time before expiry at which fallback issuance engages
pub const DEFAULT_FALLBACK_LEEWAY: Duration = Duration::from_secs(10);

/// Default fixed delay between failed fallback attempts
pub const DEFAULT_FALLBACK_RETRY: Duration = Duration::from_secs(60);

/// Identity attributes sent with every fallback issuance request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRequest {
    /// DNS subject alternative names
    #[serde(default)]
    pub dns_sans: Vec<String>,
    /// IP subject alternative names
    #[serde(default)]
    pub ip_sans: Vec<IpAddr>,
    /// Datacenter the certificate is requested in
    #[serde(default)]
    pub datacenter: String,
    /// Agent node name
    #[serde(default)]
    pub node_name: String,
}

/// Configuration for a [`CertMonitor`](crate::CertMonitor)
#[derive(Debug, Clone)]
pub struct CertMonitorConfig {
    /// How long before `not_after` the watcher is given up on
    pub fallback_leeway: Duration,
    /// Delay between failed fallback issuance attempts
    pub fallback_retry: Duration,
    /// Identity attributes for fallback issuance
    pub identity: IdentityRequest,
    /// Certificate to seed the monitor with, if one is already held
    pub initial: Option<CertificateValue>,
}

impl Default for CertMonitorConfig {
    fn default() -> Self {
        Self {
            fallback_leeway: DEFAULT_FALLBACK_LEEWAY,
            fallback_retry: DEFAULT_FALLBACK_RETRY,
            identity: IdentityRequest::default(),
            initial: None,
        }
    }
}

impl CertMonitorConfig {
    /// Replace unset (zero) durations with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.fallback_leeway.is_zero() {
            debug!(
                default_secs = DEFAULT_FALLBACK_LEEWAY.as_secs(),
                "Fallback leeway unset, using default"
            );
            self.fallback_leeway = DEFAULT_FALLBACK_LEEWAY;
        }
        if self.fallback_retry.is_zero() {
            debug!(
                default_secs = DEFAULT_FALLBACK_RETRY.as_secs(),
                "Fallback retry unset, using default"
            );
            self.fallback_retry = DEFAULT_FALLBACK_RETRY;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CertMonitorConfig::default();
        assert_eq!(config.fallback_leeway, Duration::from_secs(10));
        assert_eq!(config.fallback_retry, Duration::from_secs(60));
        assert!(config.initial.is_none());
        assert!(config.identity.dns_sans.is_empty());
    }

    #[test]
    fn test_normalized_fills_zero_durations() {
        let config = CertMonitorConfig {
            fallback_leeway: Duration::ZERO,
            fallback_retry: Duration::ZERO,
            ..Default::default()
        }
        .normalized();

        assert_eq!(config.fallback_leeway, DEFAULT_FALLBACK_LEEWAY);
        assert_eq!(config.fallback_retry, DEFAULT_FALLBACK_RETRY);
    }

    #[test]
    fn test_normalized_keeps_explicit_values() {
        let config = CertMonitorConfig {
            fallback_leeway: Duration::from_secs(30),
            fallback_retry: Duration::from_secs(5),
            ..Default::default()
        }
        .normalized();

        assert_eq!(config.fallback_leeway, Duration::from_secs(30));
        assert_eq!(config.fallback_retry, Duration::from_secs(5));
    }

    #[test]
    fn test_identity_request_json_shape() {
        let identity = IdentityRequest {
            dns_sans: vec!["node-1.example".to_string()],
            ip_sans: vec!["10.0.0.7".parse().unwrap()],
            datacenter: "dc1".to_string(),
            node_name: "node-1".to_string(),
        };

        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["ip_sans"][0], "10.0.0.7");
        assert_eq!(json["node_name"], "node-1");
    }
}
