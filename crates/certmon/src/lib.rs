//! Sentinel Certificate Monitor
//!
//! Keeps a long-running agent's mutual-TLS identity fresh.
//!
//! Renewal is primarily passive: a caching layer renews the agent
//! certificate and the monitor watches it for updates. If the watched
//! certificate gets within the fallback leeway of expiry (or the watch is
//! lost for that long), the monitor requests a certificate explicitly and
//! retries at a fixed interval until one arrives. Every accepted certificate
//! is installed into the TLS configuration as a single atomic unit.
//!
//! # Architecture
//!
//! - [`CacheWatcher`] - Subscribes to a [`CertificateCache`] and re-subscribes across disconnections
//! - [`FallbackIssuer`] - Explicit issuance, one cancellable attempt at a time
//! - [`RenewalScheduler`] - The renewal state machine and its event loop
//! - [`Publisher`] - Applies accepted certificates to a [`TlsConfigurator`]
//! - [`CertMonitor`] - Wires the above together and returns a [`MonitorHandle`]
//!
//! Concrete collaborators for running as a sidecar: [`DirectoryCache`] (a
//! cache that also writes published certificates back to disk),
//! [`HttpIssuer`] and [`ReloadableIdentity`] for in-process rustls.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sentinel_certmon::{
//!     CertMonitor, CertMonitorConfig, DirectoryCache, HttpIssuer, ReloadableIdentity,
//!     StaticTokenStore,
//! };
//!
//! let identity = Arc::new(ReloadableIdentity::new());
//! let handle = CertMonitor::new(
//!     CertMonitorConfig::default(),
//!     Arc::new(DirectoryCache::new("/var/lib/agent/certs")),
//!     Arc::new(HttpIssuer::new(url, timeout)?),
//!     Arc::new(StaticTokenStore::new(Some(token))),
//!     identity.clone(),
//! )
//! .start()
//! .await?;
//!
//! // Hand `identity` to rustls as the server and client certificate resolver.
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod certificate;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod fallback;
pub mod http_issuer;
pub mod metrics;
pub mod monitor;
pub mod publisher;
pub mod scheduler;
pub mod tls;
pub mod tokens;
pub mod watcher;

#[cfg(test)]
mod test_util;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Certificate values
pub use certificate::CertificateValue;

// Configuration
pub use config::{CertMonitorConfig, IdentityRequest, DEFAULT_FALLBACK_LEEWAY, DEFAULT_FALLBACK_RETRY};

// Errors
pub use error::{
    CertMonitorError, CertMonitorResult, CertificateError, IssueError, PublishError, WatchError,
};

// Renewal engine
pub use fallback::{FallbackIssuer, FnIssuer, IssueContext};
pub use monitor::{CertMonitor, MonitorHandle};
pub use publisher::{Publisher, TlsConfigurator};
pub use scheduler::{MonitorStatus, Phase, RenewalScheduler, RenewalState};
pub use watcher::{CacheUpdate, CacheWatcher, CertificateCache, WatchEvent};

// Collaborators
pub use clock::{Clock, SystemClock};
pub use directory::DirectoryCache;
pub use http_issuer::HttpIssuer;
pub use metrics::{CertificateSource, RenewalMetrics};
pub use tls::{IdentitySnapshot, ReloadableIdentity};
pub use tokens::{FileTokenStore, StaticTokenStore, TokenStore};
