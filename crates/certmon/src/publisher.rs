//! Publishing accepted certificates to the TLS layer.
//!
//! The [`Publisher`] is owned by the renewal scheduler and is the only path to
//! the [`TlsConfigurator`]. It refuses expired material and makes repeated
//! publication of the same value a no-op, so each accepted value reaches the
//! TLS layer exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::certificate::CertificateValue;
use crate::error::PublishError;

/// The component that terminates TLS connections.
///
/// Implementations must install leaf, key and chain as one unit: handshakes
/// before and after the call each see a consistent identity.
pub trait TlsConfigurator: Send + Sync + 'static {
    fn update_identity(&self, identity: &Arc<CertificateValue>) -> Result<(), PublishError>;
}

/// Applies accepted certificate values to a [`TlsConfigurator`]
pub struct Publisher {
    configurator: Arc<dyn TlsConfigurator>,
    last_published: Option<Arc<CertificateValue>>,
}

impl Publisher {
    pub fn new(configurator: Arc<dyn TlsConfigurator>) -> Self {
        Self {
            configurator,
            last_published: None,
        }
    }

    /// Install `value` unless it is expired or was already installed.
    pub fn publish(
        &mut self,
        value: &Arc<CertificateValue>,
        now: DateTime<Utc>,
    ) -> Result<(), PublishError> {
        if value.is_expired_at(now) {
            return Err(PublishError::Expired {
                not_after: value.not_after().to_rfc3339(),
            });
        }

        if let Some(last) = &self.last_published {
            if Arc::ptr_eq(last, value)
                || (last.leaf() == value.leaf() && last.same_validity(value))
            {
                debug!(not_after = %value.not_after(), "Certificate already published");
                return Ok(());
            }
        }

        self.configurator.update_identity(value)?;
        self.last_published = Some(Arc::clone(value));

        info!(
            serial = value.serial().unwrap_or("-"),
            not_after = %value.not_after(),
            expires_in_secs = value.expires_in(now).num_seconds(),
            "Published certificate to TLS configuration"
        );
        Ok(())
    }

    /// The value most recently installed, if any
    pub fn last_published(&self) -> Option<&Arc<CertificateValue>> {
        self.last_published.as_ref()
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("last_published", &self.last_published)
            .finish()
    }
}
