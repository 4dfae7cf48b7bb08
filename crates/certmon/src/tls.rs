//! rustls-backed TLS configurator.
//!
//! [`ReloadableIdentity`] holds the currently installed identity as a single
//! snapshot and swaps it atomically, so a handshake resolving a certificate
//! always sees the leaf, key and trust roots of one publication. Install it as
//! the certificate resolver of a rustls `ServerConfig` and/or `ClientConfig`.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::certificate::CertificateValue;
use crate::error::PublishError;
use crate::publisher::TlsConfigurator;

/// One installed identity
#[derive(Debug)]
pub struct IdentitySnapshot {
    value: Arc<CertificateValue>,
    certified_key: Arc<CertifiedKey>,
    roots: Arc<RootCertStore>,
}

/// Build the rustls signing identity for `value`, checking that its private
/// key belongs to the leaf.
pub(crate) fn certified_key(value: &CertificateValue) -> Result<CertifiedKey, PublishError> {
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(value.private_key())
        .map_err(|e| PublishError::InvalidKey(e.to_string()))?;

    let mut cert_chain = Vec::with_capacity(value.chain().len() + 1);
    cert_chain.push(value.leaf().clone());
    cert_chain.extend(value.chain().iter().cloned());
    let certified_key = CertifiedKey::new(cert_chain, signing_key);
    certified_key
        .keys_match()
        .map_err(|e| PublishError::InvalidKey(format!("key does not match certificate: {}", e)))?;

    Ok(certified_key)
}

impl IdentitySnapshot {
    fn build(value: &Arc<CertificateValue>) -> Result<Self, PublishError> {
        let certified_key = certified_key(value)?;

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(value.chain().iter().cloned());
        if ignored > 0 {
            warn!(added, ignored, "Some CA certificates could not be parsed");
        }
        if added == 0 && !value.chain().is_empty() {
            return Err(PublishError::InvalidChain(
                "no usable CA certificate in chain".to_string(),
            ));
        }

        Ok(Self {
            value: Arc::clone(value),
            certified_key: Arc::new(certified_key),
            roots: Arc::new(roots),
        })
    }

    pub fn value(&self) -> &Arc<CertificateValue> {
        &self.value
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    /// Trust roots for verifying peers, built from the CA chain
    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }
}

/// Hot-swappable mutual-TLS identity
#[derive(Debug, Default)]
pub struct ReloadableIdentity {
    current: ArcSwapOption<IdentitySnapshot>,
}

impl ReloadableIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// The installed identity, if any
    pub fn snapshot(&self) -> Option<Arc<IdentitySnapshot>> {
        self.current.load_full()
    }

    /// Trust roots of the installed identity
    pub fn root_store(&self) -> Option<Arc<RootCertStore>> {
        self.current
            .load()
            .as_ref()
            .map(|snapshot| Arc::clone(&snapshot.roots))
    }

    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.current
            .load()
            .as_ref()
            .map(|snapshot| Arc::clone(&snapshot.certified_key))
    }
}

impl TlsConfigurator for ReloadableIdentity {
    fn update_identity(&self, identity: &Arc<CertificateValue>) -> Result<(), PublishError> {
        let snapshot = IdentitySnapshot::build(identity)?;
        debug!(
            not_after = %identity.not_after(),
            roots = snapshot.roots.len(),
            "Installing TLS identity"
        );
        self.current.store(Some(Arc::new(snapshot)));
        Ok(())
    }
}

impl ResolvesServerCert for ReloadableIdentity {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }
}

impl ResolvesClientCert for ReloadableIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }

    fn has_certs(&self) -> bool {
        self.current.load().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{generate_pem, generated_value, value_with_window};
    use chrono::Utc;

    #[test]
    fn test_empty_identity_resolves_nothing() {
        let identity = ReloadableIdentity::new();

        assert!(!identity.has_certs());
        assert!(identity.snapshot().is_none());
        assert!(identity.root_store().is_none());
        assert!(ResolvesClientCert::resolve(&identity, &[], &[]).is_none());
    }

    #[test]
    fn test_update_installs_key_and_roots() {
        let identity = ReloadableIdentity::new();
        let value = Arc::new(generated_value("agent.dc1.internal"));

        identity.update_identity(&value).unwrap();

        assert!(identity.has_certs());
        let key = ResolvesClientCert::resolve(&identity, &[], &[]).unwrap();
        assert_eq!(key.cert[0], *value.leaf());
        assert_eq!(key.cert.len(), 1 + value.chain().len());
        assert_eq!(identity.root_store().unwrap().len(), 1);
        assert!(Arc::ptr_eq(identity.snapshot().unwrap().value(), &value));
    }

    #[test]
    fn test_renewal_swaps_snapshot() {
        let identity = ReloadableIdentity::new();
        let first = Arc::new(generated_value("agent.dc1.internal"));
        let second = Arc::new(generated_value("agent.dc1.internal"));

        identity.update_identity(&first).unwrap();
        let before = identity.snapshot().unwrap();
        identity.update_identity(&second).unwrap();

        assert!(Arc::ptr_eq(before.value(), &first));
        assert!(Arc::ptr_eq(identity.snapshot().unwrap().value(), &second));
    }

    #[test]
    fn test_invalid_key_is_rejected_and_previous_kept() {
        let identity = ReloadableIdentity::new();
        let good = Arc::new(generated_value("agent.dc1.internal"));
        identity.update_identity(&good).unwrap();

        let garbage = Arc::new(value_with_window(Utc::now(), 3600));
        let err = identity.update_identity(&garbage).unwrap_err();

        assert!(matches!(err, PublishError::InvalidKey(_)));
        assert!(Arc::ptr_eq(identity.snapshot().unwrap().value(), &good));
    }

    #[test]
    fn test_mismatched_key_is_rejected_and_previous_kept() {
        let identity = ReloadableIdentity::new();
        let good = Arc::new(generated_value("agent.dc1.internal"));
        identity.update_identity(&good).unwrap();

        let leaf = generate_pem("agent.dc1.internal");
        let other_key = rcgen::KeyPair::generate().unwrap();
        let mismatched = Arc::new(
            CertificateValue::from_pem(
                leaf.cert_pem.as_bytes(),
                other_key.serialize_pem().as_bytes(),
                Some(leaf.ca_pem.as_bytes()),
            )
            .unwrap(),
        );

        let err = identity.update_identity(&mismatched).unwrap_err();

        assert!(matches!(err, PublishError::InvalidKey(_)));
        assert!(Arc::ptr_eq(identity.snapshot().unwrap().value(), &good));
    }
}
