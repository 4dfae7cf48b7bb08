//! Certificate values
//!
//! A [`CertificateValue`] is an immutable snapshot of an agent identity: the
//! leaf certificate, its private key, the CA chain and the leaf's validity
//! window. Values are never mutated; a newer value supersedes an older one.

use std::fmt;
use std::io::BufRead;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::trace;

use crate::error::CertificateError;

/// Immutable bundle of leaf certificate, key, trust chain and validity window
pub struct CertificateValue {
    leaf: CertificateDer<'static>,
    private_key: PrivateKeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    serial: Option<String>,
}

impl CertificateValue {
    /// Build a value from already-decoded parts and an explicit validity window.
    pub fn new(
        leaf: CertificateDer<'static>,
        private_key: PrivateKeyDer<'static>,
        chain: Vec<CertificateDer<'static>>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Self, CertificateError> {
        if not_before > not_after {
            return Err(CertificateError::InvalidValidity {
                not_before: not_before.timestamp(),
                not_after: not_after.timestamp(),
            });
        }

        Ok(Self {
            leaf,
            private_key,
            chain,
            not_before,
            not_after,
            serial: None,
        })
    }

    /// Build a value from DER material, reading the validity window and
    /// serial number out of the leaf certificate.
    pub fn from_der(
        leaf: CertificateDer<'static>,
        private_key: PrivateKeyDer<'static>,
        chain: Vec<CertificateDer<'static>>,
    ) -> Result<Self, CertificateError> {
        let (not_before, not_after, serial) = {
            let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
                .map_err(|e| CertificateError::X509(e.to_string()))?;
            let validity = cert.validity();
            (
                timestamp(validity.not_before.timestamp())?,
                timestamp(validity.not_after.timestamp())?,
                cert.raw_serial_as_string(),
            )
        };

        trace!(
            serial = %serial,
            not_before = %not_before,
            not_after = %not_after,
            chain_len = chain.len(),
            "Parsed leaf certificate"
        );

        let mut value = Self::new(leaf, private_key, chain, not_before, not_after)?;
        value.serial = Some(serial);
        Ok(value)
    }

    /// Build a value from PEM material.
    ///
    /// The first certificate in `cert_pem` is the leaf; any further
    /// certificates in it are treated as intermediates and come first in the
    /// chain, followed by every certificate in `ca_pem`.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, CertificateError> {
        let mut certs = parse_certs(&mut &cert_pem[..])?.into_iter();
        let leaf = certs.next().ok_or(CertificateError::MissingLeaf)?;
        let mut chain: Vec<_> = certs.collect();

        if let Some(ca_pem) = ca_pem {
            chain.extend(parse_certs(&mut &ca_pem[..])?);
        }

        let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| CertificateError::Pem(e.to_string()))?
            .ok_or(CertificateError::MissingKey)?;

        Self::from_der(leaf, private_key, chain)
    }

    /// Leaf certificate (DER)
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.leaf
    }

    /// Private key matching the leaf (DER)
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Ordered CA chain: intermediates first, roots last
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Leaf serial number in hex, when the value was parsed from a certificate
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// `not_before <= now <= not_after`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }

    /// Signed time left until expiry; negative once expired.
    pub fn expires_in(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }

    /// Instant at which passive renewal is considered late: `not_after - leeway`.
    pub fn renewal_deadline(&self, leeway: Duration) -> DateTime<Utc> {
        let leeway = chrono::Duration::from_std(leeway).unwrap_or(chrono::Duration::MAX);
        self.not_after
            .checked_sub_signed(leeway)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether both values cover exactly the same validity window.
    pub fn same_validity(&self, other: &CertificateValue) -> bool {
        self.not_before == other.not_before && self.not_after == other.not_after
    }

    /// Whether this value expires strictly later than `other`.
    pub fn is_newer_than(&self, other: &CertificateValue) -> bool {
        self.not_after > other.not_after
    }

    /// PEM encoding of the leaf certificate.
    pub fn leaf_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.leaf.as_ref().to_vec()))
    }

    /// PEM encoding of the private key, tagged by key format.
    pub fn private_key_pem(&self) -> String {
        let tag = match &self.private_key {
            PrivateKeyDer::Pkcs1(_) => "RSA PRIVATE KEY",
            PrivateKeyDer::Sec1(_) => "EC PRIVATE KEY",
            _ => "PRIVATE KEY",
        };
        pem::encode(&pem::Pem::new(
            tag,
            self.private_key.secret_der().to_vec(),
        ))
    }

    /// PEM encoding of the whole CA chain.
    pub fn chain_pem(&self) -> String {
        self.chain
            .iter()
            .map(|c| pem::encode(&pem::Pem::new("CERTIFICATE", c.as_ref().to_vec())))
            .collect()
    }
}

impl Clone for CertificateValue {
    fn clone(&self) -> Self {
        Self {
            leaf: self.leaf.clone(),
            private_key: self.private_key.clone_key(),
            chain: self.chain.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            serial: self.serial.clone(),
        }
    }
}

impl fmt::Debug for CertificateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateValue")
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

fn parse_certs(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Pem(e.to_string()))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateError::X509(format!("timestamp out of range: {}", secs)))
}
