//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcgen::{date_time_ymd, CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::certificate::CertificateValue;
use crate::error::PublishError;
use crate::publisher::TlsConfigurator;

/// PEM material minted by rcgen: a leaf valid 2020-01-01..2040-01-01 and a
/// separate self-signed CA certificate.
pub struct GeneratedPem {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

pub fn generate_pem(dns_name: &str) -> GeneratedPem {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![dns_name.to_string()]).unwrap();
    params.not_before = date_time_ymd(2020, 1, 1);
    params.not_after = date_time_ymd(2040, 1, 1);
    let cert = params.self_signed(&key_pair).unwrap();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    GeneratedPem {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        ca_pem: ca.pem(),
    }
}

/// A real, parseable certificate value.
pub fn generated_value(dns_name: &str) -> CertificateValue {
    let generated = generate_pem(dns_name);
    CertificateValue::from_pem(
        generated.cert_pem.as_bytes(),
        generated.key_pem.as_bytes(),
        Some(generated.ca_pem.as_bytes()),
    )
    .unwrap()
}

/// A value with opaque bytes and an explicit window of `lifetime_secs`
/// starting at `not_before`. Fine for anything that never parses the DER.
pub fn value_with_window(not_before: DateTime<Utc>, lifetime_secs: i64) -> CertificateValue {
    value_between(not_before, not_before + chrono::Duration::seconds(lifetime_secs))
}

pub fn value_between(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> CertificateValue {
    let marker = not_after.timestamp().to_be_bytes().to_vec();
    CertificateValue::new(
        CertificateDer::from(marker.clone()),
        PrivateKeyDer::Pkcs8(marker.into()),
        vec![CertificateDer::from(vec![0xCA])],
        not_before,
        not_after,
    )
    .unwrap()
}

/// TLS configurator that records every installed identity and can be told
/// to reject the next few.
#[derive(Default)]
pub struct RecordingConfigurator {
    published: Mutex<Vec<Arc<CertificateValue>>>,
    failures_left: Mutex<u32>,
}

impl RecordingConfigurator {
    pub fn published(&self) -> Vec<Arc<CertificateValue>> {
        self.published.lock().clone()
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures_left.lock() = count;
    }
}

impl TlsConfigurator for RecordingConfigurator {
    fn update_identity(&self, identity: &Arc<CertificateValue>) -> Result<(), PublishError> {
        let mut failures_left = self.failures_left.lock();
        if *failures_left > 0 {
            *failures_left -= 1;
            return Err(PublishError::Rejected("malformed key material".to_string()));
        }
        self.published.lock().push(Arc::clone(identity));
        Ok(())
    }
}
