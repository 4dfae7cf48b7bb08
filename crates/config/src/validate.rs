//! File checks
//!
//! Structural validation happens in [`AgentConfig::from_file`]. The checks
//! here look at the filesystem: the initial certificate and key, the token
//! file and the cache directory. They back the `--test` mode of the agent.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::AgentConfig;

/// Outcome of [`check_files`]
#[derive(Debug, Default, Clone)]
pub struct FileReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl FileReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        self.warnings.push(message);
    }
}

/// Check the files referenced by `config`.
pub fn check_files(config: &AgentConfig) -> FileReport {
    let mut report = FileReport::default();

    if !config.cache.directory.is_dir() {
        report.warning(format!(
            "Cache directory {:?} does not exist yet; it will be created",
            config.cache.directory
        ));
    }

    if let Some(token_file) = &config.issuer.token_file {
        match fs::read_to_string(token_file) {
            Ok(token) if token.trim().is_empty() => {
                report.error(format!("Token file is empty: {:?}", token_file))
            }
            Ok(_) => {}
            Err(e) => report.error(format!("Failed to read token file {:?}: {}", token_file, e)),
        }
    }

    if let Some(initial) = &config.initial {
        if !initial.key_file.exists() {
            report.error(format!("Private key not found: {:?}", initial.key_file));
        }
        if let Some(ca_file) = &initial.ca_file {
            if !ca_file.exists() {
                report.error(format!("CA bundle not found: {:?}", ca_file));
            }
        }

        if !initial.cert_file.exists() {
            report.error(format!("Certificate not found: {:?}", initial.cert_file));
        } else {
            let leeway = config.renewal.fallback_leeway();
            match check_certificate(&initial.cert_file, leeway) {
                Ok(Some(warning)) => report.warning(warning),
                Ok(None) => {}
                Err(e) => report.error(e),
            }
        }
    }

    report
}

/// Parse the leaf in `cert_path` and report how close it is to expiry.
fn check_certificate(cert_path: &Path, leeway: Duration) -> Result<Option<String>, String> {
    let cert_pem = fs::read(cert_path)
        .map_err(|e| format!("Failed to read certificate {:?}: {}", cert_path, e))?;

    let pem = pem::parse(&cert_pem)
        .map_err(|e| format!("Failed to parse certificate {:?}: {}", cert_path, e))?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents())
        .map_err(|e| format!("Invalid X509 certificate {:?}: {}", cert_path, e))?;

    let not_after = cert.validity().not_after.timestamp();
    let expiry_time = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after.max(0) as u64);
    let now = SystemTime::now();

    if expiry_time < now {
        return Ok(Some(format!(
            "Initial certificate expired: {:?} (expired at {}); a new one will be requested at startup",
            cert_path,
            cert.validity().not_after
        )));
    }

    if expiry_time < now + leeway {
        return Ok(Some(format!(
            "Initial certificate expires within the fallback leeway: {:?} (expires at {})",
            cert_path,
            cert.validity().not_after
        )));
    }

    Ok(None)
}
