//! Directory-backed certificate cache
//!
//! Watches a directory that an external agent keeps populated with the
//! current identity:
//!
//! ```text
//! certs/
//! ├── cert.pem      # Leaf certificate, optionally followed by intermediates
//! ├── key.pem       # Private key (0600)
//! └── ca.pem        # CA bundle
//! ```
//!
//! Every change in the directory reloads the files and yields the parsed
//! value. Partially written material (one of cert/key missing, or unparsable)
//! yields an error, which the cache watcher logs and skips; the complete write
//! that follows yields the value.
//!
//! The cache is also a [`TlsConfigurator`]: publishing a value writes it back
//! into the directory, so processes reading the files pick up certificates
//! obtained through fallback issuance too. The watcher then re-delivers the
//! same value, which the scheduler treats as a duplicate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::certificate::CertificateValue;
use crate::error::{PublishError, WatchError};
use crate::publisher::TlsConfigurator;
use crate::tls;
use crate::watcher::{CacheUpdate, CertificateCache};

/// Default certificate file name
pub const DEFAULT_CERT_FILE: &str = "cert.pem";

/// Default private key file name
pub const DEFAULT_KEY_FILE: &str = "key.pem";

/// Default CA bundle file name
pub const DEFAULT_CA_FILE: &str = "ca.pem";

/// Quiet period after a change before the files are read
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

const UPDATE_CHANNEL_CAPACITY: usize = 8;

/// Certificate cache backed by PEM files in a directory
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    dir: PathBuf,
    cert_file: String,
    key_file: String,
    ca_file: Option<String>,
    debounce: Duration,
}

impl DirectoryCache {
    /// Watch `dir` using the default file names
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cert_file: DEFAULT_CERT_FILE.to_string(),
            key_file: DEFAULT_KEY_FILE.to_string(),
            ca_file: Some(DEFAULT_CA_FILE.to_string()),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Override the file names. Without a CA file the chain comes from the
    /// certificate file alone.
    pub fn with_file_names(
        mut self,
        cert_file: impl Into<String>,
        key_file: impl Into<String>,
        ca_file: Option<String>,
    ) -> Self {
        self.cert_file = cert_file.into();
        self.key_file = key_file.into();
        self.ca_file = ca_file;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(&self.cert_file)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(&self.key_file)
    }

    pub fn ca_path(&self) -> Option<PathBuf> {
        self.ca_file.as_ref().map(|name| self.dir.join(name))
    }

    /// Read the current material.
    ///
    /// Returns `Ok(None)` when neither certificate nor key exists yet.
    pub fn load(&self) -> Result<Option<CertificateValue>, WatchError> {
        let cert = read_optional(&self.cert_path())?;
        let key = read_optional(&self.key_path())?;

        let (cert, key) = match (cert, key) {
            (None, None) => return Ok(None),
            (Some(cert), Some(key)) => (cert, key),
            (Some(_), None) => {
                return Err(WatchError::Fetch(format!("{} is missing", self.key_file)))
            }
            (None, Some(_)) => {
                return Err(WatchError::Fetch(format!("{} is missing", self.cert_file)))
            }
        };

        let ca = match self.ca_path() {
            Some(path) => read_optional(&path)?,
            None => None,
        };

        let value = CertificateValue::from_pem(&cert, &key, ca.as_deref())?;
        Ok(Some(value))
    }

    fn read_update(&self) -> Option<CacheUpdate> {
        match self.load() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                trace!(dir = %self.dir.display(), "No certificate material present yet");
                None
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn write_material(&self, value: &CertificateValue) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        // Key first, certificate last: a reader that sees the certificate also
        // sees the matching key.
        write_file(&self.key_path(), value.private_key_pem().as_bytes(), 0o600)?;
        let cert_pem = match self.ca_path() {
            Some(ca_path) => {
                write_file(&ca_path, value.chain_pem().as_bytes(), 0o644)?;
                value.leaf_pem()
            }
            None => value.leaf_pem() + &value.chain_pem(),
        };
        write_file(&self.cert_path(), cert_pem.as_bytes(), 0o644)
    }
}

#[async_trait]
impl CertificateCache for DirectoryCache {
    async fn prepopulate(&self, value: &CertificateValue) -> Result<(), WatchError> {
        if self.cert_path().exists() {
            debug!(
                path = %self.cert_path().display(),
                "Certificate already present, not prepopulating"
            );
            return Ok(());
        }

        self.write_material(value)
            .map_err(|e| WatchError::Fetch(format!("failed to write certificate material: {}", e)))?;

        info!(
            dir = %self.dir.display(),
            not_after = %value.not_after(),
            "Prepopulated certificate directory"
        );
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<CacheUpdate>, WatchError> {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                    // A pending trigger already covers this change.
                    let _ = trigger_tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "Certificate directory watch error"),
        })
        .map_err(|e| WatchError::Subscribe(e.to_string()))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::Subscribe(format!("{}: {}", self.dir.display(), e)))?;

        debug!(dir = %self.dir.display(), "Watching certificate directory");

        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let cache = self.clone();

        tokio::spawn(async move {
            // Dropping the watcher ends the subscription.
            let _watcher = watcher;

            if let Some(update) = cache.read_update() {
                if tx.send(update).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    trigger = trigger_rx.recv() => {
                        if trigger.is_none() {
                            break;
                        }
                        tokio::time::sleep(cache.debounce).await;
                        while trigger_rx.try_recv().is_ok() {}

                        if let Some(update) = cache.read_update() {
                            if tx.send(update).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            debug!(dir = %cache.dir.display(), "Certificate directory watch stopped");
        });

        Ok(rx)
    }
}

impl TlsConfigurator for DirectoryCache {
    fn update_identity(&self, identity: &Arc<CertificateValue>) -> Result<(), PublishError> {
        tls::certified_key(identity)?;

        // Never replace newer material the caching agent already wrote.
        if let Ok(Some(current)) = self.load() {
            if !identity.is_newer_than(&current) {
                trace!(
                    dir = %self.dir.display(),
                    on_disk_not_after = %current.not_after(),
                    "Certificate directory already up to date"
                );
                return Ok(());
            }
        }

        self.write_material(identity).map_err(|e| {
            PublishError::Rejected(format!(
                "failed to write certificate material to {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        info!(
            dir = %self.dir.display(),
            not_after = %identity.not_after(),
            "Wrote certificate material"
        );
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, WatchError> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WatchError::Fetch(format!("{}: {}", path.display(), e))),
    }
}

/// Write through a temporary file and rename into place.
fn write_file(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    fs::rename(&tmp_path, path)
}
