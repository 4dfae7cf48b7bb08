//! Certificate monitor
//!
//! [`CertMonitor`] wires the cache watcher, the renewal scheduler and the
//! publisher together and starts them under one root cancellation token.
//! The returned [`MonitorHandle`] observes and stops the running engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::certificate::CertificateValue;
use crate::clock::{Clock, SystemClock};
use crate::config::CertMonitorConfig;
use crate::error::{CertMonitorError, CertMonitorResult};
use crate::fallback::FallbackIssuer;
use crate::metrics::RenewalMetrics;
use crate::publisher::{Publisher, TlsConfigurator};
use crate::scheduler::{MonitorStatus, Phase, RenewalScheduler};
use crate::tokens::TokenStore;
use crate::watcher::{CacheWatcher, CertificateCache};

/// Keeps an agent's TLS identity fresh
pub struct CertMonitor {
    config: CertMonitorConfig,
    cache: Arc<dyn CertificateCache>,
    issuer: Arc<dyn FallbackIssuer>,
    tokens: Arc<dyn TokenStore>,
    configurator: Arc<dyn TlsConfigurator>,
    clock: Arc<dyn Clock>,
    metrics: Option<RenewalMetrics>,
    resubscribe_delay: Option<Duration>,
}

impl CertMonitor {
    /// Create a monitor. Zero durations in `config` are replaced with defaults.
    pub fn new(
        config: CertMonitorConfig,
        cache: Arc<dyn CertificateCache>,
        issuer: Arc<dyn FallbackIssuer>,
        tokens: Arc<dyn TokenStore>,
        configurator: Arc<dyn TlsConfigurator>,
    ) -> Self {
        Self {
            config: config.normalized(),
            cache,
            issuer,
            tokens,
            configurator,
            clock: Arc::new(SystemClock),
            metrics: None,
            resubscribe_delay: None,
        }
    }

    /// Use `clock` for validity decisions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record into `metrics` instead of a private, unregistered set
    pub fn with_metrics(mut self, metrics: RenewalMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the cache watcher's delay between subscription attempts
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = Some(delay);
        self
    }

    pub fn config(&self) -> &CertMonitorConfig {
        &self.config
    }

    /// Seed the cache, start watching and start the renewal loop.
    pub async fn start(self) -> CertMonitorResult<MonitorHandle> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => RenewalMetrics::new()?,
        };
        let cancel = CancellationToken::new();

        let mut watcher = CacheWatcher::new(self.cache, self.config.fallback_leeway);
        if let Some(delay) = self.resubscribe_delay {
            watcher = watcher.with_resubscribe_delay(delay);
        }
        let events = watcher
            .start(self.config.initial.as_ref(), cancel.child_token())
            .await;

        let scheduler = RenewalScheduler::new(
            self.config,
            Publisher::new(self.configurator),
            self.issuer,
            metrics.clone(),
            events,
            cancel.clone(),
        )
        .with_tokens(self.tokens)
        .with_clock(self.clock);

        debug!(scheduler = ?scheduler, "Certificate monitor configured");
        let status = scheduler.status();
        let task = tokio::spawn(scheduler.run());

        info!("Certificate monitor started");

        Ok(MonitorHandle {
            cancel,
            status,
            metrics,
            task,
        })
    }
}

impl std::fmt::Debug for CertMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertMonitor")
            .field("config", &self.config)
            .field("resubscribe_delay", &self.resubscribe_delay)
            .finish_non_exhaustive()
    }
}

/// Handle to a running [`CertMonitor`]
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    status: watch::Receiver<MonitorStatus>,
    metrics: RenewalMetrics,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// The active certificate, if one is held
    pub fn current(&self) -> Option<Arc<CertificateValue>> {
        self.status.borrow().active.clone()
    }

    /// Current renewal phase
    pub fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> &RenewalMetrics {
        &self.metrics
    }

    /// Ask the monitor to stop. Cancels any outstanding fallback issuance.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Shutting down certificate monitor");
        }
        self.cancel.cancel();
    }

    /// Wait for the renewal loop to finish.
    pub async fn wait(self) -> CertMonitorResult<()> {
        self.task
            .await
            .map_err(|e| CertMonitorError::Terminated(e.to_string()))
    }

    /// Stop the monitor and wait for it to finish
    pub async fn shutdown_and_wait(self) -> CertMonitorResult<()> {
        self.shutdown();
        self.wait().await
    }
}
