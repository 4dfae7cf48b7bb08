//! Prometheus metrics for the renewal engine.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Where an accepted certificate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSource {
    Initial,
    Watch,
    Fallback,
}

impl CertificateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Watch => "watch",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for CertificateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renewal engine metrics
#[derive(Debug, Clone)]
pub struct RenewalMetrics {
    fallback_attempts: IntCounter,
    fallback_failures: IntCounter,
    publishes: IntCounterVec,
    publish_failures: IntCounter,
    stale_watches: IntCounter,
    rejected: IntCounterVec,
    not_after: IntGauge,
}

impl RenewalMetrics {
    /// Create unregistered metrics
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            fallback_attempts: IntCounter::new(
                "certmon_fallback_attempts_total",
                "Fallback issuance attempts started",
            )?,
            fallback_failures: IntCounter::new(
                "certmon_fallback_failures_total",
                "Fallback issuance attempts that failed",
            )?,
            publishes: IntCounterVec::new(
                Opts::new(
                    "certmon_publishes_total",
                    "Certificates installed into the TLS configuration",
                ),
                &["source"],
            )?,
            publish_failures: IntCounter::new(
                "certmon_publish_failures_total",
                "Certificates the TLS configuration refused",
            )?,
            stale_watches: IntCounter::new(
                "certmon_stale_watch_total",
                "Times the cache watch went stale",
            )?,
            rejected: IntCounterVec::new(
                Opts::new(
                    "certmon_rejected_certificates_total",
                    "Certificates discarded before publishing",
                ),
                &["source", "reason"],
            )?,
            not_after: IntGauge::new(
                "certmon_certificate_not_after_seconds",
                "Expiry of the active certificate as a unix timestamp",
            )?,
        })
    }

    /// Register all metrics with `registry`
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.fallback_attempts.clone()))?;
        registry.register(Box::new(self.fallback_failures.clone()))?;
        registry.register(Box::new(self.publishes.clone()))?;
        registry.register(Box::new(self.publish_failures.clone()))?;
        registry.register(Box::new(self.stale_watches.clone()))?;
        registry.register(Box::new(self.rejected.clone()))?;
        registry.register(Box::new(self.not_after.clone()))?;
        Ok(())
    }

    pub(crate) fn record_fallback_attempt(&self) {
        self.fallback_attempts.inc();
    }

    pub(crate) fn record_fallback_failure(&self) {
        self.fallback_failures.inc();
    }

    pub(crate) fn record_publish(&self, source: CertificateSource, not_after: i64) {
        self.publishes.with_label_values(&[source.as_str()]).inc();
        self.not_after.set(not_after);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub(crate) fn record_stale_watch(&self) {
        self.stale_watches.inc();
    }

    pub(crate) fn record_rejected(&self, source: CertificateSource, reason: &str) {
        self.rejected
            .with_label_values(&[source.as_str(), reason])
            .inc();
    }

    pub fn fallback_attempts(&self) -> u64 {
        self.fallback_attempts.get()
    }

    pub fn fallback_failures(&self) -> u64 {
        self.fallback_failures.get()
    }

    pub fn publishes(&self, source: CertificateSource) -> u64 {
        self.publishes.with_label_values(&[source.as_str()]).get()
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.get()
    }

    pub fn stale_watches(&self) -> u64 {
        self.stale_watches.get()
    }

    pub fn rejected(&self, source: CertificateSource, reason: &str) -> u64 {
        self.rejected.with_label_values(&[source.as_str(), reason]).get()
    }
}
