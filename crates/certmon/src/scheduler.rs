//! Renewal scheduler
//!
//! The scheduler owns the renewal state and is the only thing that mutates
//! it. It runs as a single loop that reacts, strictly one at a time, to:
//!
//! - certificate updates and staleness reports from the cache watcher
//! - the outcome of the (single) outstanding fallback issuance attempt
//! - its wake timer, set to `not_after - fallback_leeway` while the watcher is
//!   trusted and to `now + fallback_retry` after a failed attempt
//! - shutdown
//!
//! # States
//!
//! ```text
//!            watcher update (any state)
//!   ┌──────────────────────────────────────────────┐
//!   v                                              │
//! SEEDED ──deadline──> FALLBACK_PENDING ──error──> FALLBACK_BACKOFF
//!   │                    ^      │                    │
//!   │ watcher update     │      │ success            │ retry deadline
//!   v                    │      v                    │
//! WATCHING ──deadline────┘   WATCHING <──────────────┘ (via PENDING)
//! ```
//!
//! The transition decisions live in [`RenewalState`], which is synchronous
//! and clock-agnostic; [`RenewalScheduler`] wires it to channels and timers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::certificate::CertificateValue;
use crate::clock::{Clock, SystemClock};
use crate::config::{CertMonitorConfig, IdentityRequest};
use crate::fallback::{FallbackIssuer, FallbackOutcome, FallbackTask};
use crate::metrics::{CertificateSource, RenewalMetrics};
use crate::publisher::Publisher;
use crate::tokens::{StaticTokenStore, TokenStore};
use crate::watcher::WatchEvent;

/// Renewal phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Holding the initial certificate; the watcher has not confirmed anything yet
    Seeded,
    /// Trusting the cache watcher to deliver renewals
    Watching,
    /// A fallback issuance call is outstanding (or about to start)
    FallbackPending,
    /// Waiting out the retry interval after a failed issuance call
    FallbackBackoff,
    /// The scheduler has shut down
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seeded => "seeded",
            Self::Watching => "watching",
            Self::FallbackPending => "fallback_pending",
            Self::FallbackBackoff => "fallback_backoff",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a candidate certificate compares to the active one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Strictly newer and currently valid; should be published
    Accept,
    /// Same validity window as the active certificate
    Duplicate,
    /// Expires no later than the active certificate
    Outdated,
    /// Already past `not_after`
    Expired,
    /// `not_before` is still in the future
    NotYetValid,
}

impl Offer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Duplicate => "duplicate",
            Self::Outdated => "outdated",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
        }
    }
}

/// A fallback attempt the caller must now start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackStart {
    pub generation: u64,
    pub attempt: u32,
}

/// Renewal state and its transitions
#[derive(Debug)]
pub struct RenewalState {
    phase: Phase,
    active: Option<Arc<CertificateValue>>,
    last_update: Option<DateTime<Utc>>,
    next_wake: Option<DateTime<Utc>>,
    in_flight: Option<u64>,
    generation: u64,
    attempts: u32,
    leeway: Duration,
    retry: Duration,
}

impl RenewalState {
    /// Seeded with `initial`, or waiting on fallback issuance without one.
    pub fn new(initial: Option<Arc<CertificateValue>>, leeway: Duration, retry: Duration) -> Self {
        let (phase, next_wake) = match &initial {
            Some(initial) => (Phase::Seeded, Some(initial.renewal_deadline(leeway))),
            None => (Phase::FallbackPending, None),
        };

        Self {
            phase,
            active: initial,
            last_update: None,
            next_wake,
            in_flight: None,
            generation: 0,
            attempts: 0,
            leeway,
            retry,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn active(&self) -> Option<&Arc<CertificateValue>> {
        self.active.as_ref()
    }

    /// When the wake timer fires; `None` while an attempt is outstanding
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.next_wake
    }

    /// Generation of the outstanding fallback attempt
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Fallback attempts since the last accepted certificate
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last time the watcher delivered a certificate
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Compare a candidate against the active certificate.
    pub fn evaluate(&self, value: &CertificateValue, now: DateTime<Utc>) -> Offer {
        if value.is_expired_at(now) {
            return Offer::Expired;
        }
        if value.not_before() > now {
            return Offer::NotYetValid;
        }
        match &self.active {
            Some(active) if active.same_validity(value) => Offer::Duplicate,
            Some(active) if !value.is_newer_than(active) => Offer::Outdated,
            _ => Offer::Accept,
        }
    }

    /// Start a fallback attempt if one is due and none is outstanding.
    pub fn begin_fallback(&mut self, now: DateTime<Utc>) -> Option<FallbackStart> {
        if self.in_flight.is_some() {
            return None;
        }

        let due = match self.phase {
            Phase::FallbackPending => true,
            Phase::Seeded | Phase::Watching | Phase::FallbackBackoff => {
                self.next_wake.is_some_and(|wake| wake <= now)
            }
            Phase::Stopped => false,
        };
        if !due {
            return None;
        }

        self.generation += 1;
        self.attempts += 1;
        self.in_flight = Some(self.generation);
        self.phase = Phase::FallbackPending;
        self.next_wake = None;

        Some(FallbackStart {
            generation: self.generation,
            attempt: self.attempts,
        })
    }

    /// Mark the attempt `generation` as finished. Returns `false` if it is not
    /// the outstanding attempt, in which case its result must be ignored.
    pub fn complete_fallback(&mut self, generation: u64) -> bool {
        if self.in_flight != Some(generation) {
            return false;
        }
        self.in_flight = None;
        true
    }

    /// Record a successfully published certificate as active.
    ///
    /// Returns the generation of an outstanding fallback attempt, which the
    /// caller must cancel.
    pub fn accept(
        &mut self,
        value: Arc<CertificateValue>,
        source: CertificateSource,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        if source == CertificateSource::Watch {
            self.last_update = Some(now);
        }
        self.next_wake = Some(value.renewal_deadline(self.leeway));
        self.active = Some(value);
        self.phase = Phase::Watching;
        self.attempts = 0;
        self.in_flight.take()
    }

    /// The watcher re-delivered the active certificate, which proves it is
    /// healthy.
    pub fn confirm_watch(&mut self, now: DateTime<Utc>) {
        self.last_update = Some(now);
        if self.phase == Phase::Seeded {
            self.phase = Phase::Watching;
        }
    }

    /// The outstanding attempt failed; returns when the next one is due.
    pub fn fallback_failed(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retry = chrono::Duration::from_std(self.retry).unwrap_or(chrono::Duration::MAX);
        let retry_at = now.checked_add_signed(retry).unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.in_flight = None;
        self.phase = Phase::FallbackBackoff;
        self.next_wake = Some(retry_at);
        retry_at
    }

    /// Publishing a value from `source` failed; the active certificate stays.
    ///
    /// A watched or initial value re-arms fallback immediately rather than at
    /// the next deadline. An issued value counts as a failed attempt and waits
    /// out the retry interval like any other issuance failure.
    pub fn publish_failed(&mut self, source: CertificateSource, now: DateTime<Utc>) {
        if source == CertificateSource::Fallback {
            self.fallback_failed(now);
            return;
        }
        if self.in_flight.is_some() {
            return;
        }
        if self.phase == Phase::FallbackPending {
            self.phase = Phase::FallbackBackoff;
        }
        self.next_wake = Some(now);
    }

    /// The watcher went stale. Returns `true` if this pulled fallback forward.
    pub fn watch_stale(&mut self, now: DateTime<Utc>) -> bool {
        match self.phase {
            Phase::Seeded | Phase::Watching => {
                self.next_wake = Some(self.next_wake.map_or(now, |wake| wake.min(now)));
                true
            }
            _ => false,
        }
    }
}

/// Snapshot of the scheduler published after every transition
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub phase: Phase,
    pub active: Option<Arc<CertificateValue>>,
    pub next_wake: Option<DateTime<Utc>>,
    pub fallback_attempts: u32,
}

/// The renewal loop
pub struct RenewalScheduler {
    config: CertMonitorConfig,
    identity: Arc<IdentityRequest>,
    publisher: Publisher,
    issuer: Arc<dyn FallbackIssuer>,
    tokens: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    metrics: RenewalMetrics,
    events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
    status_tx: watch::Sender<MonitorStatus>,
}

impl RenewalScheduler {
    /// Create a scheduler.
    ///
    /// `config` should already be normalized; its initial certificate seeds
    /// the state when [`run`](Self::run) starts.
    pub fn new(
        config: CertMonitorConfig,
        publisher: Publisher,
        issuer: Arc<dyn FallbackIssuer>,
        metrics: RenewalMetrics,
        events: mpsc::Receiver<WatchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (status_tx, _) = watch::channel(MonitorStatus {
            phase: if config.initial.is_some() {
                Phase::Seeded
            } else {
                Phase::FallbackPending
            },
            active: config.initial.clone().map(Arc::new),
            next_wake: None,
            fallback_attempts: 0,
        });

        Self {
            identity: Arc::new(config.identity.clone()),
            config,
            publisher,
            issuer,
            tokens: Arc::new(StaticTokenStore::default()),
            clock: Arc::new(SystemClock),
            metrics,
            events,
            cancel,
            status_tx,
        }
    }

    /// Read issuance credentials from `tokens`
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Use `clock` for validity decisions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Subscribe to status snapshots
    pub fn status(&self) -> watch::Receiver<MonitorStatus> {
        self.status_tx.subscribe()
    }

    /// Run until the cancellation token fires.
    pub async fn run(mut self) {
        let mut state = RenewalState::new(
            self.config.initial.take().map(Arc::new),
            self.config.fallback_leeway,
            self.config.fallback_retry,
        );

        info!(
            fallback_leeway_secs = self.config.fallback_leeway.as_secs(),
            fallback_retry_secs = self.config.fallback_retry.as_secs(),
            node_name = %self.identity.node_name,
            datacenter = %self.identity.datacenter,
            phase = %state.phase(),
            "Starting certificate renewal scheduler"
        );

        self.publish_initial(&mut state);

        let (outcome_tx, mut outcome_rx) = mpsc::channel::<FallbackOutcome>(1);
        let mut in_flight: Option<FallbackTask> = None;
        let mut watching = true;

        loop {
            let now = self.clock.now();
            if let Some(start) = state.begin_fallback(now) {
                in_flight = Some(self.start_fallback(&state, start, now, outcome_tx.clone()));
            }
            self.report(&state, state.phase());

            let wake = state.next_wake().map(|wake| {
                let delay = (wake - now).to_std().unwrap_or(Duration::ZERO);
                Instant::now() + delay
            });

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    if let Some(task) = in_flight.take() {
                        info!(generation = task.generation(), "Cancelling outstanding fallback issuance");
                        task.cancel();
                    }
                    break;
                }

                event = self.events.recv(), if watching => match event {
                    Some(WatchEvent::Update(value)) => {
                        self.handle_update(&mut state, value, &mut in_flight);
                    }
                    Some(WatchEvent::Stale { disconnected_for }) => {
                        self.handle_stale(&mut state, disconnected_for);
                    }
                    None => {
                        warn!("Certificate cache watch ended, relying on fallback issuance");
                        watching = false;
                    }
                },

                Some(outcome) = outcome_rx.recv() => {
                    self.handle_outcome(&mut state, outcome, &mut in_flight);
                }

                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    trace!(phase = %state.phase(), "Renewal wake timer fired");
                }
            }
        }

        self.report(&state, Phase::Stopped);
        info!("Certificate renewal scheduler stopped");
    }

    fn publish_initial(&mut self, state: &mut RenewalState) {
        let Some(initial) = state.active().cloned() else {
            info!("No initial certificate, requesting one through fallback issuance");
            return;
        };

        let now = self.clock.now();
        if initial.is_expired_at(now) {
            error!(
                not_after = %initial.not_after(),
                expired_for_secs = -initial.expires_in(now).num_seconds(),
                "Initial certificate is already expired, requesting a new one"
            );
            self.metrics
                .record_rejected(CertificateSource::Initial, Offer::Expired.as_str());
            return;
        }

        match self.publisher.publish(&initial, now) {
            Ok(()) => {
                self.metrics
                    .record_publish(CertificateSource::Initial, initial.not_after().timestamp());
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                error!(error = %e, "Failed to publish initial certificate, re-arming fallback");
                state.publish_failed(CertificateSource::Initial, now);
            }
        }
    }

    fn handle_update(
        &mut self,
        state: &mut RenewalState,
        value: Arc<CertificateValue>,
        in_flight: &mut Option<FallbackTask>,
    ) {
        let now = self.clock.now();
        match state.evaluate(&value, now) {
            Offer::Accept => {
                debug!(not_after = %value.not_after(), "Certificate update from cache watch");
                self.accept(state, value, CertificateSource::Watch, now, in_flight);
            }
            Offer::Duplicate => {
                trace!(not_after = %value.not_after(), "Cache watch re-delivered active certificate");
                state.confirm_watch(now);
            }
            offer => {
                warn!(
                    reason = offer.as_str(),
                    not_before = %value.not_before(),
                    not_after = %value.not_after(),
                    "Ignoring certificate from cache watch"
                );
                self.metrics
                    .record_rejected(CertificateSource::Watch, offer.as_str());
            }
        }
    }

    fn handle_stale(&mut self, state: &mut RenewalState, disconnected_for: Duration) {
        self.metrics.record_stale_watch();
        if state.watch_stale(self.clock.now()) {
            warn!(
                disconnected_secs = disconnected_for.as_secs(),
                "Certificate cache watch is stale, falling back to explicit issuance"
            );
        } else {
            debug!(
                phase = %state.phase(),
                "Certificate cache watch is stale, fallback already engaged"
            );
        }
    }

    fn handle_outcome(
        &mut self,
        state: &mut RenewalState,
        outcome: FallbackOutcome,
        in_flight: &mut Option<FallbackTask>,
    ) {
        if !state.complete_fallback(outcome.generation) {
            debug!(generation = outcome.generation, "Ignoring result of superseded fallback issuance");
            return;
        }
        in_flight.take();

        let now = self.clock.now();
        let attempt = state.attempts();

        match outcome.result {
            Ok(value) => {
                let value = Arc::new(value);
                match state.evaluate(&value, now) {
                    Offer::Accept => {
                        info!(attempt, not_after = %value.not_after(), "Fallback issuance succeeded");
                        self.accept(state, value, CertificateSource::Fallback, now, in_flight);
                    }
                    offer => {
                        self.metrics
                            .record_rejected(CertificateSource::Fallback, offer.as_str());
                        self.fallback_failed(
                            state,
                            now,
                            format!("issued certificate rejected: {}", offer.as_str()),
                        );
                    }
                }
            }
            Err(e) => self.fallback_failed(state, now, e.to_string()),
        }
    }

    fn accept(
        &mut self,
        state: &mut RenewalState,
        value: Arc<CertificateValue>,
        source: CertificateSource,
        now: DateTime<Utc>,
        in_flight: &mut Option<FallbackTask>,
    ) {
        if let Err(e) = self.publisher.publish(&value, now) {
            self.metrics.record_publish_failure();
            error!(
                source = %source,
                error = %e,
                not_after = %value.not_after(),
                "Failed to publish certificate, keeping previous one"
            );
            if source == CertificateSource::Fallback {
                self.fallback_failed(state, now, format!("issued certificate not installed: {}", e));
            } else {
                state.publish_failed(source, now);
            }
            return;
        }

        self.metrics
            .record_publish(source, value.not_after().timestamp());

        if let Some(generation) = state.accept(Arc::clone(&value), source, now) {
            if let Some(task) = in_flight.take() {
                info!(generation, "Cancelling outstanding fallback issuance, superseded by newer certificate");
                task.cancel();
            }
        }

        debug!(
            source = %source,
            next_wake = ?state.next_wake(),
            "Certificate accepted"
        );
    }

    fn fallback_failed(&mut self, state: &mut RenewalState, now: DateTime<Utc>, reason: String) {
        self.metrics.record_fallback_failure();
        let attempt = state.attempts();
        let retry_at = state.fallback_failed(now);

        warn!(
            attempt,
            error = %reason,
            retry_in_secs = (retry_at - now).num_seconds(),
            "Fallback certificate issuance failed"
        );

        match state.active() {
            Some(active) if active.is_expired_at(now) => {
                error!(
                    attempt,
                    not_after = %active.not_after(),
                    expired_for_secs = -active.expires_in(now).num_seconds(),
                    "Serving an expired certificate, no fresher one could be obtained"
                );
            }
            Some(active) => {
                debug!(
                    expires_in_secs = active.expires_in(now).num_seconds(),
                    "Continuing to serve current certificate"
                );
            }
            None => {
                error!(attempt, "No certificate available, TLS identity cannot be served");
            }
        }
    }

    fn start_fallback(
        &self,
        state: &RenewalState,
        start: FallbackStart,
        now: DateTime<Utc>,
        outcomes: mpsc::Sender<FallbackOutcome>,
    ) -> FallbackTask {
        self.metrics.record_fallback_attempt();

        match state.active() {
            Some(active) => info!(
                attempt = start.attempt,
                expires_in_secs = active.expires_in(now).num_seconds(),
                "Requesting certificate through fallback issuance"
            ),
            None => info!(
                attempt = start.attempt,
                "Requesting certificate through fallback issuance"
            ),
        }

        FallbackTask::spawn(
            Arc::clone(&self.issuer),
            Arc::clone(&self.identity),
            Arc::clone(&self.tokens),
            self.cancel.child_token(),
            start.attempt,
            start.generation,
            outcomes,
        )
    }

    fn report(&self, state: &RenewalState, phase: Phase) {
        self.status_tx.send_replace(MonitorStatus {
            phase,
            active: state.active().cloned(),
            next_wake: state.next_wake(),
            fallback_attempts: state.attempts(),
        });
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("fallback_leeway", &self.config.fallback_leeway)
            .field("fallback_retry", &self.config.fallback_retry)
            .field("identity", &self.identity)
            .finish()
    }
}
