//! Cache watcher
//!
//! Subscribes to the caching layer for the agent's certificate and turns its
//! notifications into a linear stream of [`WatchEvent`]s for the renewal
//! scheduler.
//!
//! Transient disconnections are handled here: the watcher re-subscribes after
//! a short delay without telling the consumer. Only a disconnection lasting
//! longer than the stale threshold (the fallback leeway) is surfaced, once per
//! episode, as [`WatchEvent::Stale`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::certificate::CertificateValue;
use crate::error::WatchError;

/// Default delay between subscription attempts
const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Buffered events between the watcher task and the scheduler
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// One notification from the caching layer
pub type CacheUpdate = Result<CertificateValue, WatchError>;

/// The caching layer that keeps the agent certificate fresh through normal
/// issuance protocols.
#[async_trait]
pub trait CertificateCache: Send + Sync + 'static {
    /// Seed the cache with a certificate the agent already holds, so the
    /// first notification of a new subscription is that certificate.
    async fn prepopulate(&self, _value: &CertificateValue) -> Result<(), WatchError> {
        Ok(())
    }

    /// Open a subscription for the agent certificate.
    ///
    /// Updates must be yielded in the order the cache produced them. The
    /// receiver closing means the subscription was lost.
    async fn subscribe(&self) -> Result<mpsc::Receiver<CacheUpdate>, WatchError>;
}

/// Event surfaced to the renewal scheduler
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The cache produced a certificate (possibly identical to a previous one)
    Update(Arc<CertificateValue>),
    /// The cache has been unreachable for longer than the stale threshold
    Stale { disconnected_for: Duration },
}

/// Watches a [`CertificateCache`] and re-subscribes across disconnections
pub struct CacheWatcher {
    cache: Arc<dyn CertificateCache>,
    stale_after: Duration,
    resubscribe_delay: Duration,
}

impl CacheWatcher {
    /// Create a watcher that reports staleness after `stale_after` without
    /// a live subscription.
    pub fn new(cache: Arc<dyn CertificateCache>, stale_after: Duration) -> Self {
        Self {
            cache,
            stale_after,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Set the delay between subscription attempts
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Seed the cache with `initial` (if any) and start watching.
    ///
    /// The watch runs in its own task until `cancel` fires or the returned
    /// receiver is dropped.
    pub async fn start(
        self,
        initial: Option<&CertificateValue>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<WatchEvent> {
        if let Some(initial) = initial {
            match self.cache.prepopulate(initial).await {
                Ok(()) => debug!(
                    not_after = %initial.not_after(),
                    "Prepopulated cache with initial certificate"
                ),
                Err(e) => warn!(error = %e, "Failed to prepopulate cache with initial certificate"),
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx, cancel));
        rx
    }

    async fn run(self, tx: mpsc::Sender<WatchEvent>, cancel: CancellationToken) {
        info!(
            stale_after_secs = self.stale_after.as_secs(),
            "Starting certificate cache watch"
        );

        let mut episode = Disconnection::new(Instant::now());

        loop {
            let subscribe = self.cache.subscribe();
            tokio::pin!(subscribe);

            let subscription = loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Certificate cache watch cancelled");
                        return;
                    }
                    result = &mut subscribe => break result,
                    _ = sleep_until(episode.stale_at(self.stale_after)), if !episode.reported => {
                        if !episode.report(&tx).await {
                            return;
                        }
                    }
                }
            };

            match subscription {
                Ok(updates) => {
                    if episode.reported {
                        info!("Certificate cache watch recovered");
                    } else {
                        debug!("Subscribed to certificate cache");
                    }

                    if !self.forward(updates, &tx, &cancel).await {
                        return;
                    }

                    debug!("Certificate cache subscription closed, re-subscribing");
                    episode = Disconnection::new(Instant::now());
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = self.resubscribe_delay.as_millis(),
                        "Failed to subscribe to certificate cache"
                    );
                }
            }

            let resubscribe = sleep(self.resubscribe_delay);
            tokio::pin!(resubscribe);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Certificate cache watch cancelled");
                        return;
                    }
                    _ = &mut resubscribe => break,
                    _ = sleep_until(episode.stale_at(self.stale_after)), if !episode.reported => {
                        if !episode.report(&tx).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Forward updates from one subscription until it closes.
    ///
    /// Returns `false` when the watch should stop entirely.
    async fn forward(
        &self,
        mut updates: mpsc::Receiver<CacheUpdate>,
        tx: &mpsc::Sender<WatchEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Certificate cache watch cancelled");
                    return false;
                }
                update = updates.recv() => match update {
                    Some(Ok(value)) => {
                        trace!(not_after = %value.not_after(), "Certificate cache update");
                        if tx.send(WatchEvent::Update(Arc::new(value))).await.is_err() {
                            debug!("Watch consumer dropped, stopping cache watch");
                            return false;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Certificate cache reported an error");
                    }
                    None => return true,
                }
            }
        }
    }
}

impl std::fmt::Debug for CacheWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWatcher")
            .field("stale_after", &self.stale_after)
            .field("resubscribe_delay", &self.resubscribe_delay)
            .finish()
    }
}

/// A stretch of time without a live subscription
struct Disconnection {
    since: Instant,
    reported: bool,
}

impl Disconnection {
    fn new(since: Instant) -> Self {
        Self {
            since,
            reported: false,
        }
    }

    fn stale_at(&self, stale_after: Duration) -> Instant {
        self.since + stale_after
    }

    /// Emit a stale event. Returns `false` if the consumer is gone.
    async fn report(&mut self, tx: &mpsc::Sender<WatchEvent>) -> bool {
        self.reported = true;
        let disconnected_for = self.since.elapsed();
        warn!(
            disconnected_secs = disconnected_for.as_secs(),
            "Certificate cache watch is stale"
        );
        tx.send(WatchEvent::Stale { disconnected_for }).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::value_with_window;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Cache whose subscriptions are handed out from a script; an exhausted
    /// script behaves as an unreachable cache.
    #[derive(Default)]
    struct ScriptedCache {
        subscriptions: Mutex<VecDeque<mpsc::Receiver<CacheUpdate>>>,
        prepopulated: Mutex<Vec<CertificateValue>>,
        subscribe_calls: Mutex<u32>,
    }

    impl ScriptedCache {
        fn push_subscription(&self) -> mpsc::Sender<CacheUpdate> {
            let (tx, rx) = mpsc::channel(8);
            self.subscriptions.lock().push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl CertificateCache for ScriptedCache {
        async fn prepopulate(&self, value: &CertificateValue) -> Result<(), WatchError> {
            self.prepopulated.lock().push(value.clone());
            Ok(())
        }

        async fn subscribe(&self) -> Result<mpsc::Receiver<CacheUpdate>, WatchError> {
            *self.subscribe_calls.lock() += 1;
            self.subscriptions
                .lock()
                .pop_front()
                .ok_or_else(|| WatchError::Subscribe("cache unavailable".to_string()))
        }
    }

    fn expect_update(event: Option<WatchEvent>) -> Arc<CertificateValue> {
        match event {
            Some(WatchEvent::Update(value)) => value,
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_updates_in_order() {
        let cache = Arc::new(ScriptedCache::default());
        let feed = cache.push_subscription();
        let now = Utc::now();

        let mut events = CacheWatcher::new(cache.clone(), Duration::from_secs(10))
            .start(None, CancellationToken::new())
            .await;

        feed.send(Ok(value_with_window(now, 100))).await.unwrap();
        feed.send(Ok(value_with_window(now, 200))).await.unwrap();

        let first = expect_update(events.recv().await);
        let second = expect_update(events.recv().await);
        assert_eq!(first.expires_in(now).num_seconds(), 100);
        assert_eq!(second.expires_in(now).num_seconds(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_errors_are_not_forwarded() {
        let cache = Arc::new(ScriptedCache::default());
        let feed = cache.push_subscription();
        let now = Utc::now();

        let mut events = CacheWatcher::new(cache.clone(), Duration::from_secs(10))
            .start(None, CancellationToken::new())
            .await;

        feed.send(Err(WatchError::Fetch("rpc error".to_string())))
            .await
            .unwrap();
        feed.send(Ok(value_with_window(now, 100))).await.unwrap();

        let update = expect_update(events.recv().await);
        assert_eq!(update.expires_in(now).num_seconds(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_without_reporting_stale() {
        let cache = Arc::new(ScriptedCache::default());
        let first = cache.push_subscription();
        let second = cache.push_subscription();
        let now = Utc::now();

        let mut events = CacheWatcher::new(cache.clone(), Duration::from_secs(10))
            .with_resubscribe_delay(Duration::from_millis(500))
            .start(None, CancellationToken::new())
            .await;

        drop(first);
        second.send(Ok(value_with_window(now, 300))).await.unwrap();

        let update = expect_update(events.recv().await);
        assert_eq!(update.expires_in(now).num_seconds(), 300);
        assert_eq!(*cache.subscribe_calls.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_stale_once_per_episode() {
        let cache = Arc::new(ScriptedCache::default());
        let start = Instant::now();

        let mut events = CacheWatcher::new(cache.clone(), Duration::from_secs(10))
            .start(None, CancellationToken::new())
            .await;

        match events.recv().await {
            Some(WatchEvent::Stale { disconnected_for }) => {
                assert!(disconnected_for >= Duration::from_secs(10));
                assert!(start.elapsed() < Duration::from_secs(12));
            }
            other => panic!("expected stale event, got {:?}", other),
        }

        // Still unreachable: no second report for the same episode.
        let next = tokio::time::timeout(Duration::from_secs(60), events.recv()).await;
        assert!(next.is_err());
        assert!(*cache.subscribe_calls.lock() > 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepopulates_initial_value() {
        let cache = Arc::new(ScriptedCache::default());
        let _feed = cache.push_subscription();
        let initial = value_with_window(Utc::now(), 3600);

        let _events = CacheWatcher::new(cache.clone(), Duration::from_secs(10))
            .start(Some(&initial), CancellationToken::new())
            .await;

        let prepopulated = cache.prepopulated.lock();
        assert_eq!(prepopulated.len(), 1);
        assert!(prepopulated[0].same_validity(&initial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_watch() {
        let cache = Arc::new(ScriptedCache::default());
        let _feed = cache.push_subscription();
        let cancel = CancellationToken::new();

        let mut events = CacheWatcher::new(cache.clone(), Duration::from_secs(10))
            .start(None, cancel.clone())
            .await;

        cancel.cancel();
        assert!(events.recv().await.is_none());
    }
}
