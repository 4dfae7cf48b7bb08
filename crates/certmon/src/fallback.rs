//! Fallback issuance
//!
//! When the cache watch does not deliver a fresh certificate in time, the
//! scheduler requests one explicitly through a [`FallbackIssuer`]. Each
//! attempt runs in its own task under its own cancellation token so a watcher
//! update or shutdown can preempt it. Retrying is the scheduler's job: it
//! waits a fixed interval after each failure and never gives up.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::certificate::CertificateValue;
use crate::config::IdentityRequest;
use crate::error::IssueError;
use crate::tokens::TokenStore;

/// Per-attempt context handed to the issuer
#[derive(Debug, Clone)]
pub struct IssueContext {
    cancel: CancellationToken,
    attempt: u32,
    token: Option<String>,
}

impl IssueContext {
    pub fn new(cancel: CancellationToken, attempt: u32, token: Option<String>) -> Self {
        Self {
            cancel,
            attempt,
            token,
        }
    }

    /// Cancellation for this attempt; fires on preemption or shutdown
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 1-based attempt number since the last accepted certificate
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Agent token read from the token store when the attempt started
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// Explicit certificate issuance used when passive renewal falls behind
#[async_trait]
pub trait FallbackIssuer: Send + Sync + 'static {
    async fn issue(
        &self,
        ctx: &IssueContext,
        request: &IdentityRequest,
    ) -> Result<CertificateValue, IssueError>;
}

/// Adapts an async function into a [`FallbackIssuer`]
pub struct FnIssuer<F>(F);

impl<F> FnIssuer<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> FallbackIssuer for FnIssuer<F>
where
    F: Fn(IssueContext, IdentityRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CertificateValue, IssueError>> + Send,
{
    async fn issue(
        &self,
        ctx: &IssueContext,
        request: &IdentityRequest,
    ) -> Result<CertificateValue, IssueError> {
        (self.0)(ctx.clone(), request.clone()).await
    }
}

/// Result of one attempt, tagged with the generation that started it
#[derive(Debug)]
pub(crate) struct FallbackOutcome {
    pub generation: u64,
    pub result: Result<CertificateValue, IssueError>,
}

/// Handle to the single in-flight issuance attempt
#[derive(Debug)]
pub(crate) struct FallbackTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FallbackTask {
    /// Spawn one issuance attempt. The agent token is read from `tokens`
    /// inside the task, off the caller's thread. The outcome is sent on
    /// `outcomes` unless the attempt is cancelled first.
    pub fn spawn(
        issuer: Arc<dyn FallbackIssuer>,
        request: Arc<IdentityRequest>,
        tokens: Arc<dyn TokenStore>,
        cancel: CancellationToken,
        attempt: u32,
        generation: u64,
        outcomes: mpsc::Sender<FallbackOutcome>,
    ) -> Self {
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            trace!(generation, attempt, "Fallback issuance started");

            let issue = async {
                let token = read_token(tokens).await;
                let ctx = IssueContext::new(task_cancel.clone(), attempt, token);
                issuer.issue(&ctx, &request).await
            };

            let result = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(IssueError::Cancelled),
                result = issue => result,
            };

            if task_cancel.is_cancelled() {
                debug!(generation, "Discarding result of cancelled fallback issuance");
                return;
            }

            // The scheduler may have shut down in the meantime.
            let _ = outcomes.send(FallbackOutcome { generation, result }).await;
        });

        Self {
            generation,
            cancel,
            handle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel the attempt; any result it produces is dropped.
    pub fn cancel(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Token stores may touch the filesystem, so read them on the blocking pool.
async fn read_token(tokens: Arc<dyn TokenStore>) -> Option<String> {
    match tokio::task::spawn_blocking(move || tokens.agent_token()).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "Reading agent token failed, issuing without one");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::value_with_window;
    use crate::tokens::{FileTokenStore, StaticTokenStore};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn request() -> Arc<IdentityRequest> {
        Arc::new(IdentityRequest {
            dns_sans: vec!["node-1.example".to_string()],
            node_name: "node-1".to_string(),
            datacenter: "dc1".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_fn_issuer_receives_context_and_request() {
        let issuer = FnIssuer::new(|ctx: IssueContext, request: IdentityRequest| async move {
            assert_eq!(ctx.attempt(), 3);
            assert_eq!(ctx.token(), Some("agent-token"));
            assert_eq!(request.node_name, "node-1");
            Ok::<_, IssueError>(value_with_window(Utc::now(), 60))
        });

        let ctx = IssueContext::new(CancellationToken::new(), 3, Some("agent-token".to_string()));
        let value = issuer.issue(&ctx, &request()).await.unwrap();
        assert!(value.expires_in(Utc::now()).num_seconds() <= 60);
    }

    #[tokio::test]
    async fn test_task_delivers_outcome_with_generation() {
        let issuer: Arc<dyn FallbackIssuer> = Arc::new(FnIssuer::new(
            |_ctx: IssueContext, _request: IdentityRequest| async move {
                Err::<CertificateValue, _>(IssueError::Backend("no leader".to_string()))
            },
        ));
        let (tx, mut rx) = mpsc::channel(1);

        let task = FallbackTask::spawn(
            issuer,
            request(),
            Arc::new(StaticTokenStore::default()),
            CancellationToken::new(),
            1,
            7,
            tx,
        );
        assert_eq!(task.generation(), 7);

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.generation, 7);
        assert!(matches!(outcome.result, Err(IssueError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_delivers_nothing() {
        let issuer: Arc<dyn FallbackIssuer> = Arc::new(FnIssuer::new(
            |ctx: IssueContext, _request: IdentityRequest| async move {
                ctx.cancellation().cancelled().await;
                Ok::<_, IssueError>(value_with_window(Utc::now(), 60))
            },
        ));
        let (tx, mut rx) = mpsc::channel(1);

        let task = FallbackTask::spawn(
            issuer,
            request(),
            Arc::new(StaticTokenStore::default()),
            CancellationToken::new(),
            1,
            1,
            tx,
        );
        task.cancel();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(received, Ok(None)));
    }

    #[tokio::test]
    async fn test_task_reads_token_when_attempt_runs() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "rotated-token\n").unwrap();

        let issuer: Arc<dyn FallbackIssuer> = Arc::new(FnIssuer::new(
            |ctx: IssueContext, _request: IdentityRequest| async move {
                assert_eq!(ctx.attempt(), 2);
                assert_eq!(ctx.token(), Some("rotated-token"));
                Err::<CertificateValue, _>(IssueError::Backend("no leader".to_string()))
            },
        ));
        let (tx, mut rx) = mpsc::channel(1);

        FallbackTask::spawn(
            issuer,
            request(),
            Arc::new(FileTokenStore::new(file.path())),
            CancellationToken::new(),
            2,
            3,
            tx,
        );

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.generation, 3);
        assert!(matches!(outcome.result, Err(IssueError::Backend(_))));
    }
}
