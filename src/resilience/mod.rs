//! Resilience: per-step timeout and retry policy for handler invocations
//!
//! What this module provides
//! - Cross-cutting Tower middleware and policies for handler failures
//!
//! Exports
//! - Models
//!   - `RetryPolicy { max_retries, backoff: Backoff }`
//!   - `ErrorClassifier` with the default `TransientFailures`
//! - Layers
//!   - `TimeoutLayer(Duration)` bounding a single handler invocation
//! - Utils
//!   - Backoff builders (fixed, exponential)
//!
//! Implementation strategy
//! - Timeout: wrap the handler future in `tokio::time::timeout`; elapsed time
//!   becomes `HandoffError::HandlerTimeout` boxed as the service error
//! - Retry: the orchestrator drives retries itself so every attempt is
//!   recorded in the audit trail; this module only decides *whether* and
//!   *when* to retry
//!
//! Composition
//! - `ServiceBuilder::new().layer(TimeoutLayer::new(dur)).service(handler)`
//!
//! Testing strategy
//! - Fake services that sleep past the deadline or fail in a scripted pattern

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::timeout;
use tower::{BoxError, Layer, Service};

use crate::config::RetryConfig;
use crate::error::HandoffError;
use crate::handoff::HandlerRequest;

// ===== Retry =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial: delay,
            factor: 1,
            max: delay,
        }
    }
    pub fn exponential(initial: Duration, factor: u32, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial,
            factor,
            max,
        }
    }
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let mult = self.factor.saturating_pow(attempt);
                self.initial.saturating_mul(mult).min(self.max)
            }
        }
    }
}

pub trait ErrorClassifier: Send + Sync + 'static {
    fn retryable(&self, error: &HandoffError) -> bool;
}

/// Retries handler errors and timeouts; everything else is final.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientFailures;

impl ErrorClassifier for TransientFailures {
    fn retryable(&self, error: &HandoffError) -> bool {
        matches!(
            error,
            HandoffError::HandlerTimeout { .. } | HandoffError::HandlerInvocation { .. }
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before retrying after the failure of attempt `attempt`
    /// (zero-based), or `None` when the failure is final.
    pub fn next_delay(
        &self,
        attempt: u32,
        error: &HandoffError,
        classifier: &dyn ErrorClassifier,
    ) -> Option<Duration> {
        if attempt >= self.max_retries || !classifier.retryable(error) {
            return None;
        }
        Some(self.backoff.delay_for_attempt(attempt))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        let initial = Duration::from_millis(cfg.backoff_ms);
        let backoff = if cfg.exponential {
            Backoff::exponential(initial, 2, initial.saturating_mul(16))
        } else {
            Backoff::fixed(initial)
        };
        Self {
            max_retries: cfg.max_retries,
            backoff,
        }
    }
}

// ===== Timeout =====

#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    dur: Duration,
}

impl TimeoutLayer {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

#[derive(Debug, Clone)]
pub struct Timeout<S> {
    inner: S,
    dur: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            dur: self.dur,
        }
    }
}

impl<S> Service<HandlerRequest> for Timeout<S>
where
    S: Service<HandlerRequest, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: HandlerRequest) -> Self::Future {
        let handler = req.handler.clone();
        let fut = self.inner.call(req);
        let dur = self.dur;
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err(Box::new(HandoffError::HandlerTimeout {
                    handler,
                    timeout_ms: dur.as_millis() as u64,
                }) as BoxError),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::handlers::handler_fn;
    use crate::registry::HandlerId;
    use crate::task::Task;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn request() -> HandlerRequest {
        let task = Task::with_id("t", "slow work");
        let context = Context::for_task(&task, 1024).unwrap();
        HandlerRequest {
            task,
            handler: HandlerId::from("slow"),
            context,
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn timeout_maps_to_handler_timeout() {
        let svc = handler_fn(|_req: HandlerRequest| async move {
            sleep(Duration::from_millis(200)).await;
            Ok::<_, BoxError>("late".to_string())
        });
        let svc = TimeoutLayer::new(Duration::from_millis(10)).layer(svc);
        let err = svc.oneshot(request()).await.unwrap_err();
        let err = HandoffError::from_boxed(err, &HandlerId::from("slow"));
        assert!(matches!(
            err,
            HandoffError::HandlerTimeout { ref handler, timeout_ms: 10 } if handler.as_str() == "slow"
        ));
    }

    #[tokio::test]
    async fn fast_handler_passes_through() {
        let svc = handler_fn(|_req: HandlerRequest| async move {
            Ok::<_, BoxError>("quick".to_string())
        });
        let svc = TimeoutLayer::new(Duration::from_millis(100)).layer(svc);
        assert_eq!(svc.oneshot(request()).await.unwrap(), "quick");
    }

    #[test]
    fn retry_policy_allows_one_retry_for_transient_errors() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        let timeout = HandoffError::HandlerTimeout {
            handler: HandlerId::from("x"),
            timeout_ms: 1,
        };
        assert_eq!(
            policy.next_delay(0, &timeout, &TransientFailures),
            Some(Duration::from_millis(50))
        );
        assert_eq!(policy.next_delay(1, &timeout, &TransientFailures), None);

        let malformed = HandoffError::MalformedHandoff {
            handler: HandlerId::from("x"),
            message: "prose".into(),
        };
        assert_eq!(policy.next_delay(0, &malformed, &TransientFailures), None);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let b = Backoff::exponential(Duration::from_millis(10), 2, Duration::from_millis(50));
        assert_eq!(b.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(40));
        assert_eq!(b.delay_for_attempt(5), Duration::from_millis(50));
        // large attempt counts saturate instead of overflowing
        assert_eq!(b.delay_for_attempt(64), Duration::from_millis(50));
    }
}
