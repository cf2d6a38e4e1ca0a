use log::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::error::OrchestratorError;
use crate::models::RetrySettings;

/// Fraction by which a jittered delay may deviate from the computed delay
const JITTER_FACTOR: f64 = 0.15;

pub type RetryableCheck = Arc<dyn Fn(&OrchestratorError) -> bool + Send + Sync>;

/// Outcome diagnostics of a retried operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryResult {
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Bounded exponential backoff with jitter
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Decides whether an error is worth another attempt. Context errors are
    /// never retried regardless of this check.
    pub retryable: RetryableCheck,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retryable: Arc::new(|_| true),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    pub fn with_retryable<F>(mut self, check: F) -> Self
    where
        F: Fn(&OrchestratorError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(check);
        self
    }

    /// Un-jittered delay before retry number `attempt` (0-indexed):
    /// `min(initial_delay * multiplier^attempt, max_delay)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Delay before retry number `attempt`, jittered within ±15% when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_FACTOR)..=(1.0 + JITTER_FACTOR));
        delay.mul_f64(factor)
    }

    fn is_retryable(&self, err: &OrchestratorError) -> bool {
        !err.is_context_error() && (self.retryable)(err)
    }

    /// Runs `operation` up to `max_retries + 1` times
    ///
    /// # Returns
    ///
    /// The operation's result together with the attempt diagnostics. A
    /// non-retryable error is returned as is, exhaustion wraps the last error
    /// in [OrchestratorError::RetriesExhausted], and a finished context returns
    /// the context's error.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &Context,
        mut operation: F,
    ) -> (Result<T, OrchestratorError>, RetryResult)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let mut result = RetryResult::default();
        let mut attempt = 0;

        loop {
            if let Some(err) = ctx.err() {
                return (Err(err), result);
            }

            result.attempts += 1;
            let err = match operation().await {
                Ok(value) => return (Ok(value), result),
                Err(err) => err,
            };
            result.last_error = Some(err.to_string());

            if !self.is_retryable(&err) {
                debug!("Not retrying after attempt {}: {err}", result.attempts);
                return (Err(err), result);
            }
            if attempt >= self.max_retries {
                warn!("Giving up after {} attempts: {err}", result.attempts);
                return (
                    Err(OrchestratorError::RetriesExhausted {
                        attempts: result.attempts,
                        source: Box::new(err),
                    }),
                    result,
                );
            }

            let delay = self.delay_for_attempt(attempt);
            debug!(
                "Attempt {} failed, retrying in {:?}: {err}",
                result.attempts, delay
            );
            // The deadline may be closer than the backoff, done() covers both
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.done() => {
                    let err = ctx.err().unwrap_or(OrchestratorError::Cancelled);
                    return (Err(err), result);
                }
            }
            attempt += 1;
        }
    }

    /// Like [RetryPolicy::execute] without the diagnostics
    pub async fn run<T, F, Fut>(&self, ctx: &Context, operation: F) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        self.execute(ctx, operation).await.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..Default::default()
        }
    }

    fn outage() -> OrchestratorError {
        OrchestratorError::provider("stripe", "charge", ProviderError::unavailable("503"))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert!(policy.jitter);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        let delays: Vec<u128> = (0..5)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            jitter: false,
            max_delay: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt).as_secs_f64();
                assert!(delay >= base * 0.85 - 1e-9, "{delay} below {base}");
                assert!(delay <= base * 1.15 + 1e-9, "{delay} above {base}");
            }
        }
    }

    #[tokio::test]
    async fn test_always_failing_runs_max_retries_plus_one() {
        let calls = AtomicU32::new(0);
        let (result, stats) = fast_policy(3)
            .execute(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(outage())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(stats.attempts, 4);
        assert!(stats.last_error.is_some());
        match result {
            Err(OrchestratorError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, OrchestratorError::Provider { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let (result, stats) = fast_policy(3)
            .execute(&Context::background(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(outage())
                } else {
                    Ok("charged")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "charged");
        assert_eq!(stats.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(5).with_retryable(OrchestratorError::is_transient);
        let (result, stats) = policy
            .execute(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(OrchestratorError::Validation("bad amount".to_string()))
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
        assert_eq!(stats.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_attempt() {
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();
        let (result, stats) = fast_policy(3)
            .execute(&ctx, || async { Ok::<_, OrchestratorError>(()) })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(stats.attempts, 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            jitter: false,
            ..Default::default()
        };
        let (ctx, handle) = Context::background().with_cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let (result, stats) = policy
            .execute(&ctx, || async { Err::<(), _>(outage()) })
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(stats.attempts, 1);
    }

    #[tokio::test]
    async fn test_deadline_shorter_than_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            jitter: false,
            ..Default::default()
        };
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let result = policy.run(&ctx, || async { Err::<(), _>(outage()) }).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(result, Err(OrchestratorError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_context_error_from_operation_not_retried() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run(&Context::background(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(OrchestratorError::DeadlineExceeded)
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::DeadlineExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
