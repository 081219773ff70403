//! Activity execution
//!
//! Every collaborator call goes through [`run_activity`]: a retrying
//! executor that races the activity against cancellation, a start-to-close
//! deadline, and a heartbeat watchdog. Retry budgets follow
//! [`RetryPolicy`]; transient failures back off exponentially, and
//! non-retryable failures abort the attempt loop immediately.
//!
//! Long-running activities receive a [`Heartbeat`] handle through
//! [`ActivityContext`] and are expected to tick it inside their inner
//! loops; a stale heartbeat fails the attempt so the retry loop can
//! reschedule the work.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::context::FlowContext;
use crate::error::{FlowError, Result};

/// Exponential backoff budget for one activity.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// 0 means unlimited attempts.
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(3600),
            maximum_attempts: 0,
        }
    }
}

impl RetryPolicy {
    /// Partition-work profile: tighter interval cap, unlimited attempts.
    pub fn partition() -> Self {
        Self {
            maximum_interval: Duration::from_secs(600),
            ..Default::default()
        }
    }

    /// Bounded profile for child workflows and slot setup.
    pub fn bounded(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    /// Delay before the attempt after `attempt` failures.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exp);
        if !secs.is_finite() || secs >= self.maximum_interval.as_secs_f64() {
            self.maximum_interval
        } else {
            Duration::from_secs_f64(secs).min(self.maximum_interval)
        }
    }
}

/// Execution budget for one activity invocation.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// Per-attempt deadline; `None` is effectively unbounded.
    pub start_to_close: Option<Duration>,
    /// Maximum silence between heartbeats before the attempt fails.
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    pub fn new(start_to_close: Duration) -> Self {
        Self {
            start_to_close: Some(start_to_close),
            heartbeat_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// No start-to-close deadline (multi-day and keep-alive activities).
    pub fn unbounded() -> Self {
        Self {
            start_to_close: None,
            heartbeat_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Liveness handle held by a running activity.
#[derive(Clone)]
pub struct Heartbeat {
    last_beat_ms: Arc<AtomicI64>,
}

impl Heartbeat {
    pub fn new() -> Self {
        let hb = Self {
            last_beat_ms: Arc::new(AtomicI64::new(0)),
        };
        hb.tick();
        hb
    }

    /// Record liveness.
    pub fn tick(&self) {
        self.last_beat_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the last tick.
    pub fn elapsed(&self) -> Duration {
        let last = self.last_beat_ms.load(Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(last).max(0) as u64)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-invocation context handed to an activity implementation.
#[derive(Clone)]
pub struct ActivityContext {
    pub heartbeat: Heartbeat,
}

impl ActivityContext {
    pub fn new() -> Self {
        Self {
            heartbeat: Heartbeat::new(),
        }
    }
}

impl Default for ActivityContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Run an activity under `options`, retrying per its policy.
///
/// The closure is invoked once per attempt with a fresh [`ActivityContext`].
/// Returns the activity result, the last error once a bounded budget is
/// exhausted, or [`FlowError::Cancelled`] as soon as `ctx` is cancelled.
pub async fn run_activity<T, F, Fut>(
    ctx: &FlowContext,
    name: &str,
    options: &ActivityOptions,
    mut call: F,
) -> Result<T>
where
    F: FnMut(ActivityContext) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        ctx.check_cancelled()?;

        match run_attempt(ctx, name, options, &mut call).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(activity = name, attempt, "activity succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) if !e.is_retriable() => {
                warn!(activity = name, attempt, "activity failed permanently: {e}");
                return Err(e);
            }
            Err(e) => {
                if options.retry.maximum_attempts > 0 && attempt >= options.retry.maximum_attempts {
                    return Err(FlowError::ActivityExhausted {
                        activity: name.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                let delay = options.retry.backoff(attempt);
                warn!(activity = name, attempt, delay_ms = delay.as_millis() as u64,
                    "activity failed, backing off: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancelled() => return Err(FlowError::Cancelled),
                }
            }
        }
    }
}

async fn run_attempt<T, F, Fut>(
    ctx: &FlowContext,
    name: &str,
    options: &ActivityOptions,
    call: &mut F,
) -> Result<T>
where
    F: FnMut(ActivityContext) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let actx = ActivityContext::new();
    let heartbeat = actx.heartbeat.clone();

    let fut = call(actx);
    tokio::pin!(fut);

    let deadline = async {
        match options.start_to_close {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    let watchdog = async {
        match options.heartbeat_timeout {
            Some(timeout) => loop {
                tokio::time::sleep(timeout / 2).await;
                if heartbeat.elapsed() > timeout {
                    break;
                }
            },
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = &mut fut => result,
        () = deadline => Err(FlowError::transient(format!(
            "activity {name} exceeded start-to-close timeout"
        ))),
        () = watchdog => Err(FlowError::transient(format!(
            "activity {name} missed its heartbeat"
        ))),
        () = ctx.cancelled() => Err(FlowError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(10),
            maximum_attempts: max_attempts,
        }
    }

    #[test]
    fn test_backoff_progression_and_cap() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(600),
            maximum_attempts: 0,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
        assert_eq!(policy.backoff(5), Duration::from_secs(600));
        assert_eq!(policy.backoff(60), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::new(Duration::from_secs(1));
        let out: i32 = run_activity(&ctx, "echo", &opts, |_actx| async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::new(Duration::from_secs(1)).with_retry(fast_retry(0));
        let calls = AtomicU32::new(0);

        let out = run_activity(&ctx, "flaky", &opts, |_actx| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FlowError::transient("connection reset"))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::new(Duration::from_secs(1)).with_retry(fast_retry(0));
        let calls = AtomicU32::new(0);

        let err = run_activity::<(), _, _>(&ctx, "denied", &opts, |_actx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FlowError::non_retryable("permission denied")) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::NonRetryable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_budget_surfaces_last_error() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::new(Duration::from_secs(1)).with_retry(fast_retry(3));

        let err = run_activity::<(), _, _>(&ctx, "always-failing", &opts, |_actx| async {
            Err(FlowError::transient("rate limited"))
        })
        .await
        .unwrap_err();

        match err {
            FlowError::ActivityExhausted { attempts, ref last_error, .. } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("rate limited"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_start_to_close_timeout_retries() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::new(Duration::from_millis(20)).with_retry(fast_retry(2));

        let err = run_activity::<(), _, _>(&ctx, "stuck", &opts, |_actx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_heartbeat_watchdog_fails_silent_activity() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::unbounded()
            .with_heartbeat(Duration::from_millis(30))
            .with_retry(fast_retry(1));

        let err = run_activity::<(), _, _>(&ctx, "silent", &opts, |_actx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        match err {
            FlowError::ActivityExhausted { ref last_error, .. } => {
                assert!(last_error.contains("heartbeat"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeating_activity_stays_alive() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::unbounded().with_heartbeat(Duration::from_millis(50));

        run_activity(&ctx, "beating", &opts, |actx| async move {
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                actx.heartbeat.tick();
            }
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_activity() {
        let ctx = FlowContext::new("test");
        let opts = ActivityOptions::unbounded();

        let cancel_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_ctx.cancel();
        });

        let err = run_activity::<(), _, _>(&ctx, "long", &opts, |_actx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(err.is_cancellation());
    }
}
