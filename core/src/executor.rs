//! Operation executor: retry/backoff, per-attempt timeout, and cooperative
//! cancellation for a single asynchronous unit of work.
//!
//! The executor is a pure control-flow layer: it has no side effects beyond
//! the wrapped function's own. It is the only layer in the core that retries;
//! callers above it observe the final outcome.

use crate::error::{Result, SyncError};
use crate::{now_millis, Timestamp};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Idle,
    Pending,
    Success,
    Error,
    Cancelled,
    Retrying,
}

/// Observable state of an operation.
///
/// Created on `execute()`; transitions are driven only by the executor.
/// Terminal states are success/error/cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationState<T> {
    pub status: OpStatus,
    pub data: Option<T>,
    pub error: Option<SyncError>,
    /// Coarse progress, 0-100
    pub progress: u8,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    /// 1-based attempt counter for the current execution
    pub current_attempt: u32,
    /// Errors from every failed attempt, in order
    pub previous_errors: Vec<SyncError>,
}

impl<T> Default for OperationState<T> {
    fn default() -> Self {
        Self {
            status: OpStatus::Idle,
            data: None,
            error: None,
            progress: 0,
            started_at: None,
            ended_at: None,
            current_attempt: 0,
            previous_errors: Vec::new(),
        }
    }
}

impl<T> OperationState<T> {
    /// Whether the operation has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OpStatus::Success | OpStatus::Error | OpStatus::Cancelled
        )
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Retry schedule: exponential backoff bounded by a maximum delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempt cap (including the first attempt)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied per subsequent attempt
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given (1-based) failed attempt:
    /// `min(base_delay * backoff_multiplier^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

struct TokenShared {
    reason: Mutex<Option<String>>,
    flag: watch::Sender<bool>,
}

/// Cooperative cancellation token.
///
/// Owned by the executor instance that created it and never shared across
/// concurrent operations. `cancelled()` resolves exactly once, at the first
/// `cancel()` call; later calls are ignored.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<TokenShared>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            shared: Arc::new(TokenShared {
                reason: Mutex::new(None),
                flag,
            }),
        }
    }

    /// Request cancellation. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.shared.reason.lock().unwrap();
        if guard.is_none() {
            *guard = Some(reason.into());
            drop(guard);
            self.shared.flag.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.flag.borrow()
    }

    pub fn reason(&self) -> Option<String> {
        self.shared.reason.lock().unwrap().clone()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.shared.flag.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    fn to_error(&self) -> SyncError {
        SyncError::Cancelled {
            reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("is_cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

type ShouldRetryFn = dyn Fn(&SyncError, u32) -> bool + Send + Sync;
type RetryHook = dyn Fn(&SyncError, u32) + Send + Sync;
type TimeoutHook = dyn Fn(u32) + Send + Sync;
type ProgressHook = dyn Fn(u8) + Send + Sync;

/// Executor configuration.
#[derive(Clone)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    /// Per-attempt timeout; expiry cancels the attempt and is retried like
    /// any transient error
    pub timeout: Option<Duration>,
    /// Reset state to idle this long after a success
    pub auto_reset: Option<Duration>,
    /// Gate for the progress hook
    pub track_progress: bool,
    /// Additional retry veto consulted after the built-in classification
    pub should_retry: Option<Arc<ShouldRetryFn>>,
    pub on_retry: Option<Arc<RetryHook>>,
    pub on_timeout: Option<Arc<TimeoutHook>>,
    pub on_progress: Option<Arc<ProgressHook>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: None,
            auto_reset: None,
            track_progress: false,
            should_retry: None,
            on_retry: None,
            on_timeout: None,
            on_progress: None,
        }
    }
}

type OpFn<A, T> = dyn Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync;

struct ExecInner<T> {
    state: watch::Sender<OperationState<T>>,
    /// Bumped on every execute()/reset(); stale auto-reset timers check it
    generation: AtomicU64,
}

/// Runs a single asynchronous unit of work with timeout, cancellation, and
/// retry/backoff.
///
/// Cancellation is cooperative: the cancel flag is checked immediately after
/// each awaited call returns and before each backoff sleep. An in-flight
/// remote effect is never unwound - a write already issued still completes
/// remotely even if the local caller cancelled.
pub struct Executor<A, T> {
    op: Arc<OpFn<A, T>>,
    config: ExecutorConfig,
    inner: Arc<ExecInner<T>>,
    last_args: Mutex<Option<A>>,
    token: Mutex<Option<CancellationToken>>,
}

impl<A, T> Executor<A, T>
where
    A: Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Wrap an async function with the given configuration.
    pub fn new<F>(config: ExecutorConfig, op: F) -> Self
    where
        F: Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(OperationState::default());
        Self {
            op: Arc::new(op),
            config,
            inner: Arc::new(ExecInner {
                state,
                generation: AtomicU64::new(0),
            }),
            last_args: Mutex::new(None),
            token: Mutex::new(None),
        }
    }

    /// Wrap an async function with the default configuration.
    pub fn with_defaults<F>(op: F) -> Self
    where
        F: Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        Self::new(ExecutorConfig::default(), op)
    }

    /// Current operation state.
    pub fn state(&self) -> OperationState<T> {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<OperationState<T>> {
        self.inner.state.subscribe()
    }

    /// Request cancellation of the in-flight execution, if any.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Some(token) = &*self.token.lock().unwrap() {
            token.cancel(reason);
        }
    }

    /// Reset state to idle, discarding any pending auto-reset.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.update(|s| s.reset());
    }

    /// Report fine-grained progress from the wrapped work.
    pub fn set_progress(&self, pct: u8) {
        let pct = pct.min(100);
        self.update(|s| s.progress = pct);
        self.fire_progress(pct);
    }

    /// Re-invoke `execute` with the last stored argument tuple.
    pub async fn retry(&self) -> Result<T> {
        let args = self.last_args.lock().unwrap().clone();
        match args {
            Some(args) => self.execute(args).await,
            None => Err(SyncError::Validation(
                "retry() called before any execution".to_string(),
            )),
        }
    }

    /// Run the wrapped function, retrying transient failures per the
    /// configured policy. Returns the final outcome once it is terminal.
    pub async fn execute(&self, args: A) -> Result<T> {
        *self.last_args.lock().unwrap() = Some(args.clone());
        let token = CancellationToken::new();
        *self.token.lock().unwrap() = Some(token.clone());
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let started = now_millis();
        self.update(|s| {
            s.reset();
            s.status = OpStatus::Pending;
            s.started_at = Some(started);
            s.current_attempt = 1;
        });
        self.fire_progress(0);

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            self.update(|s| {
                s.current_attempt = attempt;
                s.status = OpStatus::Pending;
            });

            let outcome = self.run_attempt(args.clone(), attempt).await;

            // Cooperative cancellation checkpoint: right after the awaited
            // call returns. The attempt's remote effect is not unwound.
            if token.is_cancelled() {
                return self.finish_cancelled(&token);
            }

            match outcome {
                Ok(value) => {
                    self.update(|s| {
                        s.status = OpStatus::Success;
                        s.data = Some(value.clone());
                        s.error = None;
                        s.progress = 100;
                        s.ended_at = Some(now_millis());
                    });
                    self.fire_progress(100);
                    if let Some(delay) = self.config.auto_reset {
                        self.schedule_auto_reset(generation, delay);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    self.update(|s| s.previous_errors.push(err.clone()));

                    let retryable = err.is_retryable()
                        && self
                            .config
                            .should_retry
                            .as_ref()
                            .map_or(true, |veto| veto(&err, attempt));

                    if retryable && attempt < max_attempts {
                        self.update(|s| {
                            s.status = OpStatus::Retrying;
                            s.error = Some(err.clone());
                        });
                        if let Some(hook) = &self.config.on_retry {
                            hook(&err, attempt);
                        }

                        let delay = self.config.retry.delay_for(attempt);
                        tracing::debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying after backoff"
                        );

                        // Checkpoint before the retry sleep; the sleep also
                        // wakes early on cancel.
                        if token.is_cancelled() {
                            return self.finish_cancelled(&token);
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => {}
                        }
                        if token.is_cancelled() {
                            return self.finish_cancelled(&token);
                        }

                        attempt += 1;
                        continue;
                    }

                    self.update(|s| {
                        s.status = OpStatus::Error;
                        s.error = Some(err.clone());
                        s.ended_at = Some(now_millis());
                    });
                    return Err(err);
                }
            }
        }
    }

    async fn run_attempt(&self, args: A, attempt: u32) -> Result<T> {
        let fut = (self.op)(args);
        match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(hook) = &self.config.on_timeout {
                        hook(attempt);
                    }
                    Err(SyncError::Timeout {
                        after_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => fut.await,
        }
    }

    fn finish_cancelled(&self, token: &CancellationToken) -> Result<T> {
        let err = token.to_error();
        self.update(|s| {
            s.status = OpStatus::Cancelled;
            s.error = Some(err.clone());
            s.ended_at = Some(now_millis());
        });
        Err(err)
    }

    fn schedule_auto_reset(&self, generation: u64, delay: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.state.send_modify(|s| {
                    if s.status == OpStatus::Success {
                        s.reset();
                    }
                });
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut OperationState<T>)) {
        self.inner.state.send_modify(f);
    }

    fn fire_progress(&self, pct: u8) {
        if self.config.track_progress {
            if let Some(hook) = &self.config.on_progress {
                hook(pct);
            }
        }
    }
}
