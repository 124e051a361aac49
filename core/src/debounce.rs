//! Debounced invocation: collapse a burst of calls into one execution.
//!
//! Every call within the quiet window resolves with the result of the single
//! execution that closes the window (trailing mode). A `max_wait` bound keeps
//! a never-quiet burst from starving execution forever.

use crate::error::{Result, SyncError};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Debounce configuration.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Quiet period that must elapse after the last call
    pub delay: Duration,
    /// Run immediately on the first call of a burst
    pub leading: bool,
    /// Run once the burst goes quiet
    pub trailing: bool,
    /// Upper bound on how long a continuous burst may defer execution
    pub max_wait: Option<Duration>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(300),
            leading: false,
            trailing: true,
            max_wait: None,
        }
    }
}

type DebouncedFn<A, T> = dyn Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync;

struct Inner<A, T> {
    last_args: Option<A>,
    waiters: Vec<oneshot::Sender<Result<T>>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every rearm; a timer that wakes with a stale generation
    /// has been superseded and must not close the window
    timer_generation: u64,
    window_start: Option<Instant>,
    calls_in_window: u32,
    last_result: Option<Result<T>>,
}

impl<A, T> Inner<A, T> {
    fn new() -> Self {
        Self {
            last_args: None,
            waiters: Vec::new(),
            timer: None,
            timer_generation: 0,
            window_start: None,
            calls_in_window: 0,
            last_result: None,
        }
    }

    /// Close the burst window. The timer handle is returned rather than
    /// aborted here: the timer task itself closes the window when it fires,
    /// and a task must not abort itself mid-run.
    fn close_window(&mut self) -> ClosedWindow<A, T> {
        let window = ClosedWindow {
            timer: self.timer.take(),
            args: self.last_args.take(),
            waiters: std::mem::take(&mut self.waiters),
            calls: self.calls_in_window,
        };
        self.window_start = None;
        self.calls_in_window = 0;
        window
    }
}

struct ClosedWindow<A, T> {
    timer: Option<JoinHandle<()>>,
    args: Option<A>,
    waiters: Vec<oneshot::Sender<Result<T>>>,
    calls: u32,
}

impl<A, T> ClosedWindow<A, T> {
    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

enum Plan<A, T> {
    /// Leading edge of a new burst: run inline now
    Leading(A),
    /// Wait for the trailing execution to resolve this call
    Wait(oneshot::Receiver<Result<T>>),
    /// Leading-only mode absorbed this call; reuse the leading result
    Immediate(Result<T>),
}

/// Wraps an async function so that bursts of calls collapse into at most one
/// leading and/or one trailing execution per quiet window.
pub struct Debouncer<A, T> {
    func: Arc<DebouncedFn<A, T>>,
    config: DebounceConfig,
    inner: Arc<Mutex<Inner<A, T>>>,
}

impl<A, T> Debouncer<A, T>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    /// Wrap an async function with the given configuration.
    pub fn new<F>(config: DebounceConfig, func: F) -> Self
    where
        F: Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            config,
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Invoke the debounced function. Resolves with the result of whichever
    /// execution covers this call.
    pub async fn call(&self, args: A) -> Result<T> {
        let plan = {
            let mut inner = self.inner.lock().unwrap();
            let burst_open = inner.window_start.is_some();
            inner.calls_in_window += 1;
            inner.last_args = Some(args.clone());
            if !burst_open {
                inner.window_start = Some(Instant::now());
            }
            self.arm_timer(&mut inner);

            if !burst_open && self.config.leading {
                Plan::Leading(args)
            } else if self.config.trailing {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                Plan::Wait(rx)
            } else {
                // Leading-only: this call is absorbed by the burst's leading
                // execution. The first call of a burst always takes the
                // Leading branch, so a result exists here.
                match inner.last_result.clone() {
                    Some(result) => Plan::Immediate(result),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        inner.waiters.push(tx);
                        Plan::Wait(rx)
                    }
                }
            }
        };

        match plan {
            Plan::Leading(args) => {
                let result = (self.func)(args).await;
                let waiters = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_result = Some(result.clone());
                    if self.config.trailing {
                        Vec::new()
                    } else {
                        std::mem::take(&mut inner.waiters)
                    }
                };
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
                result
            }
            Plan::Wait(rx) => rx.await.unwrap_or_else(|_| {
                Err(SyncError::Cancelled {
                    reason: "debounced call discarded".to_string(),
                })
            }),
            Plan::Immediate(result) => result,
        }
    }

    /// Cancel the pending execution. Waiting callers resolve with
    /// `Cancelled`.
    pub fn cancel(&self) {
        let mut window = self.inner.lock().unwrap().close_window();
        window.abort_timer();
        // Dropping the senders resolves each waiter's receiver with an error,
        // which call() maps to Cancelled.
        drop(window);
    }

    /// Run the pending execution now instead of waiting out the delay.
    /// Returns `None` if nothing was pending.
    pub async fn flush(&self) -> Option<Result<T>> {
        let mut window = {
            let mut inner = self.inner.lock().unwrap();
            if inner.window_start.is_none() {
                return None;
            }
            inner.close_window()
        };
        window.abort_timer();
        Some(self.run(window).await)
    }

    /// Whether a burst window is currently open.
    pub fn is_pending(&self) -> bool {
        self.inner.lock().unwrap().window_start.is_some()
    }

    fn arm_timer(&self, inner: &mut Inner<A, T>) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.timer_generation += 1;
        let generation = inner.timer_generation;

        let mut deadline = Instant::now() + self.config.delay;
        if let (Some(max_wait), Some(start)) = (self.config.max_wait, inner.window_start) {
            deadline = deadline.min(start + max_wait);
        }

        let this = Self {
            func: Arc::clone(&self.func),
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
        };
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.fire(generation).await;
        }));
    }

    async fn fire(&self, generation: u64) {
        // The timer handle inside the window is this task's own; it is
        // dropped, never aborted. A rearm between this task's wakeup and
        // the lock acquisition supersedes it: the window (and its waiters)
        // then belongs to the newer timer.
        let window = {
            let mut inner = self.inner.lock().unwrap();
            if inner.timer_generation != generation {
                return;
            }
            inner.close_window()
        };
        let _ = self.run(window).await;
    }

    async fn run(&self, window: ClosedWindow<A, T>) -> Result<T> {
        let ClosedWindow {
            args, waiters, calls, ..
        } = window;

        // In leading+trailing mode a window with exactly one call already ran
        // on the leading edge; a trailing re-run would double-execute.
        let leading_covered = if self.config.leading { 1 } else { 0 };
        let should_run = self.config.trailing && calls > leading_covered;

        let result = if should_run {
            match args {
                Some(args) => {
                    let result = (self.func)(args).await;
                    self.inner.lock().unwrap().last_result = Some(result.clone());
                    result
                }
                None => Err(SyncError::Unknown("debounce fired without arguments".into())),
            }
        } else {
            let last = self.inner.lock().unwrap().last_result.clone();
            last.unwrap_or_else(|| {
                Err(SyncError::Cancelled {
                    reason: "debounced call discarded".to_string(),
                })
            })
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }
}
