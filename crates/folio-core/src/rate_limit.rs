//! Debounce and throttle combinators over a unary side-effecting callback.
//!
//! Scheduled calls run on tokio tasks and time is read from
//! `tokio::time::Instant`, so a paused test clock drives them deterministically.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

type Callback<A> = Arc<dyn Fn(A) + Send + Sync>;

/// Lock a mutex, recovering the data if a callback panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs the callback `delay` after the last call, with the last arguments.
pub struct Debounce<A> {
    f: Callback<A>,
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Send + 'static> Debounce<A> {
    pub fn new(delay: Duration, f: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Cancel any scheduled call and schedule `f(args)` after the delay.
    pub fn call(&self, args: A) {
        let f = Arc::clone(&self.f);
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f(args);
        });
        if let Some(previous) = lock(&self.pending).replace(task) {
            previous.abort();
        }
    }

    /// Drop the scheduled call, if any.
    pub fn cancel(&self) {
        if let Some(task) = lock(&self.pending).take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// Runs the first call of each window immediately and drops the rest.
pub struct Throttle<A> {
    f: Callback<A>,
    delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl<A> Throttle<A> {
    pub fn new(delay: Duration, f: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            delay,
            last_call: Mutex::new(None),
        }
    }

    /// Returns `true` if the callback ran.
    pub fn call(&self, args: A) -> bool {
        let now = Instant::now();
        {
            let mut last = lock(&self.last_call);
            if last.is_some_and(|t| now.duration_since(t) < self.delay) {
                return false;
            }
            *last = Some(now);
        }
        (self.f)(args);
        true
    }
}

struct FlushState<A> {
    last_call: Option<Instant>,
    pending: Option<A>,
    timer: Option<JoinHandle<()>>,
}

struct FlushInner<A> {
    f: Callback<A>,
    delay: Duration,
    state: Mutex<FlushState<A>>,
    /// Held while a trailing call runs so `flush` cannot return mid-call.
    firing: Mutex<()>,
}

impl<A> FlushInner<A> {
    fn take_pending(&self) -> Option<A> {
        let mut state = lock(&self.state);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let args = state.pending.take();
        if args.is_some() {
            state.last_call = Some(Instant::now());
        }
        args
    }

    fn fire_pending(&self) {
        let _firing = lock(&self.firing);
        if let Some(args) = self.take_pending() {
            (self.f)(args);
        }
    }
}

/// Throttle that keeps the latest in-window call as a single trailing call.
///
/// `f` must not call [`flush`](ThrottleWithFlush::flush) on the same limiter.
pub struct ThrottleWithFlush<A> {
    inner: Arc<FlushInner<A>>,
}

impl<A: Send + 'static> ThrottleWithFlush<A> {
    pub fn new(delay: Duration, f: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(FlushInner {
                f: Arc::new(f),
                delay,
                state: Mutex::new(FlushState {
                    last_call: None,
                    pending: None,
                    timer: None,
                }),
                firing: Mutex::new(()),
            }),
        }
    }

    /// Run now if the window is closed, otherwise remember `args` as the
    /// trailing call for the remainder of the window.
    pub fn call(&self, args: A) {
        let now = Instant::now();
        let delay = self.inner.delay;
        let mut state = lock(&self.inner.state);

        let in_window = state
            .last_call
            .is_some_and(|t| now.duration_since(t) < delay);
        if !in_window && state.pending.is_none() {
            state.last_call = Some(now);
            drop(state);
            (self.inner.f)(args);
            return;
        }

        state.pending = Some(args);
        if state.timer.is_none() {
            let remaining = state
                .last_call
                .map_or(Duration::ZERO, |t| delay.saturating_sub(now.duration_since(t)));
            let inner = Arc::clone(&self.inner);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                inner.fire_pending();
            }));
        }
    }

    /// Run the pending trailing call now, if there is one.
    ///
    /// When this returns, no call made before it is still scheduled.
    pub fn flush(&self) {
        self.inner.fire_pending();
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.inner.state).pending.is_some()
    }
}
