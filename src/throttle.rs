//! Adaptive Throttler
//!
//! Rate-limited wrappers with precise leading/trailing/max-wait semantics:
//! - At most one invocation per configured window
//! - Leading edge invokes synchronously and propagates errors to the caller
//! - Trailing edge invokes with the freshest arguments; its errors go to the
//!   error hook since no caller is waiting
//! - `max_wait` forces an invocation even under continuous incoming calls
//! - Keyed registry with explicit opt-in registration (nothing is patched
//!   globally)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{Callback, CallbackResult, ErrorHook, PendingControl, default_error_hook};

/// Edge behavior for a throttled wrapper
#[derive(Debug, Clone, Copy)]
pub struct ThrottleOptions {
    /// Invoke synchronously on the first call of a window
    pub leading: bool,
    /// Invoke once more at window end with the latest arguments
    pub trailing: bool,
    /// Upper bound forcing an invocation under continuous calls
    pub max_wait: Option<Duration>,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            leading: true,
            trailing: true,
            max_wait: None,
        }
    }
}

struct ThrottleState<T> {
    last_call: Option<Instant>,
    last_invoke: Option<Instant>,
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
    /// Invalidates in-flight timer tasks on cancel/flush
    generation: u64,
}

enum TimerStep {
    Done,
    Reschedule(Duration),
}

struct ThrottledInner<T> {
    callback: Callback<T>,
    delay: Mutex<Duration>,
    options: ThrottleOptions,
    on_error: ErrorHook,
    state: Mutex<ThrottleState<T>>,
}

impl<T: Clone + Send + 'static> ThrottledInner<T> {
    /// True on the first call ever, when a full window has passed since the
    /// last call, or when `max_wait` has elapsed since the last invocation.
    /// The monotonic clock cannot go backward, which satisfies the
    /// backward-clock case without a dedicated branch.
    fn should_invoke(&self, state: &ThrottleState<T>, now: Instant) -> bool {
        let delay = *self.delay.lock();
        match state.last_call {
            None => true,
            Some(last_call) => {
                if now.duration_since(last_call) >= delay {
                    return true;
                }
                match (self.options.max_wait, state.last_invoke) {
                    (Some(max_wait), Some(last_invoke)) => {
                        now.duration_since(last_invoke) >= max_wait
                    }
                    _ => false,
                }
            }
        }
    }

    /// One timer expiry. Invokes the trailing edge when due, otherwise asks
    /// to be rescheduled for the remaining wait.
    fn on_timer(&self, generation: u64) -> TimerStep {
        let now = Instant::now();
        let invoke_args = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return TimerStep::Done;
            }
            if self.should_invoke(&state, now) {
                state.timer = None;
                if self.options.trailing {
                    if let Some(args) = state.pending.take() {
                        state.last_invoke = Some(now);
                        Some(args)
                    } else {
                        None
                    }
                } else {
                    // Window over; drop whatever accumulated
                    state.pending = None;
                    None
                }
            } else {
                let delay = *self.delay.lock();
                let since_last_call = state
                    .last_call
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                let remaining = delay.saturating_sub(since_last_call);
                return TimerStep::Reschedule(remaining.max(Duration::from_millis(1)));
            }
        };
        if let Some(args) = invoke_args {
            if let Err(e) = (self.callback)(args) {
                (self.on_error)(&e);
            }
        }
        TimerStep::Done
    }
}

/// A rate-limited wrapper around one callback. Must be used from within a
/// Tokio runtime: the window timer is a spawned task.
pub struct Throttled<T> {
    inner: Arc<ThrottledInner<T>>,
}

impl<T> Clone for Throttled<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Throttled<T> {
    pub fn new(callback: Callback<T>, delay: Duration, options: ThrottleOptions) -> Self {
        Self::with_error_hook(callback, delay, options, default_error_hook())
    }

    pub fn with_error_hook(
        callback: Callback<T>,
        delay: Duration,
        options: ThrottleOptions,
        on_error: ErrorHook,
    ) -> Self {
        Self {
            inner: Arc::new(ThrottledInner {
                callback,
                delay: Mutex::new(delay),
                options,
                on_error,
                state: Mutex::new(ThrottleState {
                    last_call: None,
                    last_invoke: None,
                    pending: None,
                    timer: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Record a call. The leading edge invokes synchronously and returns the
    /// callback's result; coalesced calls return `Ok(())` and only update
    /// the stored latest arguments.
    pub fn call(&self, args: T) -> CallbackResult {
        let now = Instant::now();
        let leading_args = {
            let mut state = self.inner.state.lock();
            let should = self.inner.should_invoke(&state, now);
            let timer_pending = state.timer.is_some();
            state.pending = Some(args.clone());
            state.last_call = Some(now);
            let leading = if should && !timer_pending && self.inner.options.leading {
                state.last_invoke = Some(now);
                state.pending = None;
                Some(args)
            } else {
                None
            };
            if !timer_pending {
                // A window timer runs whenever calls are arriving; after a
                // flush the next call restarts it, so nothing is ever
                // silently dropped
                let generation = state.generation;
                let inner = Arc::clone(&self.inner);
                let delay = *self.inner.delay.lock();
                state.timer = Some(tokio::spawn(async move {
                    let mut wait = delay;
                    loop {
                        tokio::time::sleep(wait).await;
                        match inner.on_timer(generation) {
                            TimerStep::Done => break,
                            TimerStep::Reschedule(remaining) => wait = remaining,
                        }
                    }
                }));
            }
            leading
        };
        match leading_args {
            Some(args) => (self.inner.callback)(args),
            None => Ok(()),
        }
    }

    /// Clear timer state without invoking. The window resets too: the next
    /// call fires the leading edge again.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending = None;
        state.last_call = None;
        state.last_invoke = None;
    }

    /// Force the trailing invocation immediately. Synchronous caller path:
    /// the callback's error propagates.
    pub fn flush(&self) -> CallbackResult {
        let args = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let args = state.pending.take();
            if args.is_some() {
                state.last_invoke = Some(Instant::now());
            }
            args
        };
        match args {
            Some(args) => (self.inner.callback)(args),
            None => Ok(()),
        }
    }

    /// Whether arguments are waiting for a trailing invocation
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }
}

impl<T: Clone + Send + 'static> PendingControl for Throttled<T> {
    fn cancel(&self) {
        Throttled::cancel(self);
    }

    fn flush(&self) {
        if let Err(e) = Throttled::flush(self) {
            (self.inner.on_error)(&e);
        }
    }

    fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = delay;
    }
}

/// Throttle delay categories and their floors/multipliers over the base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleCategory {
    /// Scroll position tracking (near frame rate)
    Scroll,
    /// Window/container resize
    Resize,
    /// Pointer movement
    MouseMove,
    /// Input events
    Input,
}

impl ThrottleCategory {
    /// Derive the category delay from a base delay. A zero base is the
    /// pass-through sentinel and stays zero.
    pub fn derive(&self, base: Duration) -> Duration {
        if base.is_zero() {
            return Duration::ZERO;
        }
        let base_ms = base.as_millis() as f64;
        let ms = match self {
            ThrottleCategory::Scroll => (base_ms * 0.6).max(16.0),
            ThrottleCategory::Resize => (base_ms * 1.5).max(100.0),
            ThrottleCategory::MouseMove => (base_ms * 0.3).max(10.0),
            ThrottleCategory::Input => (base_ms * 0.8).max(50.0),
        };
        Duration::from_millis(ms as u64)
    }
}

struct RegisteredThrottle {
    control: Arc<dyn PendingControl>,
    category: Option<ThrottleCategory>,
}

/// Produces throttled wrappers and tracks them by key.
///
/// Registration is explicit opt-in: hosts hand their scroll/resize handlers
/// here and use the returned wrapper. No listener anywhere is intercepted
/// behind the host's back.
pub struct AdaptiveThrottler {
    base_delay: Mutex<Duration>,
    registry: Mutex<HashMap<String, RegisteredThrottle>>,
    on_error: ErrorHook,
}

impl AdaptiveThrottler {
    /// Create a throttler with the profile's base delay
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay: Mutex::new(base_delay),
            registry: Mutex::new(HashMap::new()),
            on_error: default_error_hook(),
        }
    }

    /// Wrap `callback` with an explicit delay, registered under `key`
    pub fn throttle<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        delay: Duration,
        options: ThrottleOptions,
        callback: Callback<T>,
    ) -> Throttled<T> {
        let wrapper =
            Throttled::with_error_hook(callback, delay, options, Arc::clone(&self.on_error));
        self.register(key, &wrapper, None);
        wrapper
    }

    /// Wrap `callback` with a category-derived delay; retuned automatically
    /// when the base delay changes
    pub fn throttle_category<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        category: ThrottleCategory,
        callback: Callback<T>,
    ) -> Throttled<T> {
        let delay = category.derive(*self.base_delay.lock());
        let wrapper = Throttled::with_error_hook(
            callback,
            delay,
            ThrottleOptions::default(),
            Arc::clone(&self.on_error),
        );
        self.register(key, &wrapper, Some(category));
        wrapper
    }

    fn register<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        wrapper: &Throttled<T>,
        category: Option<ThrottleCategory>,
    ) {
        self.registry.lock().insert(
            key.to_string(),
            RegisteredThrottle {
                control: Arc::new(wrapper.clone()),
                category,
            },
        );
    }

    /// Clear the timer for `key` without invoking
    pub fn cancel(&self, key: &str) {
        if let Some(entry) = self.registry.lock().get(key) {
            entry.control.cancel();
        }
    }

    /// Force the trailing invocation for `key`
    pub fn flush(&self, key: &str) {
        if let Some(entry) = self.registry.lock().get(key) {
            entry.control.flush();
        }
    }

    /// Cancel every registered wrapper
    pub fn cancel_all(&self) {
        for entry in self.registry.lock().values() {
            entry.control.cancel();
        }
    }

    /// Category delay against the current base
    pub fn delay_for(&self, category: ThrottleCategory) -> Duration {
        category.derive(*self.base_delay.lock())
    }

    /// Retune the base delay and every category-derived wrapper in place
    pub fn set_base_delay(&self, base: Duration) {
        *self.base_delay.lock() = base;
        for entry in self.registry.lock().values() {
            if let Some(category) = entry.category {
                entry.control.set_delay(category.derive(base));
            }
        }
    }
}
