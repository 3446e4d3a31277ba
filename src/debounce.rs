//! Adaptive Debouncer
//!
//! Trailing-edge delay coalescing: each call (re)schedules a single timer
//! and only the last call within a quiet period is invoked, with that
//! call's arguments. Also carries:
//! - Keyed cancel/flush across wrappers of different payload types
//! - Category helpers deriving delays from the profiler's base delay
//! - A simple leading-only throttle utility for callers that do not need
//!   trailing-edge semantics

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{Callback, CallbackResult, ErrorHook, PendingControl, default_error_hook};

struct DebounceState<T> {
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every (re)schedule, cancel, and flush; a firing timer that
    /// lost the race against a newer call sees a stale generation and bails
    generation: u64,
}

struct DebouncedInner<T> {
    callback: Callback<T>,
    delay: Mutex<Duration>,
    on_error: ErrorHook,
    state: Mutex<DebounceState<T>>,
}

impl<T: Clone + Send + 'static> DebouncedInner<T> {
    fn fire(&self, generation: u64) {
        let args = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            state.pending.take()
        };
        if let Some(args) = args {
            if let Err(e) = (self.callback)(args) {
                (self.on_error)(&e);
            }
        }
    }
}

/// A debounced wrapper around one callback. Must be used from within a
/// Tokio runtime: the quiet-period timer is a spawned task.
pub struct Debounced<T> {
    inner: Arc<DebouncedInner<T>>,
}

impl<T> Clone for Debounced<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Debounced<T> {
    /// Wrap `callback` so invocations coalesce into one call `delay` after
    /// the last `call`
    pub fn new(callback: Callback<T>, delay: Duration) -> Self {
        Self::with_error_hook(callback, delay, default_error_hook())
    }

    /// Wrap with an explicit sink for deferred-invocation errors
    pub fn with_error_hook(callback: Callback<T>, delay: Duration, on_error: ErrorHook) -> Self {
        Self {
            inner: Arc::new(DebouncedInner {
                callback,
                delay: Mutex::new(delay),
                on_error,
                state: Mutex::new(DebounceState {
                    pending: None,
                    timer: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Record the latest arguments and (re)schedule the quiet-period timer
    pub fn call(&self, args: T) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        state.pending = Some(args);
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        let delay = *self.inner.delay.lock();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(generation);
        }));
    }

    /// Clear the pending timer without invoking
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending = None;
    }

    /// Invoke immediately with the last pending arguments and clear the
    /// timer. This is a synchronous caller-invoked path, so the callback's
    /// error propagates.
    pub fn flush(&self) -> CallbackResult {
        let args = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.pending.take()
        };
        match args {
            Some(args) => (self.inner.callback)(args),
            None => Ok(()),
        }
    }

    /// Whether a call is waiting on the quiet period
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }
}

impl<T: Clone + Send + 'static> PendingControl for Debounced<T> {
    fn cancel(&self) {
        Debounced::cancel(self);
    }

    fn flush(&self) {
        if let Err(e) = Debounced::flush(self) {
            (self.inner.on_error)(&e);
        }
    }

    fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = delay;
    }
}

/// Debounce delay categories and their floors/multipliers over the base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebounceCategory {
    /// Free-text search as the user types
    Search,
    /// Filter control changes
    Filter,
    /// Generic input fields
    Input,
    /// Form validation callbacks
    Validation,
    /// Periodic draft saving
    Autosave,
}

impl DebounceCategory {
    /// Derive the category delay from a base delay. A zero base is the
    /// pass-through sentinel and stays zero.
    pub fn derive(&self, base: Duration) -> Duration {
        if base.is_zero() {
            return Duration::ZERO;
        }
        let base_ms = base.as_millis() as f64;
        let ms = match self {
            DebounceCategory::Search => (base_ms * 0.8).max(100.0),
            DebounceCategory::Filter => base_ms.max(150.0),
            DebounceCategory::Input => (base_ms * 0.6).max(150.0),
            DebounceCategory::Validation => (base_ms * 1.2).max(250.0),
            DebounceCategory::Autosave => (base_ms * 3.0).max(1000.0),
        };
        Duration::from_millis(ms as u64)
    }
}

struct RegisteredDebounce {
    control: Arc<dyn PendingControl>,
    category: Option<DebounceCategory>,
}

/// Produces debounced wrappers and tracks them by key for cancel/flush and
/// live retuning when the profile classification changes
pub struct AdaptiveDebouncer {
    base_delay: Mutex<Duration>,
    registry: Mutex<HashMap<String, RegisteredDebounce>>,
    on_error: ErrorHook,
}

impl AdaptiveDebouncer {
    /// Create a debouncer with the profile's base delay
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay: Mutex::new(base_delay),
            registry: Mutex::new(HashMap::new()),
            on_error: default_error_hook(),
        }
    }

    /// Wrap `callback` with an explicit delay, registered under `key`
    pub fn debounce<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        delay: Option<Duration>,
        callback: Callback<T>,
    ) -> Debounced<T> {
        let delay = delay.unwrap_or_else(|| *self.base_delay.lock());
        let wrapper = Debounced::with_error_hook(callback, delay, Arc::clone(&self.on_error));
        self.register(key, &wrapper, None);
        wrapper
    }

    /// Wrap `callback` with a category-derived delay; retuned automatically
    /// when the base delay changes
    pub fn debounce_category<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        category: DebounceCategory,
        callback: Callback<T>,
    ) -> Debounced<T> {
        let delay = category.derive(*self.base_delay.lock());
        let wrapper = Debounced::with_error_hook(callback, delay, Arc::clone(&self.on_error));
        self.register(key, &wrapper, Some(category));
        wrapper
    }

    fn register<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        wrapper: &Debounced<T>,
        category: Option<DebounceCategory>,
    ) {
        self.registry.lock().insert(
            key.to_string(),
            RegisteredDebounce {
                control: Arc::new(wrapper.clone()),
                category,
            },
        );
    }

    /// Clear the pending timer for `key` without invoking
    pub fn cancel(&self, key: &str) {
        if let Some(entry) = self.registry.lock().get(key) {
            entry.control.cancel();
        }
    }

    /// Invoke `key` immediately with its pending arguments
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
    pub fn delay_for(&self, category: DebounceCategory) -> Duration {
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

/// Leading-only fixed-interval limiter: the first call in each interval
/// invokes synchronously, the rest are dropped. For callers that do not
/// need trailing-edge semantics.
pub struct SimpleThrottle<T> {
    callback: Callback<T>,
    interval: Duration,
    last_invoke: Mutex<Option<Instant>>,
}

impl<T> SimpleThrottle<T> {
    pub fn new(callback: Callback<T>, interval: Duration) -> Self {
        Self {
            callback,
            interval,
            last_invoke: Mutex::new(None),
        }
    }

    /// Invoke if the interval has elapsed; dropped calls return `Ok(())`
    pub fn call(&self, args: T) -> CallbackResult {
        let now = Instant::now();
        let mut last = self.last_invoke.lock();
        let due = match *last {
            None => true,
            Some(prev) => now.duration_since(prev) >= self.interval,
        };
        if !due {
            return Ok(());
        }
        *last = Some(now);
        drop(last);
        (self.callback)(args)
    }
}
