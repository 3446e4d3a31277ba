//! # adaptive-optimizer - Adaptive Runtime Optimization System
//!
//! Transparently tunes an application's data-access and rendering behavior
//! based on a one-time and periodically repeated measurement of the host
//! machine's processing capability.
//!
//! ## Main components
//!
//! - **PerformanceProfiler**: benchmarks CPU/memory/render cost and
//!   classifies the host as constrained or ample
//! - **AdaptiveCache**: TTL + usage-scored batch eviction for query results
//! - **AdaptiveDebouncer**: trailing-edge delay coalescing wrappers
//! - **AdaptiveThrottler**: leading/trailing/max-wait rate-limited wrappers
//! - **DynamicPaginator**: deterministic filter/sort/slice plus an
//!   infinite-scroll driver
//! - **LazyRenderer**: deferred materialization of list items
//! - **OptimizationCoordinator**: wires the above to host-supplied bindings
//!   and re-evaluates the classification periodically
//!
//! The profiler is a read-only dependency of every other component. The
//! coordinator is the only component that touches host bindings; everything
//! else is a pure library.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod cache;
pub mod coordinator;
pub mod debounce;
pub mod lazy;
pub mod paginate;
pub mod profiler;
pub mod throttle;

pub use cache::{AdaptiveCache, CacheStats, IdentityCodec, PayloadCodec, TtlClass, filter_cache_key};
pub use coordinator::{
    ComponentRegistry, CoordinatorConfig, DataSource, HostBindings, OptimizationContext,
    OptimizationCoordinator, SearchProvider, WrappedLoader, WrappedRenderer, WrappedSearch,
};
pub use debounce::{AdaptiveDebouncer, DebounceCategory, Debounced, SimpleThrottle};
pub use lazy::{ItemRenderer, LazyRenderer, LazyRendererConfig, ListSurface, RenderedNode};
pub use paginate::{
    AppointmentFilter, DateBucket, DynamicPaginator, InfiniteScroller, PageLoader, PageSize,
    PaginationQuery, PaginationResult, Predicate, ScrollView, SortOrder, SortValueFn,
};
pub use profiler::{
    HardwareInfo, PerformanceProfile, PerformanceProfiler, ProfilerConfig, RenderProbe,
    SyntheticRenderProbe,
};
pub use throttle::{AdaptiveThrottler, ThrottleCategory, ThrottleOptions, Throttled};

/// Errors that can occur in the optimization subsystem
#[derive(Debug, Error)]
pub enum OptimizeError {
    /// A startup micro-benchmark failed; the profiler falls back to the
    /// constrained classification
    #[error("benchmark '{name}' failed: {reason}")]
    Benchmark { name: &'static str, reason: String },
    /// A required component never became available during coordinator init
    #[error("component '{0}' unavailable after {1:?}")]
    DependencyUnavailable(String, Duration),
    /// Rendering a single list item failed
    #[error("render failed for item '{id}': {reason}")]
    Render { id: String, reason: String },
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result of invoking a host-supplied callback
pub type CallbackResult = Result<(), anyhow::Error>;

/// A wrapped host callback; `T` models the call's arguments
pub type Callback<T> = Arc<dyn Fn(T) -> CallbackResult + Send + Sync>;

/// Sink for errors raised by deferred (trailing) invocations, which have no
/// waiting caller to propagate to
pub type ErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Default error hook: log and keep the event loop alive
pub(crate) fn default_error_hook() -> ErrorHook {
    Arc::new(|e| tracing::warn!("deferred invocation failed: {e:#}"))
}

/// Control surface shared by debounced and throttled wrappers, independent
/// of the wrapped argument type. Lets one keyed registry span payload types.
pub trait PendingControl: Send + Sync {
    /// Clear any pending timer without invoking
    fn cancel(&self);
    /// Invoke immediately with the last pending arguments, if any; deferred
    /// errors are routed to the wrapper's error hook
    fn flush(&self);
    /// Retune the wrapper's delay in place (profile reclassification)
    fn set_delay(&self, delay: Duration);
}
