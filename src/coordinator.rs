//! Optimization Coordinator
//!
//! Wires the optimization components to the host application:
//! - Resolves components in dependency order from a registry, with a
//!   bounded wait before a missing dependency becomes a fatal error
//! - Wraps the host's loader/search/renderer bindings with versions that
//!   branch on the current classification; argument and return shapes are
//!   never changed
//! - Re-checks the classification every 30 seconds and re-applies the
//!   integration idempotently
//! - Owns every periodic task (re-profile, cache sweep, re-check) and
//!   aborts them on shutdown
//!
//! Hosts register typed bindings at construction time; nothing global is
//! ever patched.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::{AdaptiveCache, TtlClass, filter_cache_key};
use crate::debounce::{AdaptiveDebouncer, DebounceCategory, Debounced};
use crate::lazy::{ItemRenderer, LazyRenderer, LazyRendererConfig, ListSurface};
use crate::paginate::DynamicPaginator;
use crate::profiler::{PerformanceProfiler, ProfilerConfig};
use crate::throttle::{AdaptiveThrottler, ThrottleCategory, Throttled};
use crate::{Callback, OptimizeError};

/// Well-known registry keys, resolved in this order
pub mod keys {
    pub const PROFILER: &str = "profiler";
    pub const CACHE: &str = "cache";
    pub const DEBOUNCER: &str = "debouncer";
    pub const THROTTLER: &str = "throttler";
    pub const PAGINATOR: &str = "paginator";
    pub const LAZY_RENDERER: &str = "lazy-renderer";
}

enum Slot {
    Instance(Box<dyn Any + Send + Sync>),
    /// Constructor only: auto-instantiated on first resolution
    Factory(Box<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>),
}

/// Component lookup by well-known key. Components may be registered as
/// instances or as constructors; resolution waits a bounded time for late
/// registration before failing.
#[derive(Default)]
pub struct ComponentRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    registered: Notify,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready component instance
    pub fn register<T: Send + Sync + 'static>(&self, key: &str, component: T) {
        self.slots
            .lock()
            .insert(key.to_string(), Slot::Instance(Box::new(component)));
        self.registered.notify_waiters();
    }

    /// Register a constructor; it runs once, on first resolution
    pub fn register_factory<F>(&self, key: &str, factory: F)
    where
        F: Fn() -> Box<dyn Any + Send + Sync> + Send + Sync + 'static,
    {
        self.slots
            .lock()
            .insert(key.to_string(), Slot::Factory(Box::new(factory)));
        self.registered.notify_waiters();
    }

    fn try_get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let mut slots = self.slots.lock();
        let slot = slots.get(key)?;
        if let Slot::Factory(_) = slot {
            let instance = match slots.remove(key) {
                Some(Slot::Factory(factory)) => factory(),
                _ => return None,
            };
            slots.insert(key.to_string(), Slot::Instance(instance));
        }
        match slots.get(key) {
            Some(Slot::Instance(instance)) => instance.downcast_ref::<T>().cloned(),
            _ => None,
        }
    }

    /// Resolve `key`, waiting up to `wait` for it to appear. A dependency
    /// that never becomes available is a fatal error reported to whoever
    /// initiated loading.
    pub async fn resolve<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        wait: Duration,
    ) -> Result<T, OptimizeError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(component) = self.try_get::<T>(key) {
                return Ok(component);
            }
            let notified = self.registered.notified();
            let now = tokio::time::Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, notified).await.is_err()
            {
                // One last look in case registration raced the timeout
                return self
                    .try_get::<T>(key)
                    .ok_or_else(|| OptimizeError::DependencyUnavailable(key.to_string(), wait));
            }
        }
    }
}

/// Host data source: a filter-argument loader returning appointment-like
/// records (an empty filter map is the zero-argument form)
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self, filters: &HashMap<String, String>) -> anyhow::Result<Vec<Value>>;
}

/// Host search function; returns the same record shape as the loader
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, term: &str) -> anyhow::Result<Vec<Value>>;
}

/// The host integration points the coordinator wraps. Registered once at
/// construction; originals are saved and can always be gotten back.
#[derive(Clone)]
pub struct HostBindings {
    pub data_source: Arc<dyn DataSource>,
    pub search: Arc<dyn SearchProvider>,
    pub item_renderer: Arc<dyn ItemRenderer>,
    pub surface: Arc<dyn ListSurface>,
}

/// Flags shared between the coordinator and every wrapper it hands out
struct CoordinatorShared {
    enabled: AtomicBool,
    restored: AtomicBool,
}

impl CoordinatorShared {
    fn active(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.restored.load(Ordering::Acquire)
    }
}

/// Coordinator timing and wiring configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long component resolution may wait before failing
    pub dependency_timeout: Duration,
    /// Classification re-check cadence
    pub recheck_interval: Duration,
    /// Proactive cache sweep cadence
    pub sweep_interval: Duration,
    /// Base TTL scaled by [`TtlClass`] for cached loads and searches
    pub base_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dependency_timeout: Duration::from_secs(5),
            recheck_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(120),
            base_ttl: Duration::from_secs(60),
        }
    }
}

/// The explicit dependency-injection container: one of each component,
/// constructed at startup and passed to consumers. No ambient globals.
#[derive(Clone)]
pub struct OptimizationContext {
    pub profiler: Arc<PerformanceProfiler>,
    pub cache: Arc<AdaptiveCache<Value>>,
    pub debouncer: Arc<AdaptiveDebouncer>,
    pub throttler: Arc<AdaptiveThrottler>,
    pub paginator: Arc<DynamicPaginator>,
    pub lazy: Arc<LazyRenderer>,
}

/// Caching wrapper around the host loader. Same signature as the original;
/// it only interposes.
pub struct WrappedLoader {
    original: Arc<dyn DataSource>,
    cache: Arc<AdaptiveCache<Value>>,
    profiler: Arc<PerformanceProfiler>,
    shared: Arc<CoordinatorShared>,
    base_ttl: Duration,
}

#[async_trait]
impl DataSource for WrappedLoader {
    async fn load(&self, filters: &HashMap<String, String>) -> anyhow::Result<Vec<Value>> {
        if !self.shared.active() || !self.profiler.current().should_use_caching() {
            return self.original.load(filters).await;
        }
        let key = filter_cache_key("load", filters);
        if let Some(Value::Array(items)) = self.cache.get(&key) {
            return Ok(items);
        }
        let items = self.original.load(filters).await?;
        self.cache.set(
            &key,
            Value::Array(items.clone()),
            Some(TtlClass::Default.scale(self.base_ttl)),
        );
        Ok(items)
    }
}

/// Caching wrapper around the host search function. Search results churn
/// quickly, so they get the short TTL class.
pub struct WrappedSearch {
    original: Arc<dyn SearchProvider>,
    cache: Arc<AdaptiveCache<Value>>,
    profiler: Arc<PerformanceProfiler>,
    shared: Arc<CoordinatorShared>,
    base_ttl: Duration,
}

#[async_trait]
impl SearchProvider for WrappedSearch {
    async fn search(&self, term: &str) -> anyhow::Result<Vec<Value>> {
        if !self.shared.active() || !self.profiler.current().should_use_caching() {
            return self.original.search(term).await;
        }
        let key = format!("search|{}", term.to_lowercase());
        if let Some(Value::Array(items)) = self.cache.get(&key) {
            return Ok(items);
        }
        let items = self.original.search(term).await?;
        self.cache.set(
            &key,
            Value::Array(items.clone()),
            Some(TtlClass::SearchResults.scale(self.base_ttl)),
        );
        Ok(items)
    }
}

/// Rendering wrapper: lazy materialization on constrained machines,
/// synchronous render otherwise. The `(list, container)` shape survives;
/// the container was fixed at construction.
pub struct WrappedRenderer {
    lazy: Arc<LazyRenderer>,
    profiler: Arc<PerformanceProfiler>,
    shared: Arc<CoordinatorShared>,
}

impl WrappedRenderer {
    pub fn render(&self, list: &[Value]) {
        let use_lazy =
            self.shared.active() && self.profiler.current().should_use_lazy_loading();
        self.lazy.set_enabled(use_lazy);
        self.lazy.process_list(list);
    }

    /// Forward a visibility event from the host observer
    pub fn notify_visible(&self, id: &str) {
        self.lazy.notify_visible(id);
    }
}

/// Discovers and wires the optimization components, wraps the host
/// bindings, and keeps the integration aligned with the live classification
pub struct OptimizationCoordinator {
    ctx: OptimizationContext,
    bindings: HostBindings,
    config: CoordinatorConfig,
    shared: Arc<CoordinatorShared>,
    /// Classification last applied, for change logging
    last_applied: Mutex<Option<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OptimizationCoordinator {
    /// Resolve every component from the registry in dependency order, then
    /// apply the initial integration
    pub async fn init(
        registry: &ComponentRegistry,
        bindings: HostBindings,
        config: CoordinatorConfig,
    ) -> Result<Self, OptimizeError> {
        let wait = config.dependency_timeout;
        // The profiler comes first: every other component reads it
        let profiler: Arc<PerformanceProfiler> = registry.resolve(keys::PROFILER, wait).await?;
        let cache: Arc<AdaptiveCache<Value>> = registry.resolve(keys::CACHE, wait).await?;
        let debouncer: Arc<AdaptiveDebouncer> = registry.resolve(keys::DEBOUNCER, wait).await?;
        let throttler: Arc<AdaptiveThrottler> = registry.resolve(keys::THROTTLER, wait).await?;
        let paginator: Arc<DynamicPaginator> = registry.resolve(keys::PAGINATOR, wait).await?;
        let lazy: Arc<LazyRenderer> = registry.resolve(keys::LAZY_RENDERER, wait).await?;

        let coordinator = Self {
            ctx: OptimizationContext {
                profiler,
                cache,
                debouncer,
                throttler,
                paginator,
                lazy,
            },
            bindings,
            config,
            shared: Arc::new(CoordinatorShared {
                enabled: AtomicBool::new(true),
                restored: AtomicBool::new(false),
            }),
            last_applied: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        };
        coordinator.apply_integration();
        Ok(coordinator)
    }

    /// Build a registry with default constructors for every component and
    /// initialize from it. The lazy renderer is built over the host's
    /// renderer and container bindings.
    pub async fn bootstrap(
        bindings: HostBindings,
        config: CoordinatorConfig,
    ) -> Result<Self, OptimizeError> {
        let registry = ComponentRegistry::new();
        let profiler = Arc::new(PerformanceProfiler::new(ProfilerConfig::default()));
        let profile = profiler.current();

        registry.register(keys::CACHE, {
            let cache: Arc<AdaptiveCache<Value>> =
                Arc::new(AdaptiveCache::new(profile.cache_capacity(), config.base_ttl));
            cache
        });
        registry.register(
            keys::DEBOUNCER,
            Arc::new(AdaptiveDebouncer::new(profile.debounce_delay())),
        );
        registry.register(
            keys::THROTTLER,
            Arc::new(AdaptiveThrottler::new(profile.throttle_delay())),
        );
        registry.register_factory(keys::PAGINATOR, || Box::new(Arc::new(DynamicPaginator::new())));
        registry.register(keys::LAZY_RENDERER, {
            let lazy_config = LazyRendererConfig {
                batch_size: profile.lazy_batch_size(),
                enabled: profile.should_use_lazy_loading(),
                ..LazyRendererConfig::default()
            };
            Arc::new(LazyRenderer::new(
                Arc::clone(&bindings.item_renderer),
                Arc::clone(&bindings.surface),
                lazy_config,
            ))
        });
        registry.register(keys::PROFILER, profiler);

        Self::init(&registry, bindings, config).await
    }

    /// The component container, for hosts that use the libraries directly
    pub fn context(&self) -> &OptimizationContext {
        &self.ctx
    }

    /// Caching wrapper for the host loader; same signature, interposed
    pub fn wrapped_loader(&self) -> WrappedLoader {
        WrappedLoader {
            original: Arc::clone(&self.bindings.data_source),
            cache: Arc::clone(&self.ctx.cache),
            profiler: Arc::clone(&self.ctx.profiler),
            shared: Arc::clone(&self.shared),
            base_ttl: self.config.base_ttl,
        }
    }

    /// Caching wrapper for the host search function
    pub fn wrapped_search(&self) -> WrappedSearch {
        WrappedSearch {
            original: Arc::clone(&self.bindings.search),
            cache: Arc::clone(&self.ctx.cache),
            profiler: Arc::clone(&self.ctx.profiler),
            shared: Arc::clone(&self.shared),
            base_ttl: self.config.base_ttl,
        }
    }

    /// Classification-aware renderer over the host's renderer and container
    pub fn wrapped_renderer(&self) -> WrappedRenderer {
        WrappedRenderer {
            lazy: Arc::clone(&self.ctx.lazy),
            profiler: Arc::clone(&self.ctx.profiler),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Throttle a host scroll handler (explicit opt-in registration)
    pub fn wrap_scroll_handler<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        handler: Callback<T>,
    ) -> Throttled<T> {
        self.ctx
            .throttler
            .throttle_category(key, ThrottleCategory::Scroll, handler)
    }

    /// Throttle a host resize handler
    pub fn wrap_resize_handler<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        handler: Callback<T>,
    ) -> Throttled<T> {
        self.ctx
            .throttler
            .throttle_category(key, ThrottleCategory::Resize, handler)
    }

    /// Debounce a host form-validation callback
    pub fn wrap_validation<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
        callback: Callback<T>,
    ) -> Debounced<T> {
        self.ctx
            .debouncer
            .debounce_category(key, DebounceCategory::Validation, callback)
    }

    /// Apply the current classification to every component. Idempotent:
    /// applying the same profile twice changes nothing.
    pub fn apply_integration(&self) {
        let profile = self.ctx.profiler.current();
        let active = self.shared.active();

        self.ctx.cache.set_capacity(profile.cache_capacity());
        self.ctx
            .debouncer
            .set_base_delay(if active && profile.should_use_debouncing() {
                profile.debounce_delay()
            } else {
                Duration::ZERO
            });
        self.ctx
            .throttler
            .set_base_delay(if active && profile.should_use_throttling() {
                profile.throttle_delay()
            } else {
                Duration::ZERO
            });
        self.ctx.lazy.set_batch_size(profile.lazy_batch_size());
        self.ctx
            .lazy
            .set_enabled(active && profile.should_use_lazy_loading());

        let mut last = self.last_applied.lock();
        if *last != Some(profile.is_constrained) {
            tracing::info!(
                constrained = profile.is_constrained,
                overall = profile.overall_score,
                "integration (re)applied"
            );
        }
        *last = Some(profile.is_constrained);
    }

    /// One re-check tick: read the classification and re-apply
    pub fn recheck(&self) {
        self.apply_integration();
    }

    /// Start the periodic tasks: classification re-check, cache sweep, and
    /// profile re-sample
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let coordinator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.config.recheck_interval);
            interval.tick().await; // consume the immediate tick
            loop {
                interval.tick().await;
                coordinator.recheck();
            }
        }));

        let cache = Arc::clone(&self.ctx.cache);
        let sweep_interval = self.config.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.sweep_expired();
            }
        }));

        let profiler = Arc::clone(&self.ctx.profiler);
        let resample_interval = profiler.resample_interval();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(resample_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                profiler.resample();
            }
        }));
    }

    /// Abort every periodic task
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Turn the optimized paths on
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::Release);
        self.apply_integration();
    }

    /// Turn the optimized paths off; wrappers pass through until re-enabled
    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::Release);
        self.apply_integration();
    }

    /// Escape hatch: every wrapper becomes a permanent pass-through and the
    /// saved original bindings are handed back
    pub fn restore_original_functions(&self) -> HostBindings {
        self.shared.restored.store(true, Ordering::Release);
        self.ctx.debouncer.cancel_all();
        self.ctx.throttler.cancel_all();
        // restored makes active() false, so this retunes every handed-out
        // rate-limiter wrapper to the zero-delay pass-through and disables
        // lazy rendering
        self.apply_integration();
        tracing::info!("original host bindings restored, wrappers pass through");
        self.bindings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for CountingSource {
        async fn load(&self, _filters: &HashMap<String, String>) -> anyhow::Result<Vec<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![json!({ "id": "a" }), json!({ "id": "b" })])
        }
    }

    struct CountingSearch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for CountingSearch {
        async fn search(&self, term: &str) -> anyhow::Result<Vec<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![json!({ "id": term })])
        }
    }

    struct NoopRenderer;
    impl ItemRenderer for NoopRenderer {
        fn render(&self, id: &str, item: &Value) -> anyhow::Result<crate::lazy::RenderedNode> {
            Ok(crate::lazy::RenderedNode {
                id: id.to_string(),
                content: item.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct NoopSurface {
        children: Mutex<HashMap<String, bool>>,
    }

    impl ListSurface for NoopSurface {
        fn clear(&self) {
            self.children.lock().clear();
        }
        fn insert_placeholder(&self, id: &str, _height_px: u32) {
            self.children.lock().insert(id.to_string(), false);
        }
        fn replace_with_rendered(&self, id: &str, _node: crate::lazy::RenderedNode) -> bool {
            self.children.lock().insert(id.to_string(), true).is_some()
        }
        fn remove(&self, id: &str) {
            self.children.lock().remove(id);
        }
        fn child_count(&self) -> usize {
            self.children.lock().len()
        }
    }

    fn bindings(source: Arc<CountingSource>, search: Arc<CountingSearch>) -> HostBindings {
        HostBindings {
            data_source: source,
            search,
            item_renderer: Arc::new(NoopRenderer),
            surface: Arc::new(NoopSurface::default()),
        }
    }

    fn counting_bindings() -> (HostBindings, Arc<CountingSource>, Arc<CountingSearch>) {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let search = Arc::new(CountingSearch { calls: AtomicUsize::new(0) });
        (bindings(Arc::clone(&source), Arc::clone(&search)), source, search)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_resolves_all_components() {
        let (host, _, _) = counting_bindings();
        let coordinator = OptimizationCoordinator::bootstrap(host, CoordinatorConfig::default())
            .await
            .unwrap();
        let profile = coordinator.context().profiler.current();
        assert_eq!(coordinator.context().cache.capacity(), profile.cache_capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_dependency_is_fatal_after_bounded_wait() {
        let registry = ComponentRegistry::new();
        registry.register(
            keys::PROFILER,
            Arc::new(PerformanceProfiler::new(ProfilerConfig::default())),
        );
        // No cache registered
        let (host, _, _) = counting_bindings();
        let config = CoordinatorConfig {
            dependency_timeout: Duration::from_millis(50),
            ..CoordinatorConfig::default()
        };
        let err = match OptimizationCoordinator::init(&registry, host, config).await {
            Ok(_) => panic!("init succeeded without a registered cache"),
            Err(e) => e,
        };
        match err {
            OptimizeError::DependencyUnavailable(key, _) => assert_eq!(key, keys::CACHE),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_factory_auto_instantiates() {
        let registry = ComponentRegistry::new();
        registry.register_factory("paginator", || Box::new(Arc::new(DynamicPaginator::new())));
        let paginator: Arc<DynamicPaginator> = registry
            .resolve("paginator", Duration::from_millis(10))
            .await
            .unwrap();
        let result = paginator.paginate(
            &[json!({ "v": 1 })],
            &crate::paginate::PaginationQuery::new(1, crate::paginate::PageSize::All),
        );
        assert_eq!(result.total_items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_waits_for_late_registration() {
        let registry = Arc::new(ComponentRegistry::new());
        let late = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            late.register("late", Arc::new(DynamicPaginator::new()));
        });
        let resolved: Arc<DynamicPaginator> = registry
            .resolve("late", Duration::from_millis(200))
            .await
            .unwrap();
        let _ = resolved;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_loader_caches_by_canonical_filters() {
        let (host, source, _) = counting_bindings();
        let coordinator = OptimizationCoordinator::bootstrap(host, CoordinatorConfig::default())
            .await
            .unwrap();
        let loader = coordinator.wrapped_loader();

        let mut filters = HashMap::new();
        filters.insert("status".to_string(), "open".to_string());
        let first = loader.load(&filters).await.unwrap();
        let second = loader.load(&filters).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1, "second load was a cache hit");

        // Different filters miss
        let mut other = HashMap::new();
        other.insert("status".to_string(), "done".to_string());
        loader.load(&other).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_search_uses_short_ttl_class() {
        let (host, _, search) = counting_bindings();
        let config = CoordinatorConfig {
            base_ttl: Duration::from_secs(60),
            ..CoordinatorConfig::default()
        };
        let coordinator = OptimizationCoordinator::bootstrap(host, config).await.unwrap();
        let wrapped = coordinator.wrapped_search();

        wrapped.search("dentist").await.unwrap();
        wrapped.search("dentist").await.unwrap();
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);

        // Search TTL is base/2 = 30s; past that the entry is gone
        tokio::time::sleep(Duration::from_secs(31)).await;
        wrapped.search("dentist").await.unwrap();
        assert_eq!(search.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_passes_through() {
        let (host, source, _) = counting_bindings();
        let coordinator = OptimizationCoordinator::bootstrap(host, CoordinatorConfig::default())
            .await
            .unwrap();
        coordinator.disable();
        let loader = coordinator.wrapped_loader();
        let filters = HashMap::new();
        loader.load(&filters).await.unwrap();
        loader.load(&filters).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2, "no caching while disabled");

        coordinator.enable();
        loader.load(&filters).await.unwrap();
        loader.load(&filters).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3, "caching resumed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_original_functions_is_permanent() {
        let (host, source, _) = counting_bindings();
        let coordinator = OptimizationCoordinator::bootstrap(host, CoordinatorConfig::default())
            .await
            .unwrap();
        let loader = coordinator.wrapped_loader();
        let originals = coordinator.restore_original_functions();

        let filters = HashMap::new();
        loader.load(&filters).await.unwrap();
        loader.load(&filters).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2, "wrapper passes through");

        // Re-enabling does not override a restore
        coordinator.enable();
        loader.load(&filters).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        // And the returned originals are the host's own bindings
        originals.data_source.load(&filters).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_retunes_handed_out_rate_limiters() {
        let (host, _, _) = counting_bindings();
        let coordinator = OptimizationCoordinator::bootstrap(host, CoordinatorConfig::default())
            .await
            .unwrap();
        // Pin a nonzero base so the wrapper starts with a real window
        coordinator
            .context()
            .throttler
            .set_base_delay(Duration::from_millis(200));

        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_scroll = coordinator.wrap_scroll_handler(
            "appointments-list",
            Arc::new(move |v: u32| {
                sink.lock().push(v);
                Ok(())
            }),
        );
        on_scroll.call(1).unwrap();
        on_scroll.call(2).unwrap();
        coordinator.restore_original_functions();

        // The wrapper was retuned to the zero-delay pass-through: calls
        // invoke as they arrive instead of waiting out the old window
        on_scroll.call(3).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        on_scroll.call(4).unwrap();
        assert_eq!(*seen.lock(), vec![1, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_integration_is_idempotent() {
        let (host, _, _) = counting_bindings();
        let coordinator = OptimizationCoordinator::bootstrap(host, CoordinatorConfig::default())
            .await
            .unwrap();
        coordinator.apply_integration();
        let capacity_once = coordinator.context().cache.capacity();
        coordinator.apply_integration();
        assert_eq!(coordinator.context().cache.capacity(), capacity_once);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tasks_stop_on_shutdown() {
        let (host, _, _) = counting_bindings();
        let coordinator = Arc::new(
            OptimizationCoordinator::bootstrap(host, CoordinatorConfig::default())
                .await
                .unwrap(),
        );
        coordinator.start();
        assert_eq!(coordinator.tasks.lock().len(), 3);
        coordinator.shutdown();
        assert!(coordinator.tasks.lock().is_empty());
    }
}
