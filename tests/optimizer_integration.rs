//! Optimizer Integration Tests
//!
//! End-to-end tests across component boundaries:
//! - Coordinator bootstrap and wrapped loader/search caching
//! - Loader output flowing through the paginator's appointment filters
//! - Wrapped renderer with visibility-driven materialization
//! - Opt-in debounce/throttle wrappers handed out by the coordinator
//! - Restoring the original host bindings

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde_json::{Value, json};

use adaptive_optimizer::{
    AppointmentFilter, CoordinatorConfig, DataSource, DateBucket, HostBindings, ItemRenderer,
    ListSurface, OptimizationCoordinator, PageSize, RenderedNode, SearchProvider,
};

// ============================================================================
// Host fixtures
// ============================================================================

struct AppointmentSource {
    calls: AtomicUsize,
}

fn appointment(id: &str, date: &str, status: &str, title: &str) -> Value {
    json!({ "id": id, "data": date, "status": status, "titulo": title })
}

#[async_trait]
impl DataSource for AppointmentSource {
    async fn load(&self, _filters: &HashMap<String, String>) -> anyhow::Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            appointment("a1", "2026-08-23", "confirmed", "Dentist"),
            appointment("a2", "2026-08-23", "pending", "Gym"),
            appointment("a3", "2026-08-24", "confirmed", "Dentist"),
            appointment("a4", "2026-09-02", "confirmed", "Haircut"),
        ])
    }
}

struct EchoSearch {
    calls: AtomicUsize,
}

#[async_trait]
impl SearchProvider for EchoSearch {
    async fn search(&self, term: &str) -> anyhow::Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![json!({ "id": term })])
    }
}

struct TextRenderer;

impl ItemRenderer for TextRenderer {
    fn render(&self, id: &str, item: &Value) -> anyhow::Result<RenderedNode> {
        Ok(RenderedNode {
            id: id.to_string(),
            content: item["titulo"].as_str().unwrap_or("").to_string(),
        })
    }
}

/// In-memory surface tracking which children are still placeholders
#[derive(Default)]
struct RecordingSurface {
    children: Mutex<HashMap<String, bool>>,
}

impl RecordingSurface {
    fn rendered_count(&self) -> usize {
        self.children.lock().values().filter(|m| **m).count()
    }
}

impl ListSurface for RecordingSurface {
    fn clear(&self) {
        self.children.lock().clear();
    }
    fn insert_placeholder(&self, id: &str, _height_px: u32) {
        self.children.lock().insert(id.to_string(), false);
    }
    fn replace_with_rendered(&self, id: &str, _node: RenderedNode) -> bool {
        match self.children.lock().get_mut(id) {
            Some(slot) => {
                *slot = true;
                true
            }
            None => false,
        }
    }
    fn remove(&self, id: &str) {
        self.children.lock().remove(id);
    }
    fn child_count(&self) -> usize {
        self.children.lock().len()
    }
}

struct Host {
    bindings: HostBindings,
    source: Arc<AppointmentSource>,
    search: Arc<EchoSearch>,
    surface: Arc<RecordingSurface>,
}

fn host() -> Host {
    let source = Arc::new(AppointmentSource { calls: AtomicUsize::new(0) });
    let search = Arc::new(EchoSearch { calls: AtomicUsize::new(0) });
    let surface = Arc::new(RecordingSurface::default());
    Host {
        bindings: HostBindings {
            data_source: Arc::clone(&source) as Arc<dyn DataSource>,
            search: Arc::clone(&search) as Arc<dyn SearchProvider>,
            item_renderer: Arc::new(TextRenderer),
            surface: Arc::clone(&surface) as Arc<dyn ListSurface>,
        },
        source,
        search,
        surface,
    }
}

// ============================================================================
// Load -> cache -> paginate pipeline
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_loader_cache_feeds_paginator() {
    let host = host();
    let coordinator = OptimizationCoordinator::bootstrap(host.bindings, CoordinatorConfig::default())
        .await
        .unwrap();
    let loader = coordinator.wrapped_loader();

    let filters = HashMap::new();
    let records = loader.load(&filters).await.unwrap();
    let again = loader.load(&filters).await.unwrap();
    assert_eq!(records, again);
    assert_eq!(host.source.calls.load(Ordering::SeqCst), 1, "repeat load hit the cache");

    let today = NaiveDate::from_ymd_opt(2026, 8, 23).unwrap();
    let filter = AppointmentFilter {
        text: Some("dentist".to_string()),
        bucket: Some(DateBucket::Today),
        status: Some("confirmed".to_string()),
    };
    let page = coordinator.context().paginator.paginate_appointments(
        &records,
        &filter,
        1,
        PageSize::Limit(10),
        today,
    );
    assert_eq!(page.total_items, 1);
    assert_eq!(page.items[0]["id"], json!("a1"));
    assert_eq!(page.start_index, 1);
    assert_eq!(page.end_index, 1);
}

#[tokio::test(start_paused = true)]
async fn test_search_results_expire_faster_than_loads() {
    let host = host();
    let config = CoordinatorConfig {
        base_ttl: Duration::from_secs(60),
        ..CoordinatorConfig::default()
    };
    let coordinator = OptimizationCoordinator::bootstrap(host.bindings, config)
        .await
        .unwrap();
    let loader = coordinator.wrapped_loader();
    let search = coordinator.wrapped_search();
    let filters = HashMap::new();

    loader.load(&filters).await.unwrap();
    search.search("dentist").await.unwrap();

    // 31s: past the search TTL (base/2) but inside the load TTL (base)
    tokio::time::sleep(Duration::from_secs(31)).await;
    loader.load(&filters).await.unwrap();
    search.search("dentist").await.unwrap();
    assert_eq!(host.source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.search.calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Rendering pipeline
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rendered_list_converges_to_fully_materialized() {
    let host = host();
    let coordinator = OptimizationCoordinator::bootstrap(host.bindings, CoordinatorConfig::default())
        .await
        .unwrap();
    let loader = coordinator.wrapped_loader();
    let renderer = coordinator.wrapped_renderer();

    let records = loader.load(&HashMap::new()).await.unwrap();
    renderer.render(&records);
    assert_eq!(host.surface.child_count(), records.len());

    // Whether the profile chose lazy or synchronous rendering, reporting
    // every item visible must converge to a fully materialized list
    for record in &records {
        renderer.notify_visible(record["id"].as_str().unwrap());
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(host.surface.rendered_count(), records.len());
    assert_eq!(coordinator.context().lazy.materialized_count(), records.len());
}

// ============================================================================
// Opt-in rate-limited wrappers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_wrapped_validation_coalesces_a_burst() {
    let host = host();
    let coordinator = OptimizationCoordinator::bootstrap(host.bindings, CoordinatorConfig::default())
        .await
        .unwrap();
    // Pin the base delay so the test does not depend on the host machine's
    // classification
    coordinator
        .context()
        .debouncer
        .set_base_delay(Duration::from_millis(300));

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let validate = coordinator.wrap_validation(
        "booking-form",
        Arc::new(move |value: u32| {
            sink.lock().push(value);
            Ok(())
        }),
    );

    for value in 1..=5 {
        validate.call(value);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(*seen.lock(), vec![5], "only the last value of the burst validated");
}

#[tokio::test(start_paused = true)]
async fn test_wrapped_scroll_handler_rate_limits() {
    let host = host();
    let coordinator = OptimizationCoordinator::bootstrap(host.bindings, CoordinatorConfig::default())
        .await
        .unwrap();
    coordinator
        .context()
        .throttler
        .set_base_delay(Duration::from_millis(200));

    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    let on_scroll = coordinator.wrap_scroll_handler(
        "appointments-list",
        Arc::new(move |_: ()| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    for _ in 0..10 {
        on_scroll.call(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Leading edge fired immediately, the burst coalesced into one trailing
    assert_eq!(count.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_restore_hands_back_working_originals() {
    let host = host();
    let coordinator = OptimizationCoordinator::bootstrap(host.bindings, CoordinatorConfig::default())
        .await
        .unwrap();
    let loader = coordinator.wrapped_loader();
    loader.load(&HashMap::new()).await.unwrap();

    let originals = coordinator.restore_original_functions();
    // Wrapper now passes through on every call
    loader.load(&HashMap::new()).await.unwrap();
    loader.load(&HashMap::new()).await.unwrap();
    assert_eq!(host.source.calls.load(Ordering::SeqCst), 3);

    // And the returned bindings are the host's own
    originals.data_source.load(&HashMap::new()).await.unwrap();
    assert_eq!(host.source.calls.load(Ordering::SeqCst), 4);
}
