//! Lazy Renderer
//!
//! Defers materialization of list items until they are about to become
//! visible:
//! - One fixed-height placeholder per item, so layout never shifts
//! - Eager materialization of the first half batch for a non-empty first
//!   paint
//! - Visibility-driven queue drained in batches with an inter-batch yield
//! - One materialization per source id, fail-soft per item

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::paginate::{field_by_names, fields};

/// A fully rendered list element, ready for the host container
#[derive(Debug, Clone)]
pub struct RenderedNode {
    /// Stable per-record identity
    pub id: String,
    /// Host-defined markup/content
    pub content: String,
}

/// Host-supplied item renderer
pub trait ItemRenderer: Send + Sync {
    /// Render one record; a failure skips only that record
    fn render(&self, id: &str, item: &Value) -> anyhow::Result<RenderedNode>;
}

/// Host-supplied list container. Rendered and placeholder elements carry
/// the per-record id so update/remove can address them.
pub trait ListSurface: Send + Sync {
    /// Remove every child
    fn clear(&self);
    /// Insert a fixed-height placeholder for `id`
    fn insert_placeholder(&self, id: &str, height_px: u32);
    /// Swap the placeholder (or previous node) for `id` with `node`;
    /// returns false when no element with that id exists
    fn replace_with_rendered(&self, id: &str, node: RenderedNode) -> bool;
    /// Remove the element for `id`, placeholder or rendered
    fn remove(&self, id: &str);
    /// Current child count
    fn child_count(&self) -> usize;
}

/// Lazy renderer tuning
#[derive(Debug, Clone)]
pub struct LazyRendererConfig {
    /// Items materialized per drain batch
    pub batch_size: usize,
    /// Placeholder height, to avoid layout shift
    pub placeholder_height_px: u32,
    /// Lookahead margin handed to the host's visibility observer
    pub lookahead_margin_px: u32,
    /// Yield between drain batches so the UI thread is never blocked long
    pub inter_batch_delay: Duration,
    /// When false, every item renders synchronously
    pub enabled: bool,
}

impl Default for LazyRendererConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            placeholder_height_px: 80,
            lookahead_margin_px: 100,
            inter_batch_delay: Duration::from_millis(16),
            enabled: true,
        }
    }
}

struct DeferredItem {
    payload: Value,
    materialized: bool,
    queued: bool,
}

/// Defers DOM materialization of list items until they near visibility
pub struct LazyRenderer {
    renderer: Arc<dyn ItemRenderer>,
    surface: Arc<dyn ListSurface>,
    config: Mutex<LazyRendererConfig>,
    items: Mutex<HashMap<String, DeferredItem>>,
    /// Insertion order, for the eager first batch and deterministic drains
    order: Mutex<Vec<String>>,
    queue: Mutex<VecDeque<String>>,
    draining: AtomicBool,
}

impl LazyRenderer {
    pub fn new(
        renderer: Arc<dyn ItemRenderer>,
        surface: Arc<dyn ListSurface>,
        config: LazyRendererConfig,
    ) -> Self {
        Self {
            renderer,
            surface,
            config: Mutex::new(config),
            items: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Stable id for a record: the id field chain, falling back to position
    fn item_id(item: &Value, index: usize) -> String {
        field_by_names(item, fields::ID)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| format!("idx-{index}"))
    }

    /// Hand a list to the renderer. Disabled profiles render everything
    /// synchronously; otherwise placeholders go up and the first half batch
    /// materializes eagerly.
    pub fn process_list(&self, list: &[Value]) {
        let config = self.config.lock().clone();
        self.surface.clear();
        self.queue.lock().clear();
        {
            let mut items = self.items.lock();
            let mut order = self.order.lock();
            items.clear();
            order.clear();
            for (index, item) in list.iter().enumerate() {
                let id = Self::item_id(item, index);
                items.insert(
                    id.clone(),
                    DeferredItem {
                        payload: item.clone(),
                        materialized: false,
                        queued: false,
                    },
                );
                order.push(id);
            }
        }

        if !config.enabled {
            let ids: Vec<String> = self.order.lock().clone();
            for id in ids {
                // Synchronous path still goes through a placeholder so the
                // surface contract (replace by id) holds
                self.surface.insert_placeholder(&id, config.placeholder_height_px);
                self.materialize(&id);
            }
            return;
        }

        let ids: Vec<String> = self.order.lock().clone();
        for id in &ids {
            self.surface.insert_placeholder(id, config.placeholder_height_px);
        }
        // Eager first half batch so the initial paint is not empty
        let eager = (config.batch_size / 2).max(1).min(ids.len());
        for id in ids.iter().take(eager) {
            self.materialize(id);
        }
    }

    /// Visibility notification from the host observer: queue `id` for the
    /// next drain batch
    pub fn notify_visible(self: &Arc<Self>, id: &str) {
        {
            let mut items = self.items.lock();
            match items.get_mut(id) {
                Some(item) if !item.materialized && !item.queued => {
                    item.queued = true;
                }
                _ => return,
            }
            self.queue.lock().push_back(id.to_string());
        }
        self.ensure_drain_task();
    }

    fn ensure_drain_task(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let renderer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (batch, delay) = {
                    let config = renderer.config.lock().clone();
                    let mut queue = renderer.queue.lock();
                    let take = config.batch_size.min(queue.len());
                    let batch: Vec<String> = queue.drain(..take).collect();
                    (batch, config.inter_batch_delay)
                };
                if batch.is_empty() {
                    renderer.draining.store(false, Ordering::Release);
                    // A notify may have slipped in between the drain and the
                    // flag reset; pick it up rather than strand it
                    if !renderer.queue.lock().is_empty()
                        && !renderer.draining.swap(true, Ordering::AcqRel)
                    {
                        continue;
                    }
                    break;
                }
                for id in &batch {
                    renderer.materialize(id);
                }
                tokio::time::sleep(delay).await;
            }
        });
    }

    /// Materialize one item: render, swap the placeholder, mark done.
    /// A failure removes only this item's placeholder and moves on.
    fn materialize(&self, id: &str) {
        let payload = {
            let mut items = self.items.lock();
            match items.get_mut(id) {
                Some(item) if !item.materialized => {
                    item.materialized = true;
                    item.queued = false;
                    item.payload.clone()
                }
                _ => return,
            }
        };
        match self.renderer.render(id, &payload) {
            Ok(node) => {
                if !self.surface.replace_with_rendered(id, node) {
                    tracing::debug!(id, "materialize target missing from surface");
                }
            }
            Err(e) => {
                tracing::warn!(id, "item render failed, removing placeholder: {e:#}");
                self.surface.remove(id);
                self.items.lock().remove(id);
            }
        }
    }

    /// Append one item, deferred like the rest of the list
    pub fn add_item(&self, item: &Value) {
        let index = self.order.lock().len();
        let id = Self::item_id(item, index);
        let config = self.config.lock().clone();
        {
            let mut items = self.items.lock();
            if items.contains_key(&id) {
                return;
            }
            items.insert(
                id.clone(),
                DeferredItem {
                    payload: item.clone(),
                    materialized: false,
                    queued: false,
                },
            );
            self.order.lock().push(id.clone());
        }
        self.surface.insert_placeholder(&id, config.placeholder_height_px);
        if !config.enabled {
            self.materialize(&id);
        }
    }

    /// Remove an item and its element, materialized or not
    pub fn remove_item(&self, id: &str) {
        self.items.lock().remove(id);
        self.order.lock().retain(|existing| existing != id);
        self.surface.remove(id);
    }

    /// Update an item's payload. Already-materialized items re-render in
    /// place (an update, not a second materialization); deferred items just
    /// get the fresh payload.
    pub fn update_item(&self, id: &str, item: &Value) {
        let was_materialized = {
            let mut items = self.items.lock();
            match items.get_mut(id) {
                Some(existing) => {
                    existing.payload = item.clone();
                    existing.materialized
                }
                None => return,
            }
        };
        if was_materialized {
            match self.renderer.render(id, item) {
                Ok(node) => {
                    self.surface.replace_with_rendered(id, node);
                }
                Err(e) => {
                    tracing::warn!(id, "item re-render failed, keeping stale node: {e:#}");
                }
            }
        }
    }

    /// Retune from a profile reclassification
    pub fn set_enabled(&self, enabled: bool) {
        self.config.lock().enabled = enabled;
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        self.config.lock().batch_size = batch_size.max(1);
    }

    /// Lookahead margin for the host's visibility observer
    pub fn lookahead_margin_px(&self) -> u32 {
        self.config.lock().lookahead_margin_px
    }

    /// How many items have been materialized so far
    pub fn materialized_count(&self) -> usize {
        self.items.lock().values().filter(|i| i.materialized).count()
    }

    /// Ids still waiting for visibility
    pub fn deferred_ids(&self) -> Vec<String> {
        let items = self.items.lock();
        self.order
            .lock()
            .iter()
            .filter(|id| items.get(*id).map(|i| !i.materialized).unwrap_or(false))
            .cloned()
            .collect()
    }
}
