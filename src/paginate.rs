//! Dynamic Paginator
//!
//! Deterministic filter/sort/slice over in-memory record collections:
//! - Logical AND of filter predicates
//! - Stable sort with nested dot-path field resolution, case-insensitive
//!   for strings
//! - 1-based start/end indices and ceil page counts
//! - An "all" page size that bypasses slicing on ample machines
//! - An infinite-scroll driver over a host page loader and scroll container
//! - Appointment helpers: free-text, date-bucket, and status filters with
//!   fallback field chains for the host's varying record field names

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use serde_json::Value;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Page size: a concrete limit, or everything in one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Limit(usize),
    /// Bypass slicing entirely; used automatically on ample machines
    All,
}

/// A filter predicate over one record
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Computes a sort value for one record, for sorts no single dot-path can
/// express (fallback field chains, mixed date formats)
pub type SortValueFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// One pagination request. Values, recomputed per call; no persisted
/// identity.
#[derive(Clone)]
pub struct PaginationQuery {
    /// 1-based page number
    pub page: usize,
    pub page_size: PageSize,
    /// Dot-path into the record (`"client.name"`); `None` keeps input order
    pub sort_key: Option<String>,
    /// Computed sort value; takes precedence over `sort_key`
    pub sort_value: Option<SortValueFn>,
    pub sort_order: SortOrder,
    /// ANDed together
    pub filters: Vec<Predicate>,
}

impl PaginationQuery {
    pub fn new(page: usize, page_size: PageSize) -> Self {
        Self {
            page,
            page_size,
            sort_key: None,
            sort_value: None,
            sort_order: SortOrder::default(),
            filters: Vec::new(),
        }
    }

    pub fn sorted_by(mut self, key: impl Into<String>, order: SortOrder) -> Self {
        self.sort_key = Some(key.into());
        self.sort_order = order;
        self
    }

    /// Sort by a computed value instead of a dot-path
    pub fn sorted_by_value(mut self, extract: SortValueFn, order: SortOrder) -> Self {
        self.sort_value = Some(extract);
        self.sort_order = order;
        self
    }

    pub fn with_filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }
}

/// One page of results plus its navigation metadata
#[derive(Debug, Clone, Serialize)]
pub struct PaginationResult {
    pub items: Vec<Value>,
    pub current_page: usize,
    /// Resolved page size (total item count when the query asked for all)
    pub page_size: usize,
    pub total_items: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
    /// 1-based position of the first item on this page; 0 when empty
    pub start_index: usize,
    /// 1-based position of the last item on this page; 0 when empty
    pub end_index: usize,
}

/// Resolve a dot-path (`"client.name"`) into a record
pub fn field_by_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Resolve the first present field from a fallback chain of names. Host
/// records spell the same field differently (`date`/`data`,
/// `time`/`horario`/`hora`), so every consumer reads through one of these.
pub fn field_by_names<'a>(record: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| field_by_path(record, name))
}

/// Field chains for the appointment-like records this subsystem sees
pub mod fields {
    pub const DATE: &[&str] = &["date", "data"];
    pub const TIME: &[&str] = &["time", "horario", "hora"];
    pub const STATUS: &[&str] = &["status"];
    pub const TITLE: &[&str] = &["title", "titulo", "name", "nome"];
    pub const DESCRIPTION: &[&str] = &["description", "descricao", "observacoes", "notes"];
    pub const ID: &[&str] = &["id", "_id", "uuid"];
}

/// Compare two field values for sorting: numbers naturally, strings
/// case-insensitively, missing values last
fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(va), Some(vb)) => match (va.as_f64(), vb.as_f64()) {
            (Some(na), Some(nb)) => na.partial_cmp(&nb).unwrap_or(Ordering::Equal),
            _ => {
                let sa = value_sort_text(va);
                let sb = value_sort_text(vb);
                sa.cmp(&sb)
            }
        },
    }
}

fn value_sort_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

/// Deterministic filter/sort/slice. Stateless; one instance serves the
/// whole application.
#[derive(Default)]
pub struct DynamicPaginator;

impl DynamicPaginator {
    pub fn new() -> Self {
        Self
    }

    /// Apply filters, then the stable sort, then the page slice
    pub fn paginate(&self, collection: &[Value], query: &PaginationQuery) -> PaginationResult {
        let mut filtered: Vec<Value> = collection
            .iter()
            .filter(|record| query.filters.iter().all(|p| p(record)))
            .cloned()
            .collect();

        if let Some(extract) = &query.sort_value {
            // sort_by is stable: equal keys keep input order
            filtered.sort_by(|a, b| {
                let (va, vb) = (extract(a), extract(b));
                let ord = compare_fields(va.as_ref(), vb.as_ref());
                match query.sort_order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        } else if let Some(key) = &query.sort_key {
            filtered.sort_by(|a, b| {
                let ord = compare_fields(field_by_path(a, key), field_by_path(b, key));
                match query.sort_order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        let total_items = filtered.len();
        let page = query.page.max(1);
        let page_size = match query.page_size {
            PageSize::Limit(n) => n.max(1),
            PageSize::All => total_items.max(1),
        };
        let total_pages = total_items.div_ceil(page_size);

        let offset = (page - 1) * page_size;
        let items: Vec<Value> = filtered.into_iter().skip(offset).take(page_size).collect();

        let (start_index, end_index) = if items.is_empty() {
            (0, 0)
        } else {
            (offset + 1, offset + items.len())
        };

        PaginationResult {
            current_page: page,
            page_size,
            total_items,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1 && total_items > 0,
            start_index,
            end_index,
            items,
        }
    }

    /// Paginate appointment-like records with the composed domain filters
    pub fn paginate_appointments(
        &self,
        collection: &[Value],
        filter: &AppointmentFilter,
        page: usize,
        page_size: PageSize,
        today: NaiveDate,
    ) -> PaginationResult {
        self.paginate(collection, &appointment_query(filter, page, page_size, today))
    }
}

/// Date buckets computed by date-only comparison; time-of-day is ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBucket {
    Today,
    Tomorrow,
    ThisWeek,
    ThisMonth,
}

impl DateBucket {
    /// Whether `date` falls in this bucket relative to `today`
    pub fn contains(&self, date: NaiveDate, today: NaiveDate) -> bool {
        match self {
            DateBucket::Today => date == today,
            DateBucket::Tomorrow => today.succ_opt().map(|t| date == t).unwrap_or(false),
            DateBucket::ThisWeek => {
                date.iso_week().year() == today.iso_week().year()
                    && date.iso_week().week() == today.iso_week().week()
            }
            DateBucket::ThisMonth => date.year() == today.year() && date.month() == today.month(),
        }
    }
}

/// Parse the record's date field through its fallback chain
pub fn appointment_date(record: &Value) -> Option<NaiveDate> {
    let raw = field_by_names(record, fields::DATE)?.as_str()?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

/// Optional appointment filters, composed by logical AND
#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    /// Free-text match against title and description
    pub text: Option<String>,
    /// Date-bucket restriction
    pub bucket: Option<DateBucket>,
    /// Exact status match
    pub status: Option<String>,
}

/// Build the query for an appointment listing: the three optional filters
/// plus the default descending-date sort. The sort resolves dates through
/// the fallback field chain and both accepted formats, so `data` records
/// and `dd/mm/yyyy` dates order correctly alongside the rest.
pub fn appointment_query(
    filter: &AppointmentFilter,
    page: usize,
    page_size: PageSize,
    today: NaiveDate,
) -> PaginationQuery {
    let mut query = PaginationQuery::new(page, page_size).sorted_by_value(
        Arc::new(|record| {
            appointment_date(record).map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
        }),
        SortOrder::Desc,
    );

    if let Some(text) = &filter.text {
        let needle = text.to_lowercase();
        query = query.with_filter(Arc::new(move |record| {
            let title = field_by_names(record, fields::TITLE)
                .and_then(Value::as_str)
                .unwrap_or("");
            let description = field_by_names(record, fields::DESCRIPTION)
                .and_then(Value::as_str)
                .unwrap_or("");
            title.to_lowercase().contains(&needle)
                || description.to_lowercase().contains(&needle)
        }));
    }

    if let Some(bucket) = filter.bucket {
        query = query.with_filter(Arc::new(move |record| {
            appointment_date(record)
                .map(|date| bucket.contains(date, today))
                .unwrap_or(false)
        }));
    }

    if let Some(status) = &filter.status {
        let wanted = status.clone();
        query = query.with_filter(Arc::new(move |record| {
            field_by_names(record, fields::STATUS)
                .and_then(Value::as_str)
                .map(|s| s == wanted)
                .unwrap_or(false)
        }));
    }

    query
}

/// Host-supplied async page loader
#[async_trait]
pub trait PageLoader: Send + Sync {
    /// Load one 1-based page; an empty or short page means exhaustion
    async fn load_page(&self, page: usize, page_size: usize) -> anyhow::Result<Vec<Value>>;
}

/// Host-supplied scroll container: position metrics plus a single batched
/// append per load
pub trait ScrollView: Send + Sync {
    /// Scrolled distance from the top, pixels
    fn scroll_top(&self) -> f64;
    /// Total scrollable content height, pixels
    fn scroll_height(&self) -> f64;
    /// Visible viewport height, pixels
    fn viewport_height(&self) -> f64;
    /// Append a loaded page as one batch
    fn append_batch(&self, items: &[Value]);
}

/// Infinite-scroll driver: when the host reports a scroll position within
/// `threshold_px` of the bottom, the next page is requested and appended.
/// Triggers arriving while a load is in flight are ignored.
pub struct InfiniteScroller {
    loader: Arc<dyn PageLoader>,
    view: Arc<dyn ScrollView>,
    page_size: usize,
    threshold_px: f64,
    next_page: AtomicUsize,
    loading: AtomicBool,
    exhausted: AtomicBool,
}

impl InfiniteScroller {
    pub fn new(
        loader: Arc<dyn PageLoader>,
        view: Arc<dyn ScrollView>,
        page_size: usize,
        threshold_px: f64,
    ) -> Self {
        Self {
            loader,
            view,
            page_size: page_size.max(1),
            threshold_px,
            next_page: AtomicUsize::new(1),
            loading: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Whether the scroll position is within the threshold of the bottom
    pub fn near_bottom(&self) -> bool {
        let remaining =
            self.view.scroll_height() - (self.view.scroll_top() + self.view.viewport_height());
        remaining <= self.threshold_px
    }

    /// Whether more pages remain
    pub fn has_more(&self) -> bool {
        !self.exhausted.load(Ordering::Acquire)
    }

    /// Scroll notification from the (throttled) host handler
    pub async fn on_scroll(&self) -> anyhow::Result<usize> {
        if !self.near_bottom() {
            return Ok(0);
        }
        self.load_next().await
    }

    /// Load and append the next page. Returns the number of appended items;
    /// 0 when exhausted or when a load was already in flight.
    pub async fn load_next(&self) -> anyhow::Result<usize> {
        if self.exhausted.load(Ordering::Acquire) {
            return Ok(0);
        }
        if self.loading.swap(true, Ordering::AcqRel) {
            // At most one load in flight; this trigger is dropped
            return Ok(0);
        }
        let page = self.next_page.load(Ordering::Acquire);
        let result = self.loader.load_page(page, self.page_size).await;
        match result {
            Ok(items) => {
                if items.len() < self.page_size {
                    self.exhausted.store(true, Ordering::Release);
                }
                if !items.is_empty() {
                    self.view.append_batch(&items);
                    self.next_page.store(page + 1, Ordering::Release);
                }
                self.loading.store(false, Ordering::Release);
                Ok(items.len())
            }
            Err(e) => {
                self.loading.store(false, Ordering::Release);
                tracing::warn!(page, "infinite scroll page load failed: {e:#}");
                Err(e)
            }
        }
    }
}
