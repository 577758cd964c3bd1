//! Paged loading over an offset-addressed source.
//!
//! A [`Pager`] owns one [`PagingSource`] and the items loaded from it so far.
//! Pages are pulled on demand in three independent regions (refresh, prepend,
//! append), each with its own [`LoadState`]. Every change is published as a
//! [`PagingSnapshot`] on a watch channel, so observers always see the latest
//! items together with the load states that produced them.
//!
//! Loads run as tokio tasks. A refresh supersedes any in-flight load, and
//! [`Pager::cancel`] stops the pager for good; results of superseded loads are
//! dropped instead of being merged.

use crate::catalog::CatalogError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// A source of items addressed by offset.
pub trait PagingSource: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    fn load(
        &self,
        request: LoadRequest,
    ) -> impl Future<Output = Result<Page<Self::Item>, CatalogError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Offset of the first item in `items`.
    pub offset: usize,
    /// Where the preceding data ends, if there is any.
    pub prev_offset: Option<usize>,
    /// Where the following data starts, if there is any.
    pub next_offset: Option<usize>,
}

impl<T> Page<T> {
    /// Page for an offset/limit query: a full page means there may be more.
    pub fn from_offset(request: LoadRequest, items: Vec<T>) -> Self {
        let next_offset = (request.limit > 0 && items.len() >= request.limit)
            .then(|| request.offset + items.len());
        let prev_offset = (request.offset > 0).then_some(request.offset);
        Self {
            items,
            offset: request.offset,
            prev_offset,
            next_offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PagingConfig {
    pub page_size: usize,
    /// Size of the first (refresh) load.
    pub initial_load_size: usize,
    /// Offset the refresh load starts at. Anything before it is reachable
    /// through prepend.
    pub initial_offset: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }
}

impl PagingConfig {
    pub fn with_page_size(page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            page_size,
            initial_load_size: page_size * 3,
            initial_offset: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LoadState {
    NotLoading { end_of_pagination_reached: bool },
    Loading,
    Error(Arc<CatalogError>),
}

impl LoadState {
    const IDLE: LoadState = LoadState::NotLoading {
        end_of_pagination_reached: false,
    };

    fn done(end_of_pagination_reached: bool) -> Self {
        LoadState::NotLoading {
            end_of_pagination_reached,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }

    pub fn error(&self) -> Option<&Arc<CatalogError>> {
        match self {
            LoadState::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn end_of_pagination_reached(&self) -> bool {
        matches!(
            self,
            LoadState::NotLoading {
                end_of_pagination_reached: true
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRegion {
    Refresh,
    Prepend,
    Append,
}

impl LoadRegion {
    const ALL: [LoadRegion; 3] = [LoadRegion::Refresh, LoadRegion::Prepend, LoadRegion::Append];

    fn index(self) -> usize {
        match self {
            LoadRegion::Refresh => 0,
            LoadRegion::Prepend => 1,
            LoadRegion::Append => 2,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LoadRegion::Refresh => "refresh",
            LoadRegion::Prepend => "prepend",
            LoadRegion::Append => "append",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadStates {
    pub refresh: LoadState,
    pub prepend: LoadState,
    pub append: LoadState,
}

impl Default for LoadStates {
    fn default() -> Self {
        Self {
            refresh: LoadState::IDLE,
            prepend: LoadState::IDLE,
            append: LoadState::IDLE,
        }
    }
}

impl LoadStates {
    pub fn get(&self, region: LoadRegion) -> &LoadState {
        match region {
            LoadRegion::Refresh => &self.refresh,
            LoadRegion::Prepend => &self.prepend,
            LoadRegion::Append => &self.append,
        }
    }

    fn set(&mut self, region: LoadRegion, state: LoadState) {
        match region {
            LoadRegion::Refresh => self.refresh = state,
            LoadRegion::Prepend => self.prepend = state,
            LoadRegion::Append => self.append = state,
        }
    }

    pub fn is_idle(&self) -> bool {
        !(self.refresh.is_loading() || self.prepend.is_loading() || self.append.is_loading())
    }

    /// First error, checking refresh, then prepend, then append.
    pub fn error(&self) -> Option<&Arc<CatalogError>> {
        self.refresh
            .error()
            .or_else(|| self.prepend.error())
            .or_else(|| self.append.error())
    }
}

/// Items loaded so far plus the load states that produced them.
#[derive(Debug, Clone)]
pub struct PagingSnapshot<T> {
    pub items: Vec<T>,
    /// Offset of `items[0]` in the source.
    pub first_offset: usize,
    pub load_states: LoadStates,
}

impl<T> Default for PagingSnapshot<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            first_offset: 0,
            load_states: LoadStates::default(),
        }
    }
}

impl<T> PagingSnapshot<T> {
    /// A successful refresh that produced nothing, as opposed to a failure.
    pub fn is_empty_result(&self) -> bool {
        self.items.is_empty()
            && matches!(self.load_states.refresh, LoadState::NotLoading { .. })
            && self.load_states.append.end_of_pagination_reached()
            && self.load_states.prepend.end_of_pagination_reached()
    }
}

struct PagerState<T> {
    items: Vec<T>,
    first_offset: usize,
    prev_offset: Option<usize>,
    next_offset: Option<usize>,
    load_states: LoadStates,
    /// A refresh has completed successfully at least once.
    loaded: bool,
    /// Bumped on refresh and cancel; loads from older epochs are discarded.
    epoch: u64,
    cancelled: bool,
    tasks: [Option<AbortHandle>; 3],
}

impl<T: Clone> PagerState<T> {
    fn snapshot(&self) -> PagingSnapshot<T> {
        PagingSnapshot {
            items: self.items.clone(),
            first_offset: self.first_offset,
            load_states: self.load_states.clone(),
        }
    }

    fn abort_all(&mut self) {
        for task in self.tasks.iter_mut() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

struct PagerInner<S: PagingSource> {
    source: S,
    config: PagingConfig,
    state: Mutex<PagerState<S::Item>>,
    tx: watch::Sender<PagingSnapshot<S::Item>>,
}

impl<S: PagingSource> PagerInner<S> {
    fn publish(&self, state: &PagerState<S::Item>) {
        self.tx.send_replace(state.snapshot());
    }

    async fn run(self: Arc<Self>, region: LoadRegion, request: LoadRequest, epoch: u64) {
        let result = self.source.load(request).await;
        self.complete(region, request, epoch, result);
    }

    fn complete(
        &self,
        region: LoadRegion,
        request: LoadRequest,
        epoch: u64,
        result: Result<Page<S::Item>, CatalogError>,
    ) {
        let mut state = self.state.lock();
        if state.cancelled || state.epoch != epoch {
            debug!(
                region = region.as_str(),
                offset = request.offset,
                "dropping superseded page"
            );
            return;
        }
        state.tasks[region.index()] = None;

        match result {
            Ok(page) => {
                debug!(
                    region = region.as_str(),
                    offset = page.offset,
                    count = page.items.len(),
                    "page loaded"
                );
                match region {
                    LoadRegion::Refresh => {
                        state.items = page.items;
                        state.first_offset = page.offset;
                        state.prev_offset = page.prev_offset;
                        state.next_offset = page.next_offset;
                        state.loaded = true;
                        state.load_states.refresh = LoadState::done(false);
                        state.load_states.prepend = LoadState::done(page.prev_offset.is_none());
                        state.load_states.append = LoadState::done(page.next_offset.is_none());
                    }
                    LoadRegion::Append => {
                        state.items.extend(page.items);
                        state.next_offset = page.next_offset;
                        state.load_states.append = LoadState::done(page.next_offset.is_none());
                    }
                    LoadRegion::Prepend => {
                        let mut items = page.items;
                        items.append(&mut state.items);
                        state.items = items;
                        state.first_offset = page.offset;
                        state.prev_offset = page.prev_offset;
                        state.load_states.prepend = LoadState::done(page.prev_offset.is_none());
                    }
                }
            }
            Err(err) => {
                warn!(
                    region = region.as_str(),
                    offset = request.offset,
                    error = %err,
                    "page load failed"
                );
                state
                    .load_states
                    .set(region, LoadState::Error(Arc::new(err)));
            }
        }
        self.publish(&state);
    }
}

/// Paged view over one source. Cheap to clone; clones share state.
///
/// Loads are spawned on the ambient tokio runtime, so the load-triggering
/// methods must be called from within one.
pub struct Pager<S: PagingSource> {
    inner: Arc<PagerInner<S>>,
}

impl<S: PagingSource> Clone for Pager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PagingSource> std::fmt::Debug for Pager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pager")
            .field("items", &state.items.len())
            .field("first_offset", &state.first_offset)
            .field("load_states", &state.load_states)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

impl<S: PagingSource> Pager<S> {
    /// Create an idle pager. Nothing is loaded until [`Pager::refresh`].
    pub fn new(source: S, config: PagingConfig) -> Self {
        let state = PagerState {
            items: Vec::new(),
            first_offset: config.initial_offset,
            prev_offset: None,
            next_offset: None,
            load_states: LoadStates::default(),
            loaded: false,
            epoch: 0,
            cancelled: false,
            tasks: [None, None, None],
        };
        let (tx, _rx) = watch::channel(state.snapshot());
        Self {
            inner: Arc::new(PagerInner {
                source,
                config,
                state: Mutex::new(state),
                tx,
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn subscribe(&self) -> watch::Receiver<PagingSnapshot<S::Item>> {
        self.inner.tx.subscribe()
    }

    pub fn snapshot(&self) -> PagingSnapshot<S::Item> {
        self.inner.tx.borrow().clone()
    }

    pub fn load_states(&self) -> LoadStates {
        self.inner.state.lock().load_states.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// (Re)load from the initial offset, superseding any in-flight load.
    pub fn refresh(&self) -> bool {
        self.launch(LoadRegion::Refresh)
    }

    /// Load the page after the last loaded item.
    ///
    /// Returns false when nothing was started: no successful refresh yet, an
    /// append already running, or the end already reached.
    pub fn load_next(&self) -> bool {
        self.launch(LoadRegion::Append)
    }

    /// Load the page before the first loaded item.
    pub fn load_previous(&self) -> bool {
        self.launch(LoadRegion::Prepend)
    }

    /// Re-run every region whose last load failed. Returns how many started.
    pub fn retry(&self) -> usize {
        let failed: Vec<LoadRegion> = {
            let state = self.inner.state.lock();
            LoadRegion::ALL
                .into_iter()
                .filter(|r| state.load_states.get(*r).error().is_some())
                .collect()
        };
        failed.into_iter().filter(|r| self.launch(*r)).count()
    }

    /// Stop this pager: abort in-flight loads and ignore all later triggers.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.epoch += 1;
        state.abort_all();
        for region in LoadRegion::ALL {
            if state.load_states.get(region).is_loading() {
                state.load_states.set(region, LoadState::IDLE);
            }
        }
        debug!(items = state.items.len(), "pager cancelled");
        self.inner.publish(&state);
    }

    fn launch(&self, region: LoadRegion) -> bool {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            return false;
        }
        let config = &self.inner.config;

        let request = match region {
            LoadRegion::Refresh => {
                state.epoch += 1;
                state.abort_all();
                state.load_states.prepend = LoadState::IDLE;
                state.load_states.append = LoadState::IDLE;
                LoadRequest {
                    offset: config.initial_offset,
                    limit: config.initial_load_size.max(1),
                }
            }
            LoadRegion::Append => {
                if !state.loaded
                    || state.load_states.refresh.is_loading()
                    || state.load_states.append.is_loading()
                {
                    return false;
                }
                let Some(offset) = state.next_offset else {
                    return false;
                };
                LoadRequest {
                    offset,
                    limit: config.page_size,
                }
            }
            LoadRegion::Prepend => {
                if !state.loaded
                    || state.load_states.refresh.is_loading()
                    || state.load_states.prepend.is_loading()
                {
                    return false;
                }
                let Some(end) = state.prev_offset else {
                    return false;
                };
                let offset = end.saturating_sub(config.page_size);
                LoadRequest {
                    offset,
                    limit: end - offset,
                }
            }
        };

        state.load_states.set(region, LoadState::Loading);
        let epoch = state.epoch;
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(inner.run(region, request, epoch));
        state.tasks[region.index()] = Some(handle.abort_handle());
        debug!(
            region = region.as_str(),
            offset = request.offset,
            limit = request.limit,
            "page load started"
        );
        self.inner.publish(&state);
        true
    }

    /// Wait until no region is loading and return that snapshot.
    pub async fn settled(&self) -> PagingSnapshot<S::Item> {
        let mut rx = self.subscribe();
        match rx.wait_for(|snapshot| snapshot.load_states.is_idle()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Drive the pager and return every item it can reach.
    ///
    /// Starts the refresh if it never ran, then appends page after page
    /// until the end, or until `max_appends` further pages were loaded. The
    /// first failure is returned instead of the items, and a pager that is
    /// or becomes cancelled yields [`CatalogError::Cancelled`].
    pub async fn collect(
        &self,
        max_appends: Option<usize>,
    ) -> Result<Vec<S::Item>, Arc<CatalogError>> {
        if self.is_cancelled() {
            return Err(Arc::new(CatalogError::Cancelled));
        }
        let needs_refresh = {
            let state = self.inner.state.lock();
            !state.loaded && matches!(state.load_states.refresh, LoadState::NotLoading { .. })
        };
        if needs_refresh {
            self.refresh();
        }

        let snapshot = self.settled().await;
        if let Some(err) = snapshot.load_states.refresh.error() {
            return Err(Arc::clone(err));
        }

        let mut appended = 0;
        while max_appends.is_none_or(|max| appended < max) {
            if !self.load_next() {
                break;
            }
            appended += 1;
            let snapshot = self.settled().await;
            if let Some(err) = snapshot.load_states.append.error() {
                return Err(Arc::clone(err));
            }
        }

        if self.is_cancelled() {
            return Err(Arc::new(CatalogError::Cancelled));
        }
        Ok(self.snapshot().items)
    }
}
