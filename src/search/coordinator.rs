//! Search session coordinator.
//!
//! Mediates between what the user types, the query that actually drives the
//! paged city results, and the query history. Commands come in through
//! [`SearchCoordinator::dispatch`]; state goes out through watch channels
//! (displayed text, history, results) and a one-shot navigation queue.
//!
//! The results stream is only rebuilt when the committed query changes under
//! case-insensitive comparison. Rebuilding cancels the previous pager before
//! the new one is published, so observers never see pages from two queries
//! interleaved.

use crate::catalog::{CatalogError, CityCatalogSource};
use crate::history::{HistoryError, HistoryList, QueryHistoryStore};
use crate::model::{City, SearchQuery};
use crate::paging::{Pager, PagingConfig, PagingSource};
use crate::storage::StorageError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchCommand {
    /// The user edited the search box.
    TextChanged(String),
    /// Search for the displayed text and record it in history.
    Submit,
    /// Re-run the search for the displayed text.
    Retry,
    ClearQuery,
    SelectHistoryItem(SearchQuery),
    RemoveHistoryItem(SearchQuery),
    SelectCity(City),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavigationIntent {
    SelectedCity(City),
}

/// The current results stream and the query it was built for.
pub struct PagedResults<P: PagingSource> {
    pub query: String,
    /// Increases by one every time a new stream is built.
    pub generation: u64,
    /// `Err` when the catalog could not build a stream for `query`.
    pub pager: Result<Pager<P>, Arc<CatalogError>>,
}

impl<P: PagingSource> Clone for PagedResults<P> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            generation: self.generation,
            pager: self.pager.clone(),
        }
    }
}

impl<P: PagingSource> std::fmt::Debug for PagedResults<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedResults")
            .field("query", &self.query)
            .field("generation", &self.generation)
            .field("pager", &self.pager)
            .finish()
    }
}

/// Receiving end of the navigation queue.
///
/// Clones share one queue: each intent is delivered to exactly one receiver.
/// Intents sent while nobody is listening stay buffered.
#[derive(Clone)]
pub struct NavigationIntents {
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<NavigationIntent>>>,
}

impl NavigationIntents {
    /// Wait for the next intent. `None` once the coordinator is gone and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<NavigationIntent> {
        self.rx.lock().await.recv().await
    }

    /// Take a buffered intent without waiting.
    pub fn try_recv(&self) -> Option<NavigationIntent> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// A history write started by a command.
///
/// The write runs on its own task; dropping this does not cancel it.
#[derive(Debug)]
pub struct PendingMutation {
    handle: JoinHandle<Result<(), HistoryError>>,
}

impl PendingMutation {
    pub async fn wait(self) -> Result<(), HistoryError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join) => Err(HistoryError::Storage(StorageError::Worker(join))),
        }
    }
}

struct CommitState {
    committed: String,
    generation: u64,
}

pub struct SearchCoordinator<H: QueryHistoryStore, C: CityCatalogSource> {
    history: Arc<H>,
    catalog: Arc<C>,
    paging: PagingConfig,
    displayed: watch::Sender<String>,
    state: Mutex<CommitState>,
    results: watch::Sender<PagedResults<C::Pages>>,
    nav_tx: mpsc::UnboundedSender<NavigationIntent>,
    nav_rx: NavigationIntents,
}

impl<H: QueryHistoryStore, C: CityCatalogSource> SearchCoordinator<H, C> {
    /// Start a session over the empty query.
    ///
    /// Must be called from within a tokio runtime: the first page load is
    /// spawned right away.
    pub fn new(history: Arc<H>, catalog: Arc<C>, paging: PagingConfig) -> Self {
        let initial = build_results(catalog.as_ref(), &paging, String::new(), 1);
        let (displayed, _) = watch::channel(String::new());
        let (results, _) = watch::channel(initial);
        let (nav_tx, nav_rx) = mpsc::unbounded_channel();
        Self {
            history,
            catalog,
            paging,
            displayed,
            state: Mutex::new(CommitState {
                committed: String::new(),
                generation: 1,
            }),
            results,
            nav_tx,
            nav_rx: NavigationIntents {
                rx: Arc::new(AsyncMutex::new(nav_rx)),
            },
        }
    }

    /// Apply one user command.
    ///
    /// Commands that write to the history return the spawned write; query
    /// state is already updated when this returns.
    pub fn dispatch(&self, command: SearchCommand) -> Option<PendingMutation> {
        match command {
            SearchCommand::TextChanged(text) => {
                self.set_displayed(text);
                None
            }
            SearchCommand::Submit => {
                let text = self.displayed.borrow().clone();
                let pending = (!text.is_empty()).then(|| self.spawn_insert(text.clone()));
                self.commit(text);
                pending
            }
            SearchCommand::Retry => {
                let text = self.displayed.borrow().clone();
                if !self.commit(text)
                    && let Ok(pager) = &self.results.borrow().pager
                {
                    let restarted = pager.retry();
                    debug!(restarted, "retrying failed page loads");
                }
                None
            }
            SearchCommand::ClearQuery => {
                self.set_displayed(String::new());
                self.commit(String::new());
                None
            }
            SearchCommand::SelectHistoryItem(entry) => {
                self.set_displayed(entry.text.clone());
                self.commit(entry.text);
                None
            }
            SearchCommand::RemoveHistoryItem(entry) => Some(self.spawn_remove(entry)),
            SearchCommand::SelectCity(city) => {
                debug!(city_id = city.id, "navigation requested");
                if self
                    .nav_tx
                    .send(NavigationIntent::SelectedCity(city))
                    .is_err()
                {
                    warn!("navigation queue closed");
                }
                None
            }
        }
    }

    fn set_displayed(&self, text: String) {
        self.displayed.send_if_modified(|current| {
            if *current == text {
                false
            } else {
                *current = text;
                true
            }
        });
    }

    /// Make `text` the committed query. Returns true when a new results
    /// stream was built.
    fn commit(&self, text: String) -> bool {
        let mut state = self.state.lock();
        let reusable = self.results.borrow().pager.is_ok();
        if reusable && same_query(&state.committed, &text) {
            debug!(query = %text, "committed query unchanged, keeping results");
            state.committed = text;
            return false;
        }

        if let Ok(previous) = &self.results.borrow().pager {
            previous.cancel();
        }
        state.generation += 1;
        state.committed = text.clone();
        let results = build_results(self.catalog.as_ref(), &self.paging, text, state.generation);
        info!(
            query = %results.query,
            generation = results.generation,
            ok = results.pager.is_ok(),
            "results stream rebuilt"
        );
        self.results.send_replace(results);
        true
    }

    fn spawn_insert(&self, text: String) -> PendingMutation {
        let history = Arc::clone(&self.history);
        let handle = tokio::spawn(async move {
            match history.insert(&text).await {
                Ok(_) => Ok(()),
                Err(err) => {
                    warn!(query = %text, error = %err, "failed to record search");
                    Err(err)
                }
            }
        });
        PendingMutation { handle }
    }

    fn spawn_remove(&self, entry: SearchQuery) -> PendingMutation {
        let history = Arc::clone(&self.history);
        let handle = tokio::spawn(async move {
            match history.remove(&entry).await {
                Ok(_) => Ok(()),
                Err(err) => {
                    warn!(id = entry.id, error = %err, "failed to remove history entry");
                    Err(err)
                }
            }
        });
        PendingMutation { handle }
    }

    pub fn displayed_query(&self) -> watch::Receiver<String> {
        self.displayed.subscribe()
    }

    pub fn displayed_text(&self) -> String {
        self.displayed.borrow().clone()
    }

    pub fn committed_query(&self) -> String {
        self.state.lock().committed.clone()
    }

    pub fn history(&self) -> watch::Receiver<HistoryList> {
        self.history.list()
    }

    pub fn history_store(&self) -> &Arc<H> {
        &self.history
    }

    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }

    pub fn results(&self) -> watch::Receiver<PagedResults<C::Pages>> {
        self.results.subscribe()
    }

    pub fn current_results(&self) -> PagedResults<C::Pages> {
        self.results.borrow().clone()
    }

    pub fn navigation_intents(&self) -> NavigationIntents {
        self.nav_rx.clone()
    }
}

impl<H: QueryHistoryStore, C: CityCatalogSource> Drop for SearchCoordinator<H, C> {
    fn drop(&mut self) {
        if let Ok(pager) = &self.results.borrow().pager {
            pager.cancel();
        }
    }
}

fn build_results<C: CityCatalogSource>(
    catalog: &C,
    paging: &PagingConfig,
    query: String,
    generation: u64,
) -> PagedResults<C::Pages> {
    let pager = match catalog.get_cities(&query) {
        Ok(source) => {
            let pager = Pager::new(source, paging.clone());
            pager.refresh();
            Ok(pager)
        }
        Err(err) => {
            warn!(query = %query, error = %err, "catalog failed to build results");
            Err(Arc::new(err))
        }
    };
    PagedResults {
        query,
        generation,
        pager,
    }
}

fn same_query(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryQueryHistory;
    use crate::model::Coordinates;
    use crate::paging::{LoadRequest, Page};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn city(id: i64, name: &str) -> City {
        City {
            id,
            name: name.into(),
            country_code: "FR".into(),
            coordinates: Coordinates {
                latitude: 48.85,
                longitude: 2.35,
            },
            is_starred: false,
        }
    }

    /// Catalog fake: records every `get_cities` call, can refuse queries and
    /// can fail a number of page loads.
    #[derive(Default)]
    struct FakeCatalog {
        cities: Vec<City>,
        refuse: Option<String>,
        page_failures: Arc<AtomicUsize>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeCatalog {
        fn with_cities(names: &[&str]) -> Self {
            Self {
                cities: names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| city(i as i64 + 1, n))
                    .collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    struct FakePages {
        items: Vec<City>,
        failures: Arc<AtomicUsize>,
    }

    impl PagingSource for FakePages {
        type Item = City;

        fn load(
            &self,
            request: LoadRequest,
        ) -> impl Future<Output = Result<Page<City>, CatalogError>> + Send {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let items: Vec<City> = self
                .items
                .iter()
                .skip(request.offset)
                .take(request.limit)
                .cloned()
                .collect();
            async move {
                if fail {
                    return Err(CatalogError::Page {
                        offset: request.offset,
                        source: StorageError::Io(std::io::ErrorKind::TimedOut.into()),
                    });
                }
                Ok(Page::from_offset(request, items))
            }
        }
    }

    impl CityCatalogSource for FakeCatalog {
        type Pages = FakePages;

        fn get_cities(&self, query: &str) -> Result<FakePages, CatalogError> {
            self.calls.lock().push(query.to_string());
            if self.refuse.as_deref() == Some(query) {
                return Err(CatalogError::Unavailable(format!("no cities for {query}")));
            }
            let needle = query.to_lowercase();
            Ok(FakePages {
                items: self
                    .cities
                    .iter()
                    .filter(|c| c.name.to_lowercase().starts_with(&needle))
                    .cloned()
                    .collect(),
                failures: Arc::clone(&self.page_failures),
            })
        }
    }

    type Coordinator = SearchCoordinator<InMemoryQueryHistory, FakeCatalog>;

    fn coordinator(catalog: FakeCatalog) -> Coordinator {
        SearchCoordinator::new(
            Arc::new(InMemoryQueryHistory::new()),
            Arc::new(catalog),
            PagingConfig::with_page_size(10),
        )
    }

    fn history_texts(c: &Coordinator) -> Vec<String> {
        c.history()
            .borrow()
            .as_ref()
            .unwrap()
            .iter()
            .map(|q| q.text.clone())
            .collect()
    }

    async fn submit(c: &Coordinator, text: &str) {
        c.dispatch(SearchCommand::TextChanged(text.into()));
        if let Some(pending) = c.dispatch(SearchCommand::Submit) {
            pending.wait().await.unwrap();
        }
    }

    async fn settled_names(c: &Coordinator) -> Vec<String> {
        let results = c.current_results();
        let pager = results.pager.unwrap();
        pager
            .settled()
            .await
            .items
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[tokio::test]
    async fn starts_with_empty_query_and_results() {
        let c = coordinator(FakeCatalog::with_cities(&["Paris", "Lyon"]));
        assert_eq!(c.displayed_text(), "");
        assert_eq!(c.committed_query(), "");
        assert_eq!(c.catalog.calls(), vec![""]);
        let results = c.current_results();
        assert_eq!(results.generation, 1);
        assert_eq!(settled_names(&c).await, vec!["Paris", "Lyon"]);
        assert!(history_texts(&c).is_empty());
    }

    #[tokio::test]
    async fn typing_updates_display_without_fetching() {
        let c = coordinator(FakeCatalog::with_cities(&["Paris"]));
        let mut displayed = c.displayed_query();
        displayed.borrow_and_update();

        c.dispatch(SearchCommand::TextChanged("Pa".into()));
        assert!(displayed.has_changed().unwrap());
        assert_eq!(*displayed.borrow_and_update(), "Pa");
        assert_eq!(c.committed_query(), "");
        assert_eq!(c.catalog.calls().len(), 1);
    }

    #[tokio::test]
    async fn submit_records_history_and_commits() {
        let c = coordinator(FakeCatalog::with_cities(&["Paris", "Lyon"]));
        submit(&c, "Paris").await;

        let history = c.history().borrow().clone().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "Paris");
        assert!(history[0].is_persisted());
        assert_eq!(c.committed_query(), "Paris");
        assert_eq!(c.catalog.calls(), vec!["", "Paris"]);
        assert_eq!(settled_names(&c).await, vec!["Paris"]);
    }

    #[tokio::test]
    async fn case_only_changes_reuse_the_stream() {
        let c = coordinator(FakeCatalog::with_cities(&["Paris"]));
        submit(&c, "paris").await;
        let first = c.current_results().generation;

        submit(&c, "PARIS").await;
        assert_eq!(c.catalog.calls(), vec!["", "paris"]);
        assert_eq!(c.current_results().generation, first);
        assert_eq!(c.committed_query(), "PARIS");
        assert_eq!(history_texts(&c), vec!["PARIS", "paris"]);
    }

    #[tokio::test]
    async fn new_query_cancels_previous_stream() {
        let c = coordinator(FakeCatalog::with_cities(&["Paris", "Lyon"]));
        let mut results = c.results();
        results.borrow_and_update();
        let old = c.current_results().pager.unwrap();

        submit(&c, "Lyon").await;
        assert!(old.is_cancelled());
        assert!(results.has_changed().unwrap());
        let current = results.borrow_and_update().clone();
        assert_eq!(current.query, "Lyon");
        assert_eq!(current.generation, 2);
        assert!(!current.pager.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn clear_resets_both_texts() {
        let c = coordinator(FakeCatalog::with_cities(&["Paris"]));
        submit(&c, "Paris").await;
        c.dispatch(SearchCommand::TextChanged("Lon".into()));

        assert!(c.dispatch(SearchCommand::ClearQuery).is_none());
        assert_eq!(c.displayed_text(), "");
        assert_eq!(c.committed_query(), "");
        assert_eq!(c.catalog.calls(), vec!["", "Paris", ""]);
        assert_eq!(history_texts(&c), vec!["Paris"]);
    }

    #[tokio::test]
    async fn remove_history_item_leaves_query_alone() {
        let c = coordinator(FakeCatalog::default());
        submit(&c, "Oslo").await;
        submit(&c, "Rome").await;
        let oslo = c
            .history()
            .borrow()
            .as_ref()
            .unwrap()
            .iter()
            .find(|q| q.text == "Oslo")
            .cloned()
            .unwrap();

        c.dispatch(SearchCommand::RemoveHistoryItem(oslo.clone()))
            .unwrap()
            .wait()
            .await
            .unwrap();
        let history = c.history().borrow().clone().unwrap();
        assert!(history.iter().all(|q| q.id != oslo.id));
        assert_eq!(c.displayed_text(), "Rome");
        assert_eq!(c.committed_query(), "Rome");
    }

    #[tokio::test]
    async fn history_keeps_five_most_recent() {
        let c = coordinator(FakeCatalog::default());
        for text in ["A", "B", "C", "D", "E", "F"] {
            submit(&c, text).await;
        }
        assert_eq!(history_texts(&c), vec!["F", "E", "D", "C", "B"]);
    }

    #[tokio::test]
    async fn refused_query_surfaces_error_and_spares_history() {
        let catalog = FakeCatalog {
            refuse: Some("x".into()),
            ..FakeCatalog::default()
        };
        let c = coordinator(catalog);
        submit(&c, "x").await;

        let results = c.current_results();
        assert_eq!(results.query, "x");
        let err = results.pager.unwrap_err();
        assert!(matches!(*err, CatalogError::Unavailable(_)));
        assert_eq!(history_texts(&c), vec!["x"]);

        // A failed stream is never reused: retrying the same text asks again.
        c.dispatch(SearchCommand::Retry);
        assert_eq!(c.catalog.calls(), vec!["", "x", "x"]);
        assert_eq!(c.current_results().generation, 3);
    }

    #[tokio::test]
    async fn selecting_history_commits_without_duplicating() {
        let c = coordinator(FakeCatalog::with_cities(&["Lima"]));
        submit(&c, "Lima").await;
        c.dispatch(SearchCommand::ClearQuery);
        let entry = c.history().borrow().as_ref().unwrap()[0].clone();

        assert!(
            c.dispatch(SearchCommand::SelectHistoryItem(entry))
                .is_none()
        );
        assert_eq!(c.displayed_text(), "Lima");
        assert_eq!(c.committed_query(), "Lima");
        assert_eq!(history_texts(&c), vec!["Lima"]);
    }

    #[tokio::test]
    async fn retry_on_fresh_session_neither_records_nor_refetches() {
        let c = coordinator(FakeCatalog::with_cities(&["Paris"]));
        assert!(c.dispatch(SearchCommand::Retry).is_none());
        assert!(c.dispatch(SearchCommand::Submit).is_none());
        assert!(history_texts(&c).is_empty());
        assert_eq!(c.catalog.calls(), vec![""]);
        assert_eq!(c.current_results().generation, 1);
    }

    #[tokio::test]
    async fn retry_reloads_failed_pages_on_kept_stream() {
        let catalog = FakeCatalog::with_cities(&["Paris"]);
        catalog.page_failures.store(1, Ordering::SeqCst);
        let c = coordinator(catalog);

        let pager = c.current_results().pager.unwrap();
        let snapshot = pager.settled().await;
        assert!(snapshot.load_states.refresh.error().is_some());
        assert!(snapshot.items.is_empty());

        c.dispatch(SearchCommand::Retry);
        let snapshot = pager.settled().await;
        assert!(snapshot.load_states.refresh.error().is_none());
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(c.catalog.calls(), vec![""]);
    }

    #[tokio::test]
    async fn selecting_city_emits_one_intent() {
        let c = coordinator(FakeCatalog::default());
        let first = c.navigation_intents();
        let second = c.navigation_intents();

        c.dispatch(SearchCommand::SelectCity(city(9, "Nice")));
        assert_eq!(
            first.recv().await,
            Some(NavigationIntent::SelectedCity(city(9, "Nice")))
        );
        assert_eq!(second.try_recv(), None);
        assert_eq!(c.displayed_text(), "");
    }

    #[test]
    fn same_query_folds_unicode_case() {
        assert!(same_query("São Paulo", "SÃO PAULO"));
        assert!(same_query("", ""));
        assert!(!same_query("Paris", "Pari"));
    }
}
