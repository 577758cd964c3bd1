//! Query history: the most recent submitted searches.
//!
//! Every insert is kept in storage, but listings only ever expose the
//! [`HISTORY_LIMIT`] newest entries, most recent first. Listings are live:
//! each store publishes the fresh list on a watch channel after every
//! mutation, and a failed reload is published as an `Err` item.

use crate::model::SearchQuery;
use crate::model::types::current_timestamp;
use crate::storage::{Database, StorageError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How many entries a history listing exposes.
pub const HISTORY_LIMIT: usize = 5;

/// One published history listing.
pub type HistoryList = Result<Vec<SearchQuery>, Arc<StorageError>>;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Refusing to record an empty query")]
    EmptyQuery,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("History listing failed: {0}")]
    Listing(Arc<StorageError>),
}

pub trait QueryHistoryStore: Send + Sync + 'static {
    /// Live listing. The receiver starts with the current list.
    fn list(&self) -> watch::Receiver<HistoryList>;

    /// Record `text` with the current time. Duplicates are kept.
    fn insert(&self, text: &str)
    -> impl Future<Output = Result<SearchQuery, HistoryError>> + Send;

    /// Delete the entry with `entry.id`. Returns false if there was none.
    fn remove(&self, entry: &SearchQuery)
    -> impl Future<Output = Result<bool, HistoryError>> + Send;

    fn snapshot(&self) -> HistoryList {
        self.list().borrow().clone()
    }
}

/// History persisted in the `queries` table.
#[derive(Clone)]
pub struct SqliteQueryHistory {
    db: Database,
    tx: Arc<watch::Sender<HistoryList>>,
}

impl SqliteQueryHistory {
    /// Open over `db` and load the initial listing.
    pub async fn open(db: Database) -> Result<Self, HistoryError> {
        let initial = db
            .call("history_list", |s| s.recent_queries(HISTORY_LIMIT))
            .await?;
        let (tx, _rx) = watch::channel(Ok(initial));
        Ok(Self {
            db,
            tx: Arc::new(tx),
        })
    }

    /// Re-read the listing and publish it.
    pub async fn reload(&self) -> Result<(), HistoryError> {
        let tx = Arc::clone(&self.tx);
        let failed = self
            .db
            .call("history_reload", move |s| {
                Ok(publish(&tx, s.recent_queries(HISTORY_LIMIT)))
            })
            .await?;
        match failed {
            Some(err) => Err(HistoryError::Listing(err)),
            None => Ok(()),
        }
    }

    pub async fn total_count(&self) -> Result<usize, HistoryError> {
        Ok(self.db.call("history_count", |s| s.query_count()).await?)
    }
}

/// Publish while the connection lock is still held, so listings reach
/// observers in the order the mutations committed. Returns the error that
/// was published, if any.
fn publish(
    tx: &watch::Sender<HistoryList>,
    list: crate::storage::Result<Vec<SearchQuery>>,
) -> Option<Arc<StorageError>> {
    match list {
        Ok(list) => {
            tx.send_replace(Ok(list));
            None
        }
        Err(err) => {
            warn!(error = %err, "history reload failed");
            let err = Arc::new(err);
            tx.send_replace(Err(Arc::clone(&err)));
            Some(err)
        }
    }
}

impl QueryHistoryStore for SqliteQueryHistory {
    fn list(&self) -> watch::Receiver<HistoryList> {
        self.tx.subscribe()
    }

    fn insert(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<SearchQuery, HistoryError>> + Send {
        let db = self.db.clone();
        let tx = Arc::clone(&self.tx);
        let text = text.to_string();
        async move {
            if text.is_empty() {
                return Err(HistoryError::EmptyQuery);
            }
            let entry = db
                .call("history_insert", move |s| {
                    let entry = s.insert_query(&text, current_timestamp())?;
                    publish(&tx, s.recent_queries(HISTORY_LIMIT));
                    Ok(entry)
                })
                .await?;
            debug!(id = entry.id, query = %entry.text, "history entry recorded");
            Ok(entry)
        }
    }

    fn remove(&self, entry: &SearchQuery) -> impl Future<Output = Result<bool, HistoryError>> + Send {
        let db = self.db.clone();
        let tx = Arc::clone(&self.tx);
        let id = entry.id;
        async move {
            let removed = db
                .call("history_remove", move |s| {
                    let removed = s.remove_query(id)?;
                    if removed {
                        publish(&tx, s.recent_queries(HISTORY_LIMIT));
                    }
                    Ok(removed)
                })
                .await?;
            debug!(id, removed, "history entry removed");
            Ok(removed)
        }
    }
}

struct MemoryState {
    entries: Vec<SearchQuery>,
    next_id: i64,
}

/// Non-persistent history with the same ordering and limit as the SQLite
/// store.
pub struct InMemoryQueryHistory {
    state: Mutex<MemoryState>,
    tx: watch::Sender<HistoryList>,
}

impl Default for InMemoryQueryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueryHistory {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Ok(Vec::new()));
        Self {
            state: Mutex::new(MemoryState {
                entries: Vec::new(),
                next_id: 1,
            }),
            tx,
        }
    }

    fn publish(&self, state: &MemoryState) {
        let mut listing = state.entries.clone();
        listing.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        listing.truncate(HISTORY_LIMIT);
        self.tx.send_replace(Ok(listing));
    }

    fn insert_now(&self, text: &str) -> Result<SearchQuery, HistoryError> {
        if text.is_empty() {
            return Err(HistoryError::EmptyQuery);
        }
        let mut state = self.state.lock();
        let entry = SearchQuery {
            id: state.next_id,
            text: text.to_string(),
            timestamp: current_timestamp(),
        };
        state.next_id += 1;
        state.entries.push(entry.clone());
        self.publish(&state);
        Ok(entry)
    }

    fn remove_now(&self, id: i64) -> bool {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        let removed = state.entries.len() != before;
        if removed {
            self.publish(&state);
        }
        removed
    }
}

impl QueryHistoryStore for InMemoryQueryHistory {
    fn list(&self) -> watch::Receiver<HistoryList> {
        self.tx.subscribe()
    }

    fn insert(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<SearchQuery, HistoryError>> + Send {
        std::future::ready(self.insert_now(text))
    }

    fn remove(&self, entry: &SearchQuery) -> impl Future<Output = Result<bool, HistoryError>> + Send {
        std::future::ready(Ok(self.remove_now(entry.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::IoContext;

    async fn sqlite_history() -> SqliteQueryHistory {
        let db = Database::open_in_memory(IoContext::current()).unwrap();
        SqliteQueryHistory::open(db).await.unwrap()
    }

    fn texts(list: &HistoryList) -> Vec<String> {
        list.as_ref()
            .unwrap()
            .iter()
            .map(|q| q.text.clone())
            .collect()
    }

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        let history = sqlite_history().await;
        assert!(history.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_assigns_id_and_notifies() {
        let history = sqlite_history().await;
        let mut rx = history.list();
        rx.borrow_and_update();

        let entry = history.insert("Paris").await.unwrap();
        assert!(entry.is_persisted());
        assert!(rx.has_changed().unwrap());
        let list = rx.borrow_and_update().clone();
        assert_eq!(list.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn insert_rejects_empty_text() {
        let history = sqlite_history().await;
        let err = history.insert("").await.unwrap_err();
        assert!(matches!(err, HistoryError::EmptyQuery));
        assert_eq!(history.total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicates_are_kept() {
        let history = sqlite_history().await;
        let a = history.insert("Rome").await.unwrap();
        let b = history.insert("Rome").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(texts(&history.snapshot()), vec!["Rome", "Rome"]);
    }

    #[tokio::test]
    async fn listing_keeps_five_newest() {
        let history = sqlite_history().await;
        for text in ["A", "B", "C", "D", "E", "F"] {
            history.insert(text).await.unwrap();
        }
        assert_eq!(texts(&history.snapshot()), vec!["F", "E", "D", "C", "B"]);
        assert_eq!(history.total_count().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn remove_drops_entry_and_missing_id_is_noop() {
        let history = sqlite_history().await;
        let keep = history.insert("Lima").await.unwrap();
        let gone = history.insert("Oslo").await.unwrap();

        assert!(history.remove(&gone).await.unwrap());
        assert!(!history.remove(&gone).await.unwrap());
        assert!(!history.remove(&SearchQuery::new("never stored")).await.unwrap());

        let list = history.snapshot().unwrap();
        assert_eq!(list, vec![keep]);
    }

    #[tokio::test]
    async fn removal_backfills_from_older_entries() {
        let history = sqlite_history().await;
        let mut entries = Vec::new();
        for text in ["A", "B", "C", "D", "E", "F"] {
            entries.push(history.insert(text).await.unwrap());
        }
        history.remove(&entries[5]).await.unwrap();
        assert_eq!(texts(&history.snapshot()), vec!["E", "D", "C", "B", "A"]);
    }

    #[tokio::test]
    async fn reload_reflects_external_writes() {
        let db = Database::open_in_memory(IoContext::current()).unwrap();
        let history = SqliteQueryHistory::open(db.clone()).await.unwrap();
        db.lock().insert_query("Kyiv", 1).unwrap();
        assert!(history.snapshot().unwrap().is_empty());

        history.reload().await.unwrap();
        assert_eq!(texts(&history.snapshot()), vec!["Kyiv"]);
    }

    #[tokio::test]
    async fn storage_failures_reach_callers_and_observers() {
        let db = Database::open_in_memory(IoContext::current()).unwrap();
        let history = SqliteQueryHistory::open(db.clone()).await.unwrap();
        let kept = history.insert("Quito").await.unwrap();
        db.lock().raw().execute_batch("DROP TABLE queries").unwrap();

        let mut rx = history.list();
        rx.borrow_and_update();

        let err = history.insert("Lima").await.unwrap_err();
        assert!(matches!(err, HistoryError::Storage(StorageError::Sqlite(_))));
        assert!(history.remove(&kept).await.is_err());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(history.snapshot().unwrap(), vec![kept]);

        let err = history.reload().await.unwrap_err();
        assert!(matches!(err, HistoryError::Listing(_)));
        assert!(rx.has_changed().unwrap());
        let published = rx.borrow_and_update().clone();
        assert!(published.unwrap_err().to_string().contains("no such table"));
    }

    #[tokio::test]
    async fn in_memory_store_matches_sqlite_semantics() {
        let history = InMemoryQueryHistory::new();
        assert!(matches!(
            history.insert("").await,
            Err(HistoryError::EmptyQuery)
        ));
        let mut entries = Vec::new();
        for text in ["A", "B", "C", "D", "E", "F"] {
            entries.push(history.insert(text).await.unwrap());
        }
        assert_eq!(texts(&history.snapshot()), vec!["F", "E", "D", "C", "B"]);

        assert!(history.remove(&entries[0]).await.unwrap());
        assert!(!history.remove(&entries[0]).await.unwrap());
        assert_eq!(texts(&history.snapshot()), vec!["F", "E", "D", "C", "B"]);
    }
}
