//! City catalog: paged city lookups backed by the SQLite store.

use crate::model::City;
use crate::paging::{LoadRequest, Page, PagingSource};
use crate::storage::{Database, StorageError};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("City catalog unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load page at offset {offset}: {source}")]
    Page {
        offset: usize,
        #[source]
        source: StorageError,
    },

    #[error("Paging was cancelled")]
    Cancelled,
}

/// Produces a paged sequence of cities matching a free-text query.
///
/// Matching is case-insensitive. An `Err` here means the stream could not
/// be built at all; failures of individual pages come from the returned
/// source instead.
pub trait CityCatalogSource: Send + Sync + 'static {
    type Pages: PagingSource<Item = City>;

    fn get_cities(&self, query: &str) -> Result<Self::Pages, CatalogError>;
}

#[derive(Clone)]
pub struct SqliteCityCatalog {
    db: Database,
}

impl SqliteCityCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn starred_cities(&self) -> StarredCityPages {
        StarredCityPages {
            db: self.db.clone(),
        }
    }

    pub async fn city_by_id(&self, id: i64) -> Result<Option<City>, CatalogError> {
        Ok(self.db.call("city_by_id", move |s| s.city_by_id(id)).await?)
    }

    /// Returns false when no city has `id`.
    pub async fn set_starred(&self, id: i64, starred: bool) -> Result<bool, CatalogError> {
        Ok(self
            .db
            .call("set_starred", move |s| s.set_starred(id, starred))
            .await?)
    }

    pub async fn city_count(&self) -> Result<usize, CatalogError> {
        Ok(self.db.call("city_count", |s| s.city_count()).await?)
    }
}

impl CityCatalogSource for SqliteCityCatalog {
    type Pages = CityQueryPages;

    fn get_cities(&self, query: &str) -> Result<CityQueryPages, CatalogError> {
        Ok(CityQueryPages {
            db: self.db.clone(),
            query: query.to_string(),
        })
    }
}

/// Cities whose name starts with `query`, ordered by name.
#[derive(Clone)]
pub struct CityQueryPages {
    db: Database,
    query: String,
}

impl CityQueryPages {
    pub fn query(&self) -> &str {
        &self.query
    }
}

impl PagingSource for CityQueryPages {
    type Item = City;

    fn load(
        &self,
        request: LoadRequest,
    ) -> impl Future<Output = Result<Page<City>, CatalogError>> + Send {
        let db = self.db.clone();
        let query = self.query.clone();
        async move {
            let items = db
                .call("search_cities", move |s| {
                    s.search_cities(&query, request.limit, request.offset)
                })
                .await
                .map_err(|source| CatalogError::Page {
                    offset: request.offset,
                    source,
                })?;
            Ok(Page::from_offset(request, items))
        }
    }
}

#[derive(Clone)]
pub struct StarredCityPages {
    db: Database,
}

impl PagingSource for StarredCityPages {
    type Item = City;

    fn load(
        &self,
        request: LoadRequest,
    ) -> impl Future<Output = Result<Page<City>, CatalogError>> + Send {
        let db = self.db.clone();
        async move {
            let items = db
                .call("starred_cities", move |s| {
                    s.starred_cities(request.limit, request.offset)
                })
                .await
                .map_err(|source| CatalogError::Page {
                    offset: request.offset,
                    source,
                })?;
            Ok(Page::from_offset(request, items))
        }
    }
}
