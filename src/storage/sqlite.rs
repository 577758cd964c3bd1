//! `SQLite` backend: schema, pragmas, and migrations.

use super::{Result, StorageError};
use crate::model::types::{City, Coordinates, SearchQuery};
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const CURRENT_SCHEMA_VERSION: i64 = SCHEMA_VERSION;

const SCHEMA_VERSION: i64 = 3;

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS cities (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    country_code TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    is_starred INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_cities_name ON cities(name COLLATE NOCASE, country_code);
";

const MIGRATION_V2: &str = r"
CREATE TABLE IF NOT EXISTS queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queries_timestamp ON queries(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_cities_starred ON cities(is_starred) WHERE is_starred = 1;
";

// SQLite's LIKE only folds ASCII, so names are also stored lowercased by
// Rust and matched against a lowercased query.
const MIGRATION_V3: &str = r"
ALTER TABLE cities ADD COLUMN name_folded TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_cities_name_folded ON cities(name_folded);
";

const CITY_COLUMNS: &str = "id, name, country_code, latitude, longitude, is_starred";

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        apply_pragmas(&mut conn)?;
        init_meta(&mut conn)?;
        migrate(&mut conn)?;

        info!(path = %path.display(), "opened catalog database");
        Ok(Self { conn })
    }

    /// Private in-memory database, mostly for tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        apply_common_pragmas(&conn)?;
        init_meta(&mut conn)?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        read_schema_version(&self.conn)?.ok_or(StorageError::MissingSchemaVersion)
    }

    // ---------------------------------------------------------------------
    // Cities
    // ---------------------------------------------------------------------

    /// Upsert cities in one transaction. Existing rows keep their star flag.
    pub fn insert_cities(&mut self, cities: &[City]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cities(id, name, name_folded, country_code, latitude, longitude, is_starred)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    name_folded = excluded.name_folded,
                    country_code = excluded.country_code,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude",
            )?;
            for city in cities {
                stmt.execute(params![
                    city.id,
                    city.name,
                    fold_case(&city.name),
                    city.country_code,
                    city.coordinates.latitude,
                    city.coordinates.longitude,
                    city.is_starred,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = cities.len(), "inserted cities");
        Ok(cities.len())
    }

    pub fn city_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cities", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Cities whose name starts with `query`, ignoring case.
    ///
    /// The empty query matches every city.
    pub fn search_cities(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<City>> {
        let pattern = format!("{}%", escape_like(&fold_case(query)));
        let sql = format!(
            "SELECT {CITY_COLUMNS} FROM cities
             WHERE name_folded LIKE ?1 ESCAPE '\\'
             ORDER BY name COLLATE NOCASE, country_code, id
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![pattern, limit as i64, offset as i64],
            row_to_city,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn starred_cities(&self, limit: usize, offset: usize) -> Result<Vec<City>> {
        let sql = format!(
            "SELECT {CITY_COLUMNS} FROM cities
             WHERE is_starred = 1
             ORDER BY name COLLATE NOCASE, country_code, id
             LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_city)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn city_by_id(&self, id: i64) -> Result<Option<City>> {
        let sql = format!("SELECT {CITY_COLUMNS} FROM cities WHERE id = ?1");
        Ok(self.conn.query_row(&sql, [id], row_to_city).optional()?)
    }

    /// Returns false when no city has this id.
    pub fn set_starred(&self, id: i64, starred: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE cities SET is_starred = ?1 WHERE id = ?2",
            params![starred, id],
        )?;
        Ok(rows > 0)
    }

    // ---------------------------------------------------------------------
    // Query history
    // ---------------------------------------------------------------------

    pub fn insert_query(&self, text: &str, timestamp: i64) -> Result<SearchQuery> {
        self.conn.execute(
            "INSERT INTO queries(query, timestamp) VALUES(?1, ?2)",
            params![text, timestamp],
        )?;
        Ok(SearchQuery {
            id: self.conn.last_insert_rowid(),
            text: text.to_string(),
            timestamp,
        })
    }

    /// Most recent first; ties on timestamp go to the later insert.
    pub fn recent_queries(&self, limit: usize) -> Result<Vec<SearchQuery>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, query, timestamp FROM queries
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(SearchQuery {
                id: row.get(0)?,
                text: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn remove_query(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM queries WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    pub fn query_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn row_to_city(row: &rusqlite::Row<'_>) -> rusqlite::Result<City> {
    Ok(City {
        id: row.get(0)?,
        name: row.get(1)?,
        country_code: row.get(2)?,
        coordinates: Coordinates {
            latitude: row.get(3)?,
            longitude: row.get(4)?,
        },
        is_starred: row.get(5)?,
    })
}

fn fold_case(text: &str) -> String {
    text.to_lowercase()
}

/// Escape LIKE wildcards so user text only ever matches literally.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn apply_pragmas(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;
    apply_common_pragmas(conn)
}

fn apply_common_pragmas(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r"
        PRAGMA temp_store = MEMORY;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?)
}

fn init_meta(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    if read_schema_version(conn)?.is_none() {
        // Start at version 0 so migrate() applies full schema on first open.
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', '0')",
            [],
        )?;
    }

    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current = read_schema_version(conn)?.unwrap_or(0);

    if current == SCHEMA_VERSION {
        return Ok(());
    }
    if current > SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchema {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    let tx = conn.transaction()?;

    match current {
        0 => {
            tx.execute_batch(MIGRATION_V1)?;
            tx.execute_batch(MIGRATION_V2)?;
            tx.execute_batch(MIGRATION_V3)?;
        }
        1 => {
            tx.execute_batch(MIGRATION_V2)?;
            tx.execute_batch(MIGRATION_V3)?;
            backfill_folded_names(&tx)?;
        }
        2 => {
            tx.execute_batch(MIGRATION_V3)?;
            backfill_folded_names(&tx)?;
        }
        v => {
            return Err(StorageError::UnsupportedSchema {
                found: v,
                supported: SCHEMA_VERSION,
            });
        }
    }

    tx.execute(
        "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
        params![SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()?;
    info!(from = current, to = SCHEMA_VERSION, "migrated catalog schema");

    Ok(())
}

fn backfill_folded_names(conn: &Connection) -> Result<()> {
    let names = {
        let mut stmt = conn.prepare("SELECT id, name FROM cities")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    let mut update = conn.prepare("UPDATE cities SET name_folded = ?1 WHERE id = ?2")?;
    for (id, name) in &names {
        update.execute(params![fold_case(name), id])?;
    }
    debug!(count = names.len(), "backfilled folded city names");
    Ok(())
}
