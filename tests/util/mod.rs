use cities_search::catalog::{CatalogError, CityCatalogSource, CityQueryPages, SqliteCityCatalog};
use cities_search::model::{City, Coordinates};
use cities_search::storage::{Database, IoContext};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Capture events from the current thread until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }

    pub fn lines(&self) -> Vec<String> {
        self.output()
            .lines()
            .map(std::string::ToString::to_string)
            .collect()
    }
}

#[allow(dead_code)]
struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct TempFixtureDir {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl TempFixtureDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("cities.db")
    }

    /// Write `cities` in the dataset format `init` reads.
    pub fn write_dataset(&self, cities: &[City]) -> PathBuf {
        let records: Vec<_> = cities
            .iter()
            .map(|c| {
                json!({
                    "_id": c.id,
                    "name": c.name,
                    "country": c.country_code,
                    "coord": {"lat": c.coordinates.latitude, "lon": c.coordinates.longitude},
                })
            })
            .collect();
        let path = self.dir.path().join("cities.json");
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();
        path
    }
}

#[allow(dead_code)]
pub fn city(id: i64, name: &str, country: &str, lat: f64, lon: f64) -> City {
    City {
        id,
        name: name.into(),
        country_code: country.into(),
        coordinates: Coordinates {
            latitude: lat,
            longitude: lon,
        },
        is_starred: false,
    }
}

/// A small catalog with a few shared prefixes.
#[allow(dead_code)]
pub fn sample_cities() -> Vec<City> {
    vec![
        city(2988507, "Paris", "FR", 48.8534, 2.3488),
        city(4717560, "Paris", "US", 33.6609, -95.5555),
        city(2643743, "London", "GB", 51.5085, -0.1257),
        city(6058560, "London", "CA", 42.9834, -81.233),
        city(2996944, "Lyon", "FR", 45.7485, 4.8467),
        city(3117735, "Madrid", "ES", 40.4165, -3.7026),
        city(2950159, "Berlin", "DE", 52.5244, 13.4105),
        city(3169070, "Rome", "IT", 41.8947, 12.4839),
        city(3413829, "Reykjavik", "IS", 64.1355, -21.8954),
        city(3448439, "São Paulo", "BR", -23.5475, -46.6361),
    ]
}

/// In-memory database loaded with [`sample_cities`].
#[allow(dead_code)]
pub fn seeded_db() -> Database {
    let db = Database::open_in_memory(IoContext::current()).unwrap();
    db.lock().insert_cities(&sample_cities()).unwrap();
    db
}

/// SQLite catalog that counts how often a results stream is built.
#[allow(dead_code)]
pub struct CountingCatalog {
    inner: SqliteCityCatalog,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingCatalog {
    pub fn new(db: Database) -> Self {
        Self {
            inner: SqliteCityCatalog::new(db),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CityCatalogSource for CountingCatalog {
    type Pages = CityQueryPages;

    fn get_cities(&self, query: &str) -> Result<CityQueryPages, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_cities(query)
    }
}
