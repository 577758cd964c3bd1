//! Loading the city dataset into the catalog.
//!
//! The dataset is a JSON array of records shaped like
//! `{"_id": 707860, "name": "Hurzuf", "country": "UA", "coord": {"lat": 44.55, "lon": 34.28}}`.
//! Gzip-compressed files are detected by their magic bytes.

use crate::model::{City, Coordinates};
use crate::storage::{Database, StorageError};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Failed to read dataset {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed dataset {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonCity {
    #[serde(rename = "_id")]
    pub id: i64,
    pub name: String,
    pub country: String,
    pub coord: JsonCoord,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct JsonCoord {
    pub lat: f64,
    pub lon: f64,
}

impl From<JsonCity> for City {
    fn from(json: JsonCity) -> Self {
        City {
            id: json.id,
            name: json.name,
            country_code: json.country,
            coordinates: Coordinates {
                latitude: json.coord.lat,
                longitude: json.coord.lon,
            },
            is_starred: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { count: usize },
    /// The catalog already had cities and `force` was not set.
    Skipped { existing: usize },
}

/// Parse a dataset from any reader, plain or gzip.
pub fn parse_cities(reader: impl Read) -> Result<Vec<City>, serde_json::Error> {
    let mut reader = BufReader::new(reader);
    let gzipped = reader
        .fill_buf()
        .map(|buf| buf.starts_with(&GZIP_MAGIC))
        .map_err(serde_json::Error::io)?;
    let records: Vec<JsonCity> = if gzipped {
        serde_json::from_reader(BufReader::new(GzDecoder::new(reader)))?
    } else {
        serde_json::from_reader(reader)?
    };
    Ok(records.into_iter().map(City::from).collect())
}

pub fn load_cities_json(path: &Path) -> Result<Vec<City>, SeedError> {
    let file = File::open(path).map_err(|source| SeedError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_cities(file).map_err(|source| SeedError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Store `cities` unless the catalog is already populated.
///
/// With `force`, cities are upserted by id regardless; star flags of
/// existing rows survive.
pub async fn initialize_database(
    db: &Database,
    cities: Vec<City>,
    force: bool,
) -> Result<SeedOutcome, SeedError> {
    let outcome = db
        .call("seed", move |s| {
            let existing = s.city_count()?;
            if existing > 0 && !force {
                return Ok(SeedOutcome::Skipped { existing });
            }
            let count = s.insert_cities(&cities)?;
            Ok(SeedOutcome::Seeded { count })
        })
        .await?;
    match outcome {
        SeedOutcome::Seeded { count } => info!(count, force, "catalog seeded"),
        SeedOutcome::Skipped { existing } => info!(existing, "catalog already populated"),
    }
    Ok(outcome)
}
