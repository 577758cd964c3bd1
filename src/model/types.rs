//! Normalized entity structs.

use serde::{Deserialize, Serialize};

/// A point on the map, in decimal degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct City {
    pub id: i64,
    pub name: String,
    /// ISO 3166-1 alpha-2 code, e.g. "BR".
    pub country_code: String,
    pub coordinates: Coordinates,
    #[serde(default)]
    pub is_starred: bool,
}

impl City {
    /// OpenStreetMap link centered on the city.
    pub fn map_url(&self) -> String {
        let Coordinates {
            latitude,
            longitude,
        } = self.coordinates;
        format!(
            "https://www.openstreetmap.org/?mlat={latitude}&mlon={longitude}#map=12/{latitude}/{longitude}"
        )
    }
}

/// A previously submitted search, as kept in the query history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    /// Assigned by the store on insert; 0 until persisted.
    pub id: i64,
    pub text: String,
    /// Submission time (unix millis)
    pub timestamp: i64,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: 0,
            text: text.into(),
            timestamp: current_timestamp(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}

pub(crate) fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
