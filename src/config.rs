//! Runtime configuration: defaults, environment, then command-line overrides.

use crate::paging::{DEFAULT_PAGE_SIZE, PagingConfig};
use std::path::PathBuf;

pub const DB_FILE_NAME: &str = "cities.db";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding the database when no explicit path is given.
    pub data_dir: PathBuf,
    /// Explicit database path.
    pub db_path: Option<PathBuf>,
    /// Dataset `init` loads when called without a path.
    pub seed_path: Option<PathBuf>,
    /// First-load size set explicitly; otherwise derived from the page size.
    pub initial_load_size: Option<usize>,
    pub paging: PagingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
            seed_path: None,
            initial_load_size: None,
            paging: PagingConfig::with_page_size(DEFAULT_PAGE_SIZE),
        }
    }
}

impl AppConfig {
    /// Load config from environment variables (and `.env`, if present).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    /// Load config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = lookup("CITIES_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }

        if let Some(path) = lookup("CITIES_DB") {
            cfg.db_path = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("CITIES_SEED") {
            cfg.seed_path = Some(PathBuf::from(path));
        }

        if let Some(val) = lookup("CITIES_PAGE_SIZE")
            && let Ok(n) = val.parse::<usize>()
            && n > 0
        {
            cfg.paging = PagingConfig::with_page_size(n);
        }

        if let Some(val) = lookup("CITIES_INITIAL_LOAD_SIZE")
            && let Ok(n) = val.parse::<usize>()
            && n > 0
        {
            cfg.initial_load_size = Some(n);
            cfg.paging.initial_load_size = n;
        }

        cfg
    }

    /// Apply command-line overrides on top of the loaded values.
    pub fn with_overrides(
        mut self,
        data_dir: Option<PathBuf>,
        db_path: Option<PathBuf>,
        page_size: Option<usize>,
    ) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        if let Some(path) = db_path {
            self.db_path = Some(path);
        }
        if let Some(n) = page_size.filter(|n| *n > 0) {
            self.paging = PagingConfig::with_page_size(n);
            if let Some(initial) = self.initial_load_size {
                self.paging.initial_load_size = initial;
            }
        }
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DB_FILE_NAME))
    }
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "cities-search", "cities-search")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".cities-search"))
}
