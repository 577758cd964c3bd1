pub mod types;

pub use types::{City, Coordinates, SearchQuery};
