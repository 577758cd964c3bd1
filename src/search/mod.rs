//! Search session layer.
//!
//! - **[`coordinator`]**: the command-driven search session tying live query
//!   text, paged city results, and query history together.

pub mod coordinator;

pub use coordinator::{
    NavigationIntent, NavigationIntents, PagedResults, PendingMutation, SearchCommand,
    SearchCoordinator,
};
