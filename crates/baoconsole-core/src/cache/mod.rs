//! Query result caching.
//!
//! This module provides the `QueryCache` for results fetched from the
//! server. Entries are tagged with the namespace they were fetched in and
//! considered stale after 30 seconds. Switching namespace drops everything.

pub mod query;

pub use query::{CachedData, QueryCache, DEFAULT_STALE_TIME};
