//! Core pipeline for resolving a postcode into a dated waste-collection
//! schedule via external lookup and scraping sources.

/// TTL-keyed schedule cache and per-property flight guards.
pub mod cache;
/// Retrying HTTP transport shared by lookup and scraping.
pub mod fetch;
/// Domain models for postcodes, addresses, and schedules.
pub mod model;
/// Source traits and the shared error taxonomy.
pub mod ports;
/// Facade composing the sources and the cache.
pub mod service;

pub use cache::*;
pub use fetch::*;
pub use model::*;
pub use ports::*;
pub use service::*;
