//! Versioned asset cache and the fetch interceptor in front of it.
//!
//! - Responses are stored per generation, keyed by method + URL
//! - Exactly one generation serves at a time; the rest are purged on activation
//! - Lookups are strictly cache-first: a stored response is never revalidated

mod layer;
mod storage;
pub mod traits;

pub use layer::FetchInterceptor;
pub use storage::SqliteStorage;
pub use traits::{CacheResult, CacheSource, CacheStorage, RequestKey};
