//! Client-side cache of remote data with a retry and freshness policy.
//!
//! This module provides a transport-agnostic query cache that:
//! - Serves entries younger than the stale time without touching the network
//! - Shares one in-flight fetch per query key
//! - Retries transient failures with capped exponential backoff (fewer
//!   retries for mutations than for queries)
//! - Evicts entries nobody has observed for the collection window
//! - Can be persisted to local storage and hydrated on start-up

mod entry;
mod error;
mod key;
mod layer;
mod observer;
mod persist;
mod retry;
mod traits;

pub use error::{CacheError, FetchError, TransientError};
pub use key::{KeyPart, QueryKey};
pub use layer::{fetcher, Fetcher, QueryCache};
pub use observer::QueryObserver;
pub use persist::{CachePersister, CACHE_STORAGE_KEY};
pub use retry::{classify, FailureClass, RetryPolicy};
pub use traits::{CacheEvent, CacheResult, CacheSource, CacheValue};
