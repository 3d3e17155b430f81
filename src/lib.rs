//! Offline-friendly client for a field-operations REST backend.
//!
//! - [`cache`]: query cache with freshness, deduplication, retries and GC
//! - [`storage`]: synchronous key-value shim over a durable store
//! - [`api`]: REST client and the cached [`api::Backend`]

pub mod api;
pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod storage;
