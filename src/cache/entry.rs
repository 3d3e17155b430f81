use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// A cached server response with its freshness and collection deadlines.
///
/// Invariant: `fetched_at <= stale_at <= gc_at`.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub value: V,
  pub fetched_at: Instant,
  /// Wall-clock twin of `fetched_at`, for reporting and persistence
  pub fetched_wall: DateTime<Utc>,
  pub stale_at: Instant,
  pub gc_at: Instant,
}

impl<V> CacheEntry<V> {
  pub fn new(
    value: V,
    fetched_at: Instant,
    fetched_wall: DateTime<Utc>,
    stale_time: Duration,
    gc_time: Duration,
  ) -> Self {
    let stale_at = fetched_at + stale_time;
    Self {
      value,
      fetched_at,
      fetched_wall,
      stale_at,
      gc_at: stale_at.max(fetched_at + gc_time),
    }
  }

  pub fn is_stale(&self, now: Instant) -> bool {
    now >= self.stale_at
  }

  /// Mark stale without touching the data.
  pub fn invalidate(&mut self) {
    self.stale_at = self.fetched_at;
  }

  /// Restart the collection window once nothing observes the entry anymore.
  pub fn release(&mut self, now: Instant, gc_time: Duration) {
    self.gc_at = self.stale_at.max(now + gc_time);
  }

  pub fn is_collectable(&self, now: Instant) -> bool {
    now >= self.gc_at
  }
}
