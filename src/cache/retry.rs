//! Failure classification and exponential backoff for queries and mutations.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::error::{CacheError, FetchError};
use crate::config::RetryConfig;
use crate::lifecycle::Connectivity;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
  /// No connectivity, fail immediately
  Offline,
  /// Caller-fixable request problem, fail immediately
  ClientError,
  /// Anything else, retry with backoff
  Transient,
}

/// Classify a fetch failure. Every failure lands in exactly one class.
pub fn classify(error: &FetchError) -> FailureClass {
  match error {
    FetchError::Offline => FailureClass::Offline,
    FetchError::Client { .. } => FailureClass::ClientError,
    FetchError::Transient(_) => FailureClass::Transient,
  }
}

/// Retry policy with capped exponential backoff.
///
/// Backoff doubles with each retry: `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
      max_delay: max_delay.max(base_delay),
    }
  }

  /// Policy for read-type requests.
  pub fn queries(config: &RetryConfig) -> Self {
    Self::new(
      config.query_max_retries,
      Duration::from_millis(config.base_delay_ms),
      Duration::from_millis(config.max_delay_ms),
    )
  }

  /// Policy for write-type requests. Never retries more than queries do.
  pub fn mutations(config: &RetryConfig) -> Self {
    Self::new(
      config.mutation_max_retries.min(config.query_max_retries),
      Duration::from_millis(config.base_delay_ms),
      Duration::from_millis(config.max_delay_ms),
    )
  }

  /// Delay before retry number `attempt` (0-indexed).
  pub fn delay(&self, attempt: u32) -> Duration {
    let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
    let cap_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
    let backoff_ms = base_ms
      .saturating_mul(2_u64.saturating_pow(attempt))
      .min(cap_ms);

    Duration::from_millis(backoff_ms)
  }

  /// Run `operation` until it succeeds or the policy gives up.
  ///
  /// Offline and client errors are returned after a single attempt. Transient
  /// errors are retried up to `max_retries` times and then reported as
  /// [`CacheError::ExhaustedRetries`].
  pub async fn run<F, Fut, T>(&self, connectivity: &Connectivity, mut operation: F) -> Result<T, CacheError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    let mut attempt = 0;

    loop {
      if !connectivity.is_online() {
        debug!("Skipping attempt {}, network is offline", attempt + 1);
        return Err(CacheError::Offline);
      }

      let err = match operation().await {
        Ok(value) => {
          if attempt > 0 {
            debug!("Request succeeded after {} retries", attempt);
          }
          return Ok(value);
        }
        Err(err) => err,
      };

      debug!(class = ?classify(&err), "Attempt {} failed: {}", attempt + 1, err);

      match err {
        FetchError::Offline => return Err(CacheError::Offline),
        FetchError::Client { status, message } => {
          return Err(CacheError::ClientError { status, message });
        }
        FetchError::Transient(last) => {
          if attempt >= self.max_retries {
            warn!("Request failed after {} attempts: {}", attempt + 1, last);
            return Err(CacheError::ExhaustedRetries {
              attempts: attempt + 1,
              last,
            });
          }

          let backoff = self.delay(attempt);
          warn!(
            "Attempt {} failed with transient error: {}. Retrying in {:?}",
            attempt + 1,
            last,
            backoff
          );
          sleep(backoff).await;
          attempt += 1;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::{Arc, Mutex};
  use tokio::time::Instant;

  fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
      max_retries,
      Duration::from_millis(100),
      Duration::from_millis(350),
    )
  }

  #[test]
  fn test_classify_is_exhaustive() {
    assert_eq!(classify(&FetchError::Offline), FailureClass::Offline);
    assert_eq!(
      classify(&FetchError::from_status(404, "missing")),
      FailureClass::ClientError
    );
    assert_eq!(
      classify(&FetchError::from_status(502, "bad gateway")),
      FailureClass::Transient
    );
    assert_eq!(
      classify(&FetchError::transient("connection reset")),
      FailureClass::Transient
    );
  }

  #[test]
  fn test_delay_doubles_and_clamps() {
    let policy = policy(5);
    assert_eq!(policy.delay(0), Duration::from_millis(100));
    assert_eq!(policy.delay(1), Duration::from_millis(200));
    assert_eq!(policy.delay(2), Duration::from_millis(350));
    assert_eq!(policy.delay(40), Duration::from_millis(350));
  }

  #[test]
  fn test_mutations_never_retry_more_than_queries() {
    let config = RetryConfig {
      query_max_retries: 2,
      mutation_max_retries: 5,
      ..RetryConfig::default()
    };
    assert_eq!(RetryPolicy::queries(&config).max_retries, 2);
    assert_eq!(RetryPolicy::mutations(&config).max_retries, 2);

    let defaults = RetryConfig::default();
    assert!(
      RetryPolicy::mutations(&defaults).max_retries < RetryPolicy::queries(&defaults).max_retries
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_client_error_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<(), _> = policy(3)
      .run(&Connectivity::default(), || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(FetchError::from_status(401, "unauthorized")) }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
      result,
      Err(CacheError::ClientError { status: 401, .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_error_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<(), _> = policy(3)
      .run(&Connectivity::default(), || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(FetchError::Offline) }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result, Err(CacheError::Offline));
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_connectivity_skips_transport() {
    let connectivity = Connectivity::default();
    connectivity.set_online(false);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = policy(3)
      .run(&connectivity, || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, FetchError>(1) }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result, Err(CacheError::Offline));
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_exhaust_with_backoff() {
    let started = Instant::now();
    let attempts_at = Arc::new(Mutex::new(Vec::new()));
    let log = attempts_at.clone();

    let result: Result<(), _> = policy(3)
      .run(&Connectivity::default(), || {
        log.lock().unwrap().push(started.elapsed());
        async { Err(FetchError::from_status(503, "unavailable")) }
      })
      .await;

    match result {
      Err(CacheError::ExhaustedRetries { attempts, last }) => {
        assert_eq!(attempts, 4);
        assert_eq!(last.status, Some(503));
      }
      other => panic!("expected exhausted retries, got {:?}", other),
    }

    let times = attempts_at.lock().unwrap().clone();
    assert_eq!(
      times,
      vec![
        Duration::ZERO,
        Duration::from_millis(100),
        Duration::from_millis(300),
        Duration::from_millis(650),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_attempts_stop_at_first_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = policy(3)
      .run(&Connectivity::default(), || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if n < 2 {
            Err(FetchError::transient("timeout"))
          } else {
            Ok(n)
          }
        }
      })
      .await;

    // min(3 retries, 2 failures) + 1
    assert_eq!(result, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_retries_makes_one_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<(), _> = policy(0)
      .run(&Connectivity::default(), || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(FetchError::transient("reset")) }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
      result,
      Err(CacheError::ExhaustedRetries { attempts: 1, .. })
    ));
  }
}
