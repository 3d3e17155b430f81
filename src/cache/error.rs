//! Error types shared by the query cache and the transports feeding it.

use thiserror::Error;

/// A retryable failure: timeout, 5xx response, reset connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransientError {
  /// HTTP status, when the failure came with a response
  pub status: Option<u16>,
  pub message: String,
}

impl TransientError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      status: None,
      message: message.into(),
    }
  }

  pub fn with_status(status: u16, message: impl Into<String>) -> Self {
    Self {
      status: Some(status),
      message: message.into(),
    }
  }
}

/// Failure reported by a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// Network known to be unavailable
  #[error("network unavailable")]
  Offline,

  /// The request itself is wrong (malformed, unauthorized, not found)
  #[error("request rejected with status {status}: {message}")]
  Client { status: u16, message: String },

  #[error("transient failure: {0}")]
  Transient(TransientError),
}

impl FetchError {
  /// Map an HTTP status and response body to a fetch error.
  ///
  /// 4xx is a client error, everything else is transient.
  pub fn from_status(status: u16, body: impl Into<String>) -> Self {
    let message = body.into();
    if (400..500).contains(&status) {
      FetchError::Client { status, message }
    } else {
      FetchError::Transient(TransientError::with_status(status, message))
    }
  }

  pub fn transient(message: impl Into<String>) -> Self {
    FetchError::Transient(TransientError::new(message))
  }
}

/// Error surfaced to callers of the cache once the retry policy is done.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  #[error("network unavailable")]
  Offline,

  #[error("request rejected with status {status}: {message}")]
  ClientError { status: u16, message: String },

  #[error("gave up after {attempts} attempts: {last}")]
  ExhaustedRetries { attempts: u32, last: TransientError },

  /// The task driving the fetch died before producing a result
  #[error("fetch aborted: {0}")]
  Aborted(String),
}

impl CacheError {
  /// Whether stale data may still be shown next to this error.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      CacheError::Offline | CacheError::ExhaustedRetries { .. }
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_4xx_is_client_error() {
    for status in [400, 401, 403, 404, 422, 499] {
      assert!(matches!(
        FetchError::from_status(status, "nope"),
        FetchError::Client { .. }
      ));
    }
  }

  #[test]
  fn test_other_statuses_are_transient() {
    for status in [500, 502, 503, 504, 301, 0] {
      match FetchError::from_status(status, "boom") {
        FetchError::Transient(err) => assert_eq!(err.status, Some(status)),
        other => panic!("expected transient, got {:?}", other),
      }
    }
  }

  #[test]
  fn test_exhausted_message_includes_last_error() {
    let err = CacheError::ExhaustedRetries {
      attempts: 4,
      last: TransientError::with_status(503, "service unavailable"),
    };
    assert_eq!(
      err.to_string(),
      "gave up after 4 attempts: service unavailable"
    );
    assert!(err.is_recoverable());
    assert!(!CacheError::ClientError {
      status: 401,
      message: String::new()
    }
    .is_recoverable());
  }
}
