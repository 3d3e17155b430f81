//! Query keys: ordered tuples identifying a cached server response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// One component of a query key.
///
/// Structured values (objects, arrays, non-integer numbers) are kept as their
/// canonical JSON text so keys stay hashable and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Value", from = "Value")]
pub enum KeyPart {
  Text(String),
  Int(i64),
  Bool(bool),
  Null,
  Json(String),
}

impl From<KeyPart> for Value {
  fn from(part: KeyPart) -> Self {
    match part {
      KeyPart::Text(s) => Value::String(s),
      KeyPart::Int(n) => Value::from(n),
      KeyPart::Bool(b) => Value::Bool(b),
      KeyPart::Null => Value::Null,
      KeyPart::Json(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
    }
  }
}

impl From<Value> for KeyPart {
  fn from(value: Value) -> Self {
    match value {
      Value::String(s) => KeyPart::Text(s),
      Value::Bool(b) => KeyPart::Bool(b),
      Value::Null => KeyPart::Null,
      Value::Number(n) => match n.as_i64() {
        Some(i) => KeyPart::Int(i),
        None => KeyPart::Json(n.to_string()),
      },
      // serde_json maps are ordered by key, so this text is canonical
      other => KeyPart::Json(other.to_string()),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Text(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Text(s)
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<i32> for KeyPart {
  fn from(n: i32) -> Self {
    KeyPart::Int(n.into())
  }
}

impl From<u32> for KeyPart {
  fn from(n: u32) -> Self {
    KeyPart::Int(n.into())
  }
}

impl From<u64> for KeyPart {
  fn from(n: u64) -> Self {
    Value::from(n).into()
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Text(s) => write!(f, "{}", s),
      KeyPart::Int(n) => write!(f, "{}", n),
      KeyPart::Bool(b) => write!(f, "{}", b),
      KeyPart::Null => write!(f, "null"),
      KeyPart::Json(raw) => write!(f, "{}", raw),
    }
  }
}

/// Ordered, opaque identifier of a query, e.g. `["customers", 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new<I, P>(parts: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<KeyPart>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Append a part, builder style.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  /// Whether this key's leading parts equal `prefix`.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Stable, fixed-length hash of the key (SHA-256, hex).
  pub fn cache_hash(&self) -> String {
    let canonical = Value::Array(self.0.iter().cloned().map(Value::from).collect()).to_string();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
    write!(f, "[{}]", parts.join(", "))
  }
}
