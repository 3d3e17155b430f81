//! Backend collections and the query keys used to cache them.

use clap::ValueEnum;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::cache::QueryKey;

/// A REST collection exposed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Resource {
  Customers,
  Tasks,
  Paints,
  Trucks,
  Items,
  Commissions,
  PpeDeliveries,
  Notifications,
  ChangeLogs,
  Sectors,
  Users,
}

impl Resource {
  pub const ALL: [Resource; 11] = [
    Resource::Customers,
    Resource::Tasks,
    Resource::Paints,
    Resource::Trucks,
    Resource::Items,
    Resource::Commissions,
    Resource::PpeDeliveries,
    Resource::Notifications,
    Resource::ChangeLogs,
    Resource::Sectors,
    Resource::Users,
  ];

  /// Path segment of the collection, relative to the API base URL.
  pub fn path(self) -> &'static str {
    match self {
      Resource::Customers => "customers",
      Resource::Tasks => "tasks",
      Resource::Paints => "paints",
      Resource::Trucks => "trucks",
      Resource::Items => "items",
      Resource::Commissions => "commissions",
      Resource::PpeDeliveries => "ppe-deliveries",
      Resource::Notifications => "notifications",
      Resource::ChangeLogs => "change-logs",
      Resource::Sectors => "sectors",
      Resource::Users => "users",
    }
  }

  pub fn item_path(self, id: &str) -> String {
    format!("{}/{}", self.path(), id)
  }

  /// Key prefix covering every cached query of this collection.
  pub fn root_key(self) -> QueryKey {
    QueryKey::new([self.path()])
  }

  /// Key for a list query, e.g. `["customers", "list", {"page": "2"}]`.
  pub fn list_key(self, params: &BTreeMap<String, String>) -> QueryKey {
    let filters: Map<String, Value> = params
      .iter()
      .map(|(k, v)| (k.clone(), Value::String(v.clone())))
      .collect();
    self.root_key().with("list").with(Value::Object(filters))
  }

  /// Key for a single record, e.g. `["customers", "detail", "c1"]`.
  pub fn detail_key(self, id: &str) -> QueryKey {
    self.root_key().with("detail").with(id)
  }

  /// Collections whose cached data embeds this one and goes stale with it.
  pub fn dependents(self) -> &'static [Resource] {
    match self {
      Resource::Tasks => &[Resource::Commissions, Resource::ChangeLogs],
      Resource::Items => &[Resource::PpeDeliveries, Resource::ChangeLogs],
      Resource::Customers | Resource::Paints | Resource::Trucks => &[Resource::ChangeLogs],
      _ => &[],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_share_collection_prefix() {
    let mut params = BTreeMap::new();
    params.insert("page".to_string(), "2".to_string());

    let list = Resource::Customers.list_key(&params);
    let detail = Resource::Customers.detail_key("c1");
    assert!(list.starts_with(&Resource::Customers.root_key()));
    assert!(detail.starts_with(&Resource::Customers.root_key()));
    assert!(!detail.starts_with(&Resource::Tasks.root_key()));
    assert_ne!(list, Resource::Customers.list_key(&BTreeMap::new()));
  }

  #[test]
  fn test_paths_are_unique() {
    let mut paths: Vec<&str> = Resource::ALL.iter().map(|r| r.path()).collect();
    paths.sort_unstable();
    paths.dedup();
    assert_eq!(paths.len(), Resource::ALL.len());
    assert_eq!(Resource::PpeDeliveries.item_path("7"), "ppe-deliveries/7");
  }

  #[test]
  fn test_cli_names() {
    assert_eq!(
      Resource::from_str("ppe-deliveries", true).unwrap(),
      Resource::PpeDeliveries
    );
    assert_eq!(
      Resource::from_str("change-logs", true).unwrap(),
      Resource::ChangeLogs
    );
  }
}
