//! Backend access with transparent caching.

use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;

use super::client::ApiClient;
use super::resource::Resource;
use crate::cache::{CacheError, CacheResult, FetchError, QueryCache, QueryKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
  /// Wait for the network when the cached value is stale
  Fresh,
  /// Serve a stale value and revalidate in the background
  StaleOk,
}

/// REST backend with transparent caching support.
///
/// Reads go through the query cache; writes use the mutation retry policy
/// and invalidate the affected collections when they succeed.
#[derive(Clone)]
pub struct Backend {
  api: ApiClient,
  cache: QueryCache<Value>,
}

impl Backend {
  pub fn new(api: ApiClient, cache: QueryCache<Value>) -> Self {
    Self { api, cache }
  }

  pub fn cache(&self) -> &QueryCache<Value> {
    &self.cache
  }

  /// List a collection with caching.
  pub async fn list(
    &self,
    resource: Resource,
    params: &BTreeMap<String, String>,
  ) -> Result<CacheResult<Value>, CacheError> {
    self.list_with(resource, params, Freshness::Fresh).await
  }

  /// Like [`Backend::list`], but a stale cached list is returned at once and
  /// refreshed in the background.
  pub async fn list_or_stale(
    &self,
    resource: Resource,
    params: &BTreeMap<String, String>,
  ) -> Result<CacheResult<Value>, CacheError> {
    self.list_with(resource, params, Freshness::StaleOk).await
  }

  /// Get a single record with caching.
  pub async fn get(&self, resource: Resource, id: &str) -> Result<CacheResult<Value>, CacheError> {
    self.get_with(resource, id, Freshness::Fresh).await
  }

  pub async fn get_or_stale(
    &self,
    resource: Resource,
    id: &str,
  ) -> Result<CacheResult<Value>, CacheError> {
    self.get_with(resource, id, Freshness::StaleOk).await
  }

  async fn list_with(
    &self,
    resource: Resource,
    params: &BTreeMap<String, String>,
    freshness: Freshness,
  ) -> Result<CacheResult<Value>, CacheError> {
    let key = resource.list_key(params);
    let query: Vec<(String, String)> = params
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();

    let api = self.api.clone();
    self
      .read(&key, freshness, move || {
        let api = api.clone();
        let query = query.clone();
        async move { api.get(resource.path(), &query).await }
      })
      .await
  }

  async fn get_with(
    &self,
    resource: Resource,
    id: &str,
    freshness: Freshness,
  ) -> Result<CacheResult<Value>, CacheError> {
    let key = resource.detail_key(id);
    let path = resource.item_path(id);

    let api = self.api.clone();
    self
      .read(&key, freshness, move || {
        let api = api.clone();
        let path = path.clone();
        async move { api.get(&path, &[]).await }
      })
      .await
  }

  async fn read<F, Fut>(
    &self,
    key: &QueryKey,
    freshness: Freshness,
    fetch_fn: F,
  ) -> Result<CacheResult<Value>, CacheError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
  {
    match freshness {
      Freshness::Fresh => self.cache.ensure_fresh(key, fetch_fn).await,
      Freshness::StaleOk => self.cache.get_or_revalidate(key, fetch_fn).await,
    }
  }

  pub async fn create(&self, resource: Resource, body: &Value) -> Result<Value, CacheError> {
    let api = &self.api;
    self
      .cache
      .mutate_and_invalidate(&Self::affected(resource), move || {
        api.post(resource.path(), body)
      })
      .await
  }

  pub async fn update(
    &self,
    resource: Resource,
    id: &str,
    body: &Value,
  ) -> Result<Value, CacheError> {
    let path = resource.item_path(id);
    let (api, path) = (&self.api, path.as_str());
    self
      .cache
      .mutate_and_invalidate(&Self::affected(resource), move || api.put(path, body))
      .await
  }

  pub async fn delete(&self, resource: Resource, id: &str) -> Result<Value, CacheError> {
    let path = resource.item_path(id);
    let (api, path) = (&self.api, path.as_str());
    self
      .cache
      .mutate_and_invalidate(&Self::affected(resource), move || api.delete(path))
      .await
  }

  /// Invalidate every cached query of a collection.
  pub fn invalidate(&self, resource: Resource) -> usize {
    self.cache.invalidate_prefix(&resource.root_key())
  }

  /// Keys to invalidate after writing to `resource`.
  fn affected(resource: Resource) -> Vec<QueryKey> {
    std::iter::once(resource)
      .chain(resource.dependents().iter().copied())
      .map(Resource::root_key)
      .collect()
  }

  pub async fn get_customers(
    &self,
    params: &BTreeMap<String, String>,
  ) -> Result<CacheResult<Value>, CacheError> {
    self.list(Resource::Customers, params).await
  }

  pub async fn update_task(&self, id: &str, body: &Value) -> Result<Value, CacheError> {
    self.update(Resource::Tasks, id, body).await
  }
}
