use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use fieldsync::api::{ApiClient, Backend, Resource, AUTH_TOKEN_KEY};
use fieldsync::cache::{CachePersister, QueryCache};
use fieldsync::config::Config;
use fieldsync::lifecycle::{Connectivity, LifecycleEvent};
use fieldsync::logging;
use fieldsync::storage::{LocalStorage, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-friendly client for the field operations backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL, overrides api.base_url
  #[arg(long)]
  api_url: Option<String>,

  /// Never touch the network, answer from the cache only
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a collection or a single record through the cache
  Fetch {
    resource: Resource,
    id: Option<String>,
    /// Query parameter as key=value, repeatable
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Print a stale cached value instead of waiting for the network
    #[arg(long)]
    stale_ok: bool,
  },
  /// Create a record from a JSON body
  Create {
    resource: Resource,
    #[arg(short, long)]
    data: String,
  },
  /// Update a record with a JSON body
  Update {
    resource: Resource,
    id: String,
    #[arg(short, long)]
    data: String,
  },
  Delete {
    resource: Resource,
    id: String,
  },
  /// Mark every cached query of a collection as stale
  Invalidate { resource: Resource },
  /// List cached queries with their age
  Cache,
  /// Store the bearer token used for API requests
  Login { token: String },
  Logout,
  /// Raw access to local storage
  #[command(subcommand)]
  Storage(StorageCommand),
}

#[derive(Subcommand, Debug)]
enum StorageCommand {
  Get { key: String },
  Set { key: String, value: String },
  Remove { key: String },
  Clear,
  List,
  /// Number of stored keys
  Length,
}

impl Command {
  /// Raw storage writes must not be overwritten by the cache on exit.
  fn persists_cache(&self) -> bool {
    !matches!(
      self,
      Command::Storage(StorageCommand::Set { .. })
        | Command::Storage(StorageCommand::Remove { .. })
        | Command::Storage(StorageCommand::Clear)
    )
  }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected key=value, got '{}'", raw)),
  }
}

fn parse_body(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON body: {}", e))
}

fn load_config(args: &Args) -> Result<Config> {
  let mut config = match Config::load(args.config.as_deref()) {
    Ok(config) => config,
    // A base URL on the command line is enough to run without a file
    Err(_) if args.config.is_none() && args.api_url.is_some() => {
      Config::with_base_url(args.api_url.clone().unwrap_or_default())
    }
    Err(e) => return Err(e),
  };

  if let Some(url) = &args.api_url {
    config.api.base_url = url.clone();
  }

  Ok(config)
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn run(
  command: Command,
  backend: &Backend,
  storage: &LocalStorage<SqliteStore>,
) -> Result<()> {
  match command {
    Command::Fetch {
      resource,
      id,
      params,
      stale_ok,
    } => {
      let params: BTreeMap<String, String> = params.into_iter().collect();
      let result = match (id, stale_ok) {
        (Some(id), false) => backend.get(resource, &id).await?,
        (Some(id), true) => backend.get_or_stale(resource, &id).await?,
        (None, false) => backend.list(resource, &params).await?,
        (None, true) => backend.list_or_stale(resource, &params).await?,
      };
      print_json(&result.data)?;
      eprintln!("source: {}", result.source);
    }
    Command::Create { resource, data } => {
      let created = backend.create(resource, &parse_body(&data)?).await?;
      print_json(&created)?;
    }
    Command::Update { resource, id, data } => {
      let updated = backend.update(resource, &id, &parse_body(&data)?).await?;
      print_json(&updated)?;
    }
    Command::Delete { resource, id } => {
      let deleted = backend.delete(resource, &id).await?;
      if !deleted.is_null() {
        print_json(&deleted)?;
      }
    }
    Command::Invalidate { resource } => {
      let count = backend.invalidate(resource);
      println!("Invalidated {} cached queries for {}", count, resource.path());
    }
    Command::Cache => {
      let cache = backend.cache();
      let mut keys = cache.keys();
      keys.sort_by_key(|key| key.to_string());

      let now = Utc::now();
      for key in keys {
        let Some(entry) = cache.read(&key) else {
          continue;
        };
        let age = (now - entry.fetched_at).num_seconds().max(0);
        let state = if entry.is_stale() { "stale" } else { "fresh" };
        println!("{:<60} {:>6}s  {}", key.to_string(), age, state);
      }
    }
    Command::Login { token } => {
      storage.set_item(AUTH_TOKEN_KEY, token.trim());
      println!("Token stored");
    }
    Command::Logout => {
      storage.remove_item(AUTH_TOKEN_KEY);
      println!("Token removed");
    }
    Command::Storage(action) => match action {
      StorageCommand::Get { key } => match storage.get_item(&key) {
        Some(value) => println!("{}", value),
        None => return Err(eyre!("No value stored for '{}'", key)),
      },
      StorageCommand::Set { key, value } => storage.set_item(&key, &value),
      StorageCommand::Remove { key } => storage.remove_item(&key),
      StorageCommand::Clear => storage.clear(),
      StorageCommand::List => {
        for key in (0..storage.length()).filter_map(|i| storage.key(i)) {
          println!("{}", key);
        }
      }
      StorageCommand::Length => println!("{}", storage.length()),
    },
  }

  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = load_config(&args)?;
  let _log_guard = logging::init(&config.logging.level, &config.log_dir()?)?;
  info!(version = env!("CARGO_PKG_VERSION"), "Starting fieldsync");

  // Local storage must be loaded before anything reads from it
  let storage = LocalStorage::new(SqliteStore::open(&config.storage_path()?)?);
  storage.initialize().await;

  let connectivity = Connectivity::default();
  let cache = QueryCache::new(&config.cache, &config.retry, connectivity.clone());
  let persister = CachePersister::new(storage.clone(), &config.cache);
  let restored = persister.restore(&cache);
  debug!(restored, "Restored cached queries");

  if args.offline {
    cache.handle_lifecycle(LifecycleEvent::Offline);
  }

  let api = ApiClient::new(&config.api, Arc::new(storage.clone()), connectivity)?;
  let backend = Backend::new(api, cache.clone());

  let persist_cache = args.command.persists_cache();
  let outcome = run(args.command, &backend, &storage).await;

  // Background refreshes started by stale reads land before the cache is saved
  cache.settle().await;

  if persist_cache {
    let evicted = cache.collect_garbage();
    debug!(evicted = evicted.len(), "Dropped expired cached queries");
    match persister.persist(&cache) {
      Ok(count) => debug!(count, "Saved cached queries"),
      Err(e) => warn!("Failed to save query cache: {}", e),
    }
  }
  storage.flush().await;

  outcome
}
