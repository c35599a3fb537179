use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::fetcher::http::HttpFetcherManager;
use crate::fetcher::{FetcherManager, ResolveHook};
use crate::storage::{MemoryStorage, Storage};

pub const DEFAULT_MAX_RUNNING: usize = 5;
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(350);
pub const DEFAULT_RESOLVE_TTL: Duration = Duration::from_secs(600);

fn default_max_running() -> usize {
    DEFAULT_MAX_RUNNING
}

/// Settings that live in storage and can be changed at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub first_load: bool,
    #[serde(default)]
    pub download_dir: PathBuf,
    #[serde(default = "default_max_running")]
    pub max_running: usize,
    /// Per-protocol settings keyed by manager name.
    #[serde(default)]
    pub protocol_config: BTreeMap<String, Value>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            first_load: false,
            download_dir: PathBuf::new(),
            max_running: DEFAULT_MAX_RUNNING,
            protocol_config: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl StoreConfig {
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_max_running(mut self, max_running: usize) -> Self {
        self.max_running = max_running;
        self
    }

    pub(crate) fn normalize(mut self) -> Self {
        if self.max_running == 0 {
            self.max_running = DEFAULT_MAX_RUNNING;
        }
        self
    }
}

/// Everything a [`Downloader`](super::Downloader) is built from.
pub struct DownloaderConfig {
    pub managers: Vec<Arc<dyn FetcherManager>>,
    pub storage: Arc<dyn Storage>,
    pub refresh_interval: Duration,
    /// How long an unconsumed resolution stays claimable.
    pub resolve_ttl: Duration,
    pub resolve_hook: Option<Arc<dyn ResolveHook>>,
    /// Used only when storage holds no configuration yet.
    pub store: StoreConfig,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            managers: vec![Arc::new(HttpFetcherManager::new())],
            storage: Arc::new(MemoryStorage::new()),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            resolve_ttl: DEFAULT_RESOLVE_TTL,
            resolve_hook: None,
            store: StoreConfig::default(),
        }
    }
}

impl DownloaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered protocols.
    pub fn with_managers(mut self, managers: Vec<Arc<dyn FetcherManager>>) -> Self {
        self.managers = managers;
        self
    }

    pub fn with_manager(mut self, manager: Arc<dyn FetcherManager>) -> Self {
        self.managers.push(manager);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_resolve_ttl(mut self, ttl: Duration) -> Self {
        self.resolve_ttl = ttl;
        self
    }

    pub fn with_resolve_hook(mut self, hook: Arc<dyn ResolveHook>) -> Self {
        self.resolve_hook = Some(hook);
        self
    }

    pub fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}
