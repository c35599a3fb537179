//! Protocol plugin contract.
//!
//! A [`FetcherManager`] claims URLs through its [`UrlFilter`]s and builds one
//! [`Fetcher`] per task. The downloader only ever talks to protocols through
//! these two traits; it never looks at how bytes move.

pub mod http;
pub mod model;

pub use model::{
    FetchProgress, FetcherMeta, FileInfo, Options, Request, Resource, SharedMeta, shared_meta,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Shared infrastructure handed to every fetcher before use.
#[derive(Debug, Clone, Default)]
pub struct Controller {
    protocol_config: Option<Value>,
}

impl Controller {
    pub fn new(protocol_config: Option<Value>) -> Self {
        Self { protocol_config }
    }

    /// Deserialize this protocol's configuration, falling back to `T::default()`
    /// when none was registered.
    pub fn config<T: DeserializeOwned + Default>(&self) -> anyhow::Result<T> {
        match &self.protocol_config {
            Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
            _ => Ok(T::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Pattern is a URL scheme, `http` matches `http://...`.
    Url,
    /// Pattern is a file extension, `torrent` matches `x.torrent`.
    File,
    /// Pattern is the mime type of a `data:` URI.
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlFilter {
    pub kind: FilterType,
    pub pattern: String,
}

impl UrlFilter {
    pub fn url(scheme: &str) -> Self {
        Self {
            kind: FilterType::Url,
            pattern: scheme.to_string(),
        }
    }

    pub fn file(extension: &str) -> Self {
        Self {
            kind: FilterType::File,
            pattern: extension.to_string(),
        }
    }

    pub fn base64(mime: &str) -> Self {
        Self {
            kind: FilterType::Base64,
            pattern: mime.to_string(),
        }
    }

    /// Case-insensitive match of a request URL.
    pub fn matches(&self, url: &str) -> bool {
        let url = url.to_ascii_uppercase();
        let pattern = self.pattern.to_ascii_uppercase();
        match self.kind {
            FilterType::Url => url.starts_with(&format!("{}:", pattern)),
            FilterType::File => url.ends_with(&format!(".{}", pattern)),
            FilterType::Base64 => url.starts_with(&format!("DATA:{};BASE64,", pattern)),
        }
    }
}

/// Optional capability of fetchers that keep serving data after completion.
pub trait Uploader: Send + Sync {
    fn uploaded_bytes(&self) -> u64;

    /// Whether the fetcher is still seeding.
    fn is_uploading(&self) -> bool;
}

/// One protocol engine bound to one task.
///
/// All methods take `&self`; implementations keep their own interior state
/// so the downloader can hold a fetcher behind an `Arc` while a watcher is
/// blocked in [`Fetcher::wait`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn setup(&self, controller: Controller);

    /// Inspect the request and fill `meta().res` without transferring data.
    async fn resolve(&self, req: &Request) -> anyhow::Result<()>;

    /// Bind destination options. The transfer does not start yet.
    fn create(&self, opts: &Options) -> anyhow::Result<()>;

    async fn start(&self) -> anyhow::Result<()>;

    async fn pause(&self) -> anyhow::Result<()>;

    /// Continue a paused transfer.
    async fn resume(&self) -> anyhow::Result<()> {
        self.start().await
    }

    async fn close(&self) -> anyhow::Result<()>;

    /// Block until the transfer is done or has failed. Pausing does not
    /// make this return.
    async fn wait(&self) -> anyhow::Result<()>;

    fn meta(&self) -> SharedMeta;

    fn progress(&self) -> FetchProgress;

    /// Protocol-private state needed to resume after a restart.
    fn store(&self) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    fn stats(&self) -> Value {
        Value::Null
    }

    fn as_uploader(&self) -> Option<&dyn Uploader> {
        None
    }
}

/// Factory and URL-matching policy for one protocol.
#[async_trait]
pub trait FetcherManager: Send + Sync {
    fn name(&self) -> &str;

    fn filters(&self) -> Vec<UrlFilter>;

    fn build(&self) -> Arc<dyn Fetcher>;

    /// Display name for a task that has not been resolved yet.
    fn parse_name(&self, _url: &str) -> String {
        String::new()
    }

    /// Whether destination names are de-duplicated before the first start.
    fn auto_rename(&self) -> bool {
        false
    }

    fn default_config(&self) -> Option<Value> {
        None
    }

    /// Rebuild a fetcher from persisted metadata and its private blob.
    fn restore(&self, meta: SharedMeta, data: Option<Value>) -> anyhow::Result<Arc<dyn Fetcher>>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn accepts(&self, url: &str) -> bool {
        self.filters().iter().any(|f| f.matches(url))
    }
}

/// Site-specific resolution that may answer a request before the protocol
/// plugin is asked.
#[async_trait]
pub trait ResolveHook: Send + Sync {
    /// `Ok(None)` hands the request to the fetcher.
    async fn on_resolve(&self, req: &Request) -> anyhow::Result<Option<Resource>>;
}
