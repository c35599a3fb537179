//! Single-connection HTTP(S) fetcher.
//!
//! Resolution sends a one-byte ranged request to learn the size and whether
//! the server honours `Range`. Transfers resume at the persisted byte
//! offset when it does, and restart from zero otherwise.

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Controller, FetchProgress, Fetcher, FetcherManager, FetcherMeta, FileInfo, Options, Request,
    Resource, SharedMeta, UrlFilter, shared_meta,
};
use crate::util::safe_filename;

static FILENAME_EXT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\*\s*=\s*(?:[\w-]+'[\w-]*')?"?([^";]+)"?"#).ok());
static FILENAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\s*=\s*"?([^";]+)"?"#).ok());

fn default_user_agent() -> String {
    format!("ferry/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_timeout_secs() -> u64 {
    30
}

/// Protocol configuration, looked up under the `http` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Attempts per start before the task fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedState {
    #[serde(default)]
    downloaded: u64,
}

#[derive(Debug, Default)]
pub struct HttpFetcherManager;

impl HttpFetcherManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FetcherManager for HttpFetcherManager {
    fn name(&self) -> &str {
        "http"
    }

    fn filters(&self) -> Vec<UrlFilter> {
        vec![UrlFilter::url("http"), UrlFilter::url("https")]
    }

    fn build(&self) -> Arc<dyn Fetcher> {
        Arc::new(HttpFetcher::new(shared_meta(FetcherMeta::default()), 0))
    }

    fn parse_name(&self, url: &str) -> String {
        name_from_url(url).unwrap_or_default()
    }

    fn auto_rename(&self) -> bool {
        true
    }

    fn default_config(&self) -> Option<Value> {
        serde_json::to_value(HttpConfig::default()).ok()
    }

    fn restore(&self, meta: SharedMeta, data: Option<Value>) -> anyhow::Result<Arc<dyn Fetcher>> {
        let saved: SavedState = match data {
            Some(value) => serde_json::from_value(value).context("Invalid saved HTTP state")?,
            None => SavedState::default(),
        };
        Ok(Arc::new(HttpFetcher::new(meta, saved.downloaded)))
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type Outcome = Option<Result<(), String>>;

pub struct HttpFetcher {
    meta: SharedMeta,
    config: RwLock<HttpConfig>,
    client: RwLock<Option<Client>>,
    downloaded: Arc<AtomicU64>,
    retries: Arc<AtomicU32>,
    worker: Mutex<Option<Worker>>,
    done: Arc<watch::Sender<Outcome>>,
}

impl HttpFetcher {
    fn new(meta: SharedMeta, downloaded: u64) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            meta,
            config: RwLock::new(HttpConfig::default()),
            client: RwLock::new(None),
            downloaded: Arc::new(AtomicU64::new(downloaded)),
            retries: Arc::new(AtomicU32::new(0)),
            worker: Mutex::new(None),
            done: Arc::new(done),
        }
    }

    fn client(&self) -> anyhow::Result<Client> {
        if let Some(client) = self.client.read().as_ref() {
            return Ok(client.clone());
        }
        let config = self.config.read().clone();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent)
            .build()
            .context("Failed to create HTTP client")?;
        *self.client.write() = Some(client.clone());
        Ok(client)
    }

    async fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!("HTTP transfer worker ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn setup(&self, controller: Controller) {
        match controller.config::<HttpConfig>() {
            Ok(config) => *self.config.write() = config,
            Err(e) => warn!("invalid HTTP config, using defaults: {:#}", e),
        }
        *self.client.write() = None;
    }

    async fn resolve(&self, req: &Request) -> anyhow::Result<()> {
        let client = self.client()?;
        let response = client
            .get(&req.url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .context("Failed to send HTTP request")?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP request failed with status: {}", status);
        }

        let headers = response.headers();
        let (range, size) = if status == StatusCode::PARTIAL_CONTENT {
            match content_range_total(headers) {
                Some(total) => (true, total),
                None => (false, 0),
            }
        } else {
            (false, response.content_length().unwrap_or(0))
        };
        let name = name_from_headers(headers)
            .or_else(|| name_from_url(response.url().as_str()))
            .or_else(|| name_from_url(&req.url))
            .unwrap_or_else(|| "download".to_string());
        debug!("resolved {}: {} ({} bytes, range: {})", req.url, name, size, range);

        let mut meta = self.meta.write();
        meta.req = req.clone();
        meta.res = Some(Resource {
            name: String::new(),
            size,
            range,
            files: vec![FileInfo {
                name,
                path: String::new(),
                size,
            }],
        });
        Ok(())
    }

    fn create(&self, opts: &Options) -> anyhow::Result<()> {
        self.meta.write().opts = opts.clone();
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.done.borrow().is_some() {
            return Ok(());
        }
        let client = self.client()?;

        let (url, path, range, size) = {
            let meta = self.meta.read();
            let res = meta
                .res
                .as_ref()
                .ok_or_else(|| anyhow!("HTTP task started before it was resolved"))?;
            let path = meta
                .single_filepath()
                .ok_or_else(|| anyhow!("HTTP resource has no file"))?;
            (meta.req.url.clone(), path, res.range, res.size)
        };
        let config = self.config.read().clone();

        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let transfer = Transfer {
            client,
            url,
            path,
            range,
            size,
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            downloaded: self.downloaded.clone(),
            retries: self.retries.clone(),
            cancel: cancel.clone(),
            done: self.done.clone(),
        };
        let handle = tokio::spawn(transfer.run());
        *worker = Some(Worker { cancel, handle });
        Ok(())
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.stop_worker().await;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.stop_worker().await;
        Ok(())
    }

    async fn wait(&self) -> anyhow::Result<()> {
        let mut rx = self.done.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("HTTP fetcher dropped"))?
            .clone();
        match outcome {
            Some(Err(e)) => Err(anyhow!(e)),
            _ => Ok(()),
        }
    }

    fn meta(&self) -> SharedMeta {
        self.meta.clone()
    }

    fn progress(&self) -> FetchProgress {
        FetchProgress::single(self.downloaded.load(Ordering::SeqCst))
    }

    fn store(&self) -> anyhow::Result<Option<Value>> {
        let state = SavedState {
            downloaded: self.downloaded.load(Ordering::SeqCst),
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn stats(&self) -> Value {
        json!({
            "downloaded": self.downloaded.load(Ordering::SeqCst),
            "retries": self.retries.load(Ordering::SeqCst),
        })
    }
}

struct Transfer {
    client: Client,
    url: String,
    path: PathBuf,
    range: bool,
    size: u64,
    max_retries: u32,
    retry_delay: Duration,
    downloaded: Arc<AtomicU64>,
    retries: Arc<AtomicU32>,
    cancel: CancellationToken,
    done: Arc<watch::Sender<Outcome>>,
}

impl Transfer {
    async fn run(self) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                result = self.attempt() => result,
                _ = self.cancel.cancelled() => return,
            };

            match result {
                Ok(()) => {
                    self.done.send_replace(Some(Ok(())));
                    return;
                }
                Err(e) if attempt >= self.max_retries => {
                    self.done.send_replace(Some(Err(format!("{:#}", e))));
                    return;
                }
                Err(e) => {
                    self.retries.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "download attempt {}/{} for {} failed: {:#}",
                        attempt, self.max_retries, self.url, e
                    );
                    tokio::select! {
                        _ = sleep(self.retry_delay) => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn attempt(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create parent directories")?;
        }

        let mut offset = if self.range {
            self.downloaded.load(Ordering::SeqCst)
        } else {
            0
        };
        if self.size > 0 && offset >= self.size {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.path)
                .context("Failed to open output file")?;
            file.set_len(self.size).context("Failed to truncate output file")?;
            self.downloaded.store(self.size, Ordering::SeqCst);
            return Ok(());
        }

        let mut request = self.client.get(&self.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await.context("Failed to send HTTP request")?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP request failed with status: {}", status);
        }
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            debug!("{} ignored the range request, restarting", self.url);
            offset = 0;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .context("Failed to open output file")?;
        file.set_len(offset).context("Failed to truncate output file")?;
        file.seek(SeekFrom::Start(offset))
            .context("Failed to seek output file")?;
        self.downloaded.store(offset, Ordering::SeqCst);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read chunk from response")?;
            file.write_all(&chunk)
                .context("Failed to write chunk to file")?;
            self.downloaded
                .fetch_add(chunk.len() as u64, Ordering::SeqCst);
        }
        file.flush().context("Failed to flush file")?;

        let downloaded = self.downloaded.load(Ordering::SeqCst);
        if self.size > 0 && downloaded < self.size {
            bail!(
                "connection closed after {} of {} bytes",
                downloaded,
                self.size
            );
        }
        Ok(())
    }
}

/// Total length from `Content-Range: bytes 0-0/1234`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .split('/')
        .nth(1)?
        .trim()
        .parse()
        .ok()
}

fn name_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let raw = [&*FILENAME_EXT, &*FILENAME]
        .into_iter()
        .flatten()
        .find_map(|re| re.captures(value))
        .and_then(|caps| caps.get(1))
        .map(|m| percent_decode(m.as_str().trim()))?;
    let name = safe_filename(&raw);
    (!name.is_empty()).then_some(name)
}

fn name_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let name = safe_filename(&percent_decode(segment));
    (!name.is_empty()).then_some(name)
}

fn percent_decode(input: &str) -> String {
    match urlencoding::decode(input) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(input.as_bytes())).into_owned(),
    }
}
