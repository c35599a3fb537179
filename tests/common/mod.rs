#![allow(dead_code)]

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use ferry::download::DownloadEvent;
use ferry::fetcher::{
    Controller, FetchProgress, Fetcher, FetcherManager, FileInfo, Options, Request, Resource,
    ResolveHook, SharedMeta, Uploader, UrlFilter, shared_meta,
};
use ferry::{Downloader, Status, TaskInfo};
use futures_util::stream;
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::{Value, json};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(15);

/// Byte `i` of every generated payload.
pub fn pattern(offset: u64, len: usize) -> Vec<u8> {
    (offset..offset + len as u64)
        .map(|i| (i % 251) as u8)
        .collect()
}

pub fn assert_pattern_file(path: &Path, size: u64) {
    let data = std::fs::read(path).unwrap();
    assert_eq!(data.len() as u64, size, "unexpected size of {:?}", path);
    assert!(data == pattern(0, size as usize), "corrupted content in {:?}", path);
}

/// Observations shared by every mock fetcher of one manager.
#[derive(Default)]
pub struct MockRecorder {
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub start_offsets: Mutex<Vec<(String, u64)>>,
    pub stop_uploads: AtomicBool,
}

impl MockRecorder {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn offsets_for(&self, name: &str) -> Vec<u64> {
        self.start_offsets
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, o)| *o)
            .collect()
    }
}

struct ActiveGuard(Arc<MockRecorder>);

impl ActiveGuard {
    fn new(recorder: Arc<MockRecorder>) -> Self {
        let now = recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        recorder.max_active.fetch_max(now, Ordering::SeqCst);
        Self(recorder)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Parameters read from `mock://host/<name>?size=&chunk=&delay=&fail=&upload=`.
#[derive(Debug, Clone)]
struct MockParams {
    name: String,
    size: u64,
    chunk: usize,
    delay: Duration,
    fail_at: Option<u64>,
    upload: bool,
}

impl MockParams {
    fn parse(url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(url)?;
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("mock.bin")
            .to_string();
        let mut params = Self {
            name,
            size: 1024,
            chunk: 256,
            delay: Duration::from_millis(2),
            fail_at: None,
            upload: false,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "size" => params.size = value.parse()?,
                "chunk" => params.chunk = value.parse()?,
                "delay" => params.delay = Duration::from_millis(value.parse()?),
                "fail" => params.fail_at = Some(value.parse()?),
                "upload" => params.upload = value == "1",
                "unreachable" => bail!("host unreachable"),
                _ => {}
            }
        }
        Ok(params)
    }
}

pub fn mock_url(name: &str, size: u64, chunk: usize, delay_ms: u64) -> String {
    format!(
        "mock://test/{}?size={}&chunk={}&delay={}",
        name, size, chunk, delay_ms
    )
}

#[derive(Clone)]
pub struct MockManager {
    pub recorder: Arc<MockRecorder>,
}

impl MockManager {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(MockRecorder::default()),
        }
    }
}

#[async_trait]
impl FetcherManager for MockManager {
    fn name(&self) -> &str {
        "mock"
    }

    fn filters(&self) -> Vec<UrlFilter> {
        vec![UrlFilter::url("mock")]
    }

    fn build(&self) -> Arc<dyn Fetcher> {
        Arc::new(MockFetcher::new(
            shared_meta(Default::default()),
            0,
            self.recorder.clone(),
        ))
    }

    fn parse_name(&self, url: &str) -> String {
        MockParams::parse(url).map(|p| p.name).unwrap_or_default()
    }

    fn auto_rename(&self) -> bool {
        true
    }

    fn restore(&self, meta: SharedMeta, data: Option<Value>) -> anyhow::Result<Arc<dyn Fetcher>> {
        let downloaded = match data {
            Some(value) => value
                .get("downloaded")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("invalid mock state"))?,
            None => 0,
        };
        Ok(Arc::new(MockFetcher::new(meta, downloaded, self.recorder.clone())))
    }
}

type Outcome = Option<Result<(), String>>;

pub struct MockFetcher {
    meta: SharedMeta,
    recorder: Arc<MockRecorder>,
    downloaded: Arc<AtomicU64>,
    upload: AtomicBool,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    done: Arc<watch::Sender<Outcome>>,
}

impl MockFetcher {
    fn new(meta: SharedMeta, downloaded: u64, recorder: Arc<MockRecorder>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            meta,
            recorder,
            downloaded: Arc::new(AtomicU64::new(downloaded)),
            upload: AtomicBool::new(false),
            worker: Mutex::new(None),
            done: Arc::new(done),
        }
    }

    async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((cancel, handle)) = worker {
            cancel.cancel();
            let _ = handle.await;
        }
    }
}

async fn transfer(
    params: MockParams,
    path: std::path::PathBuf,
    downloaded: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let start = downloaded.load(Ordering::SeqCst);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    file.set_len(start)?;
    file.seek(SeekFrom::Start(start))?;

    loop {
        let offset = downloaded.load(Ordering::SeqCst);
        if offset >= params.size {
            return Ok(());
        }
        if let Some(fail_at) = params.fail_at {
            if start < fail_at && offset >= fail_at {
                bail!("injected failure at {}", offset);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(params.delay) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
        let len = params.chunk.min((params.size - offset) as usize);
        file.write_all(&pattern(offset, len))?;
        downloaded.fetch_add(len as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    fn setup(&self, _controller: Controller) {}

    async fn resolve(&self, req: &Request) -> anyhow::Result<()> {
        let params = MockParams::parse(&req.url)?;
        let mut meta = self.meta.write();
        meta.req = req.clone();
        meta.res = Some(Resource {
            name: String::new(),
            size: params.size,
            range: true,
            files: vec![FileInfo {
                name: params.name,
                path: String::new(),
                size: params.size,
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
        let (params, path) = {
            let meta = self.meta.read();
            let params = MockParams::parse(&meta.req.url)?;
            let path = meta
                .single_filepath()
                .ok_or_else(|| anyhow!("mock task started before resolve"))?;
            (params, path)
        };
        self.upload.store(params.upload, Ordering::SeqCst);

        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return Ok(());
        }
        self.recorder
            .start_offsets
            .lock()
            .push((params.name.clone(), self.downloaded.load(Ordering::SeqCst)));

        let cancel = CancellationToken::new();
        let downloaded = self.downloaded.clone();
        let done = self.done.clone();
        let recorder = self.recorder.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let _active = ActiveGuard::new(recorder);
            let result = transfer(params, path, downloaded, token.clone()).await;
            if token.is_cancelled() {
                return;
            }
            done.send_replace(Some(result.map_err(|e| e.to_string())));
        });
        *worker = Some((cancel, handle));
        Ok(())
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.stop().await;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.stop().await;
        Ok(())
    }

    async fn wait(&self) -> anyhow::Result<()> {
        let mut rx = self.done.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("mock fetcher dropped"))?
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
        Ok(Some(json!({"downloaded": self.downloaded.load(Ordering::SeqCst)})))
    }

    fn stats(&self) -> Value {
        json!({"downloaded": self.downloaded.load(Ordering::SeqCst)})
    }

    fn as_uploader(&self) -> Option<&dyn Uploader> {
        if self.upload.load(Ordering::SeqCst) {
            Some(self)
        } else {
            None
        }
    }
}

impl Uploader for MockFetcher {
    fn uploaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    fn is_uploading(&self) -> bool {
        !self.recorder.stop_uploads.load(Ordering::SeqCst)
    }
}

/// Answers every request itself.
pub struct StaticHook(pub Resource);

#[async_trait]
impl ResolveHook for StaticHook {
    async fn on_resolve(&self, _req: &Request) -> anyhow::Result<Option<Resource>> {
        Ok(Some(self.0.clone()))
    }
}

pub struct FailingHook;

#[async_trait]
impl ResolveHook for FailingHook {
    async fn on_resolve(&self, _req: &Request) -> anyhow::Result<Option<Resource>> {
        bail!("hook offline")
    }
}

/// Panics on URLs containing `panic`.
pub struct PanickingHook;

#[async_trait]
impl ResolveHook for PanickingHook {
    async fn on_resolve(&self, req: &Request) -> anyhow::Result<Option<Resource>> {
        if req.url.contains("panic") {
            panic!("hook exploded on {}", req.url);
        }
        Ok(None)
    }
}

pub async fn next_event<F>(events: &mut UnboundedReceiver<DownloadEvent>, mut pred: F) -> DownloadEvent
where
    F: FnMut(&DownloadEvent) -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_done(events: &mut UnboundedReceiver<DownloadEvent>, id: &str) -> TaskInfo {
    match next_event(events, |e| {
        e.task_id() == id && matches!(e, DownloadEvent::Done { .. } | DownloadEvent::Error { .. })
    })
    .await
    {
        DownloadEvent::Done { task } => task,
        other => panic!("task {} did not finish: {:?}", id, other),
    }
}

/// Wait until the sampler reports some progress for `id`.
pub async fn wait_progress(events: &mut UnboundedReceiver<DownloadEvent>, id: &str, at_least: u64) {
    next_event(events, |e| {
        e.task_id() == id
            && matches!(e, DownloadEvent::Progress { task } if task.progress.downloaded >= at_least)
    })
    .await;
}

pub async fn wait_status(downloader: &Downloader, id: &str, status: Status) -> TaskInfo {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(task) = downloader.get_task(id) {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {} never reached {}", id, status))
}

/// HTTP file server for one payload, with switchable `Range` support.
pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ServeOptions {
    pub ranges: bool,
    pub disposition: Option<String>,
    /// Pause between 4 KiB chunks of a response body.
    pub throttle: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            ranges: true,
            disposition: None,
            throttle: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
struct ServerState {
    body: Arc<Vec<u8>>,
    options: ServeOptions,
    requests: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start(body: Vec<u8>, options: ServeOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let state = ServerState {
            body: Arc::new(body),
            options,
            requests: requests.clone(),
        };
        let app = Router::new().fallback(serve_body).with_state(state);
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr,
            requests,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, PartialEq)]
pub enum ByteRange {
    Full,
    Partial(u64, u64),
    Unsatisfiable,
}

/// Interpret a `Range` header against a body of `len` bytes. Multiple
/// ranges and malformed specs are answered with the whole body.
pub fn parse_range(value: &str, len: u64) -> ByteRange {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return ByteRange::Full;
    };
    let last_byte = len.saturating_sub(1);
    let (start, end) = match (first.parse::<u64>(), last.parse::<u64>()) {
        (Ok(start), Ok(end)) if start <= end => (start, end.min(last_byte)),
        (Ok(start), Err(_)) if last.is_empty() => (start, last_byte),
        (Err(_), Ok(suffix)) if first.is_empty() => {
            if suffix == 0 {
                return ByteRange::Unsatisfiable;
            }
            (len.saturating_sub(suffix), last_byte)
        }
        _ => return ByteRange::Full,
    };
    if start >= len {
        ByteRange::Unsatisfiable
    } else {
        ByteRange::Partial(start, end)
    }
}

async fn serve_body(State(state): State<ServerState>, uri: Uri, headers: HeaderMap) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if uri.path().starts_with("/missing") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let len = state.body.len() as u64;
    let mut out = HeaderMap::new();
    if let Some(disposition) = &state.options.disposition {
        out.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(disposition).unwrap(),
        );
    }

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) if state.options.ranges => parse_range(value, len),
        _ => ByteRange::Full,
    };
    let (status, start, end) = match range {
        ByteRange::Full => (StatusCode::OK, 0, len),
        ByteRange::Partial(start, end) => {
            out.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, len)).unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, start, end + 1)
        }
        ByteRange::Unsatisfiable => {
            out.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{}", len)).unwrap(),
            );
            return (StatusCode::RANGE_NOT_SATISFIABLE, out).into_response();
        }
    };
    if state.options.ranges {
        out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start));

    let body = throttled(
        state.body.clone(),
        start as usize,
        end as usize,
        state.options.throttle,
    );
    (status, out, body).into_response()
}

fn throttled(body: Arc<Vec<u8>>, start: usize, end: usize, throttle: Duration) -> Body {
    const CHUNK: usize = 4096;
    let chunks = stream::unfold(start, move |offset| {
        let body = body.clone();
        async move {
            if offset >= end {
                return None;
            }
            if offset > start && !throttle.is_zero() {
                tokio::time::sleep(throttle).await;
            }
            let next = (offset + CHUNK).min(end);
            Some((Ok::<_, std::io::Error>(body[offset..next].to_vec()), next))
        }
    });
    Body::from_stream(chunks)
}
