use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::fetcher::{Fetcher, FetcherManager, FetcherMeta, SharedMeta, shared_meta};

const SPEED_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ready,
    Running,
    Pause,
    Wait,
    Error,
    Done,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "ready",
            Status::Running => "running",
            Status::Pause => "pause",
            Status::Wait => "wait",
            Status::Error => "error",
            Status::Done => "done",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ready" => Ok(Status::Ready),
            "running" => Ok(Status::Running),
            "pause" | "paused" => Ok(Status::Pause),
            "wait" | "waiting" => Ok(Status::Wait),
            "error" => Ok(Status::Error),
            "done" => Ok(Status::Done),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Active transfer time in nanoseconds.
    #[serde(default)]
    pub used: u64,
    /// Bytes per second.
    #[serde(default)]
    pub speed: u64,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub upload_speed: u64,
    #[serde(default)]
    pub uploaded: u64,
}

/// Accumulates active time across start/pause cycles.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    used: Duration,
    started_at: Option<Instant>,
}

impl Timer {
    pub fn with_used(used: Duration) -> Self {
        Self {
            used,
            started_at: None,
        }
    }

    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.used += started.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn used(&self) -> Duration {
        self.used + self.started_at.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Moving average of per-tick byte deltas over the last few seconds.
#[derive(Debug, Default)]
pub struct SpeedWindow {
    samples: VecDeque<u64>,
}

impl SpeedWindow {
    pub fn push(&mut self, delta: u64, tick: Duration) -> u64 {
        let secs = tick.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        let capacity = ((SPEED_WINDOW.as_secs_f64() / secs) as usize).max(1);
        self.samples.push_back(delta);
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
        let total: u64 = self.samples.iter().sum();
        (total as f64 / self.samples.len() as f64 / secs) as u64
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Serializable view of a task. This is both what gets persisted in the
/// `task` bucket and what queries hand out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub meta: Option<FetcherMeta>,
    pub status: Status,
    #[serde(default)]
    pub uploading: bool,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInfo {
    pub fn percent(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        (self.progress.downloaded as f64 / self.size as f64 * 100.0).min(100.0)
    }
}

/// Selects tasks for queries and bulk operations. All non-empty criteria
/// must hold; an empty filter selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<Status>,
    #[serde(default)]
    pub not_statuses: Vec<Status>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn statuses(statuses: impl IntoIterator<Item = Status>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn not_statuses(statuses: impl IntoIterator<Item = Status>) -> Self {
        Self {
            not_statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.statuses.is_empty() && self.not_statuses.is_empty()
    }

    pub fn matches(&self, id: &str, status: Status) -> bool {
        (self.ids.is_empty() || self.ids.iter().any(|i| i == id))
            && (self.statuses.is_empty() || self.statuses.contains(&status))
            && !self.not_statuses.contains(&status)
    }
}

/// Mutable part of a task, guarded by its status lock.
pub(crate) struct TaskState {
    pub status: Status,
    pub progress: Progress,
    pub uploading: bool,
    pub updated_at: DateTime<Utc>,
    pub timer: Timer,
    pub fetcher: Option<Arc<dyn Fetcher>>,
    /// Whether `start` has been called on the loaded fetcher.
    pub fetcher_started: bool,
    /// Created in this process and never started yet.
    pub fresh: bool,
    /// Sampled progress not yet written to storage.
    pub dirty: bool,
    pub speed: SpeedWindow,
    pub upload_speed: SpeedWindow,
}

impl TaskState {
    pub fn set_status(&mut self, status: Status) {
        // The timer starts once the fetcher is actually transferring.
        if self.status == Status::Running && status != Status::Running {
            self.timer.pause();
        }
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Drop the live fetcher, returning it so the caller can persist or
    /// close it outside the lock.
    pub fn release_fetcher(&mut self) -> Option<Arc<dyn Fetcher>> {
        self.fetcher_started = false;
        self.speed.reset();
        self.upload_speed.reset();
        self.fetcher.take()
    }
}

pub(crate) struct Task {
    pub id: String,
    pub protocol: String,
    pub created_at: DateTime<Utc>,
    pub manager: Option<Arc<dyn FetcherManager>>,
    pub meta: Mutex<SharedMeta>,
    pub state: Mutex<TaskState>,
    /// Serializes start/pause/finish handlers of this task.
    pub handler_lock: tokio::sync::Mutex<()>,
    pub cancel: CancellationToken,
}

impl Task {
    pub fn new(
        id: String,
        manager: Arc<dyn FetcherManager>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            protocol: manager.name().to_string(),
            created_at: now,
            meta: Mutex::new(fetcher.meta()),
            manager: Some(manager),
            state: Mutex::new(TaskState {
                status: Status::Ready,
                progress: Progress::default(),
                uploading: false,
                updated_at: now,
                timer: Timer::default(),
                fetcher: Some(fetcher),
                fetcher_started: false,
                fresh: true,
                dirty: false,
                speed: SpeedWindow::default(),
                upload_speed: SpeedWindow::default(),
            }),
            handler_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Rebuild a task from its stored record. Returns `None` when the record
    /// has no metadata.
    pub fn from_info(info: TaskInfo, manager: Option<Arc<dyn FetcherManager>>) -> Option<Self> {
        let meta = info.meta?;
        let protocol = match &manager {
            Some(m) => m.name().to_string(),
            None => info.protocol,
        };
        Some(Self {
            id: info.id,
            protocol,
            created_at: info.created_at,
            manager,
            meta: Mutex::new(shared_meta(meta)),
            state: Mutex::new(TaskState {
                status: info.status,
                progress: info.progress,
                uploading: info.uploading,
                updated_at: info.updated_at,
                timer: Timer::with_used(Duration::from_nanos(info.progress.used)),
                fetcher: None,
                fetcher_started: false,
                fresh: false,
                dirty: false,
                speed: SpeedWindow::default(),
                upload_speed: SpeedWindow::default(),
            }),
            handler_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn is_deleted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn shared_meta(&self) -> SharedMeta {
        self.meta.lock().clone()
    }

    /// Point the task at the metadata owned by `fetcher`.
    pub fn bind_meta(&self, fetcher: &Arc<dyn Fetcher>) {
        *self.meta.lock() = fetcher.meta();
    }

    pub fn fetcher(&self) -> Option<Arc<dyn Fetcher>> {
        self.state.lock().fetcher.clone()
    }

    pub fn name(&self, meta: &FetcherMeta) -> String {
        if !meta.opts.name.is_empty() {
            return meta.opts.name.clone();
        }
        if let Some(res) = &meta.res {
            if !res.name.is_empty() {
                return res.name.clone();
            }
            if let Some(file) = res.files.first() {
                return file.name.clone();
            }
        }
        self.manager
            .as_ref()
            .map(|m| m.parse_name(&meta.req.url))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Lock-free copy of the task, safe to persist or hand out.
    pub fn info(&self) -> TaskInfo {
        let (status, mut progress, uploading, updated_at, used) = {
            let state = self.state.lock();
            (
                state.status,
                state.progress,
                state.uploading,
                state.updated_at,
                state.timer.used(),
            )
        };
        progress.used = used.as_nanos() as u64;

        let meta = self.shared_meta().read().clone();
        let size = meta.res.as_ref().map(|r| r.size).unwrap_or(0);
        TaskInfo {
            id: self.id.clone(),
            protocol: self.protocol.clone(),
            name: self.name(&meta),
            meta: Some(meta),
            status,
            uploading,
            progress,
            size,
            created_at: self.created_at,
            updated_at,
        }
    }
}

pub(crate) fn same_fetcher(a: &Arc<dyn Fetcher>, b: &Arc<dyn Fetcher>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
