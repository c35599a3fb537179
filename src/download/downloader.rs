use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{DownloaderConfig, StoreConfig};
use super::event::DownloadEvent;
use super::task::{Status, Task, TaskFilter, TaskInfo, same_fetcher};
use crate::error::{Error, Result};
use crate::fetcher::http::HttpFetcherManager;
use crate::fetcher::{
    Controller, Fetcher, FetcherManager, FetcherMeta, Options, Request, Resource, ResolveHook,
};
use crate::storage::{Storage, StorageExt};
use crate::util;

const BUCKET_TASK: &str = "task";
const BUCKET_SAVE: &str = "save";
const BUCKET_CONFIG: &str = "config";
const CONFIG_KEY: &str = "config";

/// Handle returned by [`Downloader::resolve`], claimable once by
/// [`Downloader::create`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveResult {
    pub id: String,
    pub res: Resource,
}

struct Pending {
    manager: Arc<dyn FetcherManager>,
    fetcher: Arc<dyn Fetcher>,
    created: Instant,
}

struct Watch {
    seq: u64,
    cancel: CancellationToken,
}

/// Task list and wait queue. A task sits in `waiting` iff its status is
/// `Wait`.
#[derive(Default)]
struct Queue {
    tasks: Vec<Arc<Task>>,
    waiting: VecDeque<Arc<Task>>,
}

impl Queue {
    fn running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status() == Status::Running)
            .count()
    }

    fn remove_waiting(&mut self, id: &str) {
        self.waiting.retain(|t| t.id != id);
    }

    fn select(&self, filter: &TaskFilter) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|t| filter.matches(&t.id, t.status()))
            .cloned()
            .collect()
    }
}

struct Inner {
    managers: Vec<Arc<dyn FetcherManager>>,
    storage: Arc<dyn Storage>,
    resolve_ttl: Duration,
    resolve_hook: Option<Arc<dyn ResolveHook>>,
    store_config: RwLock<StoreConfig>,
    queue: Mutex<Queue>,
    pending: Mutex<HashMap<String, Pending>>,
    watched: Mutex<HashMap<String, Watch>>,
    watch_seq: AtomicU64,
    rename_lock: Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<DownloadEvent>,
}

/// The task scheduler.
///
/// Cloning is cheap; every clone drives the same set of tasks. At most
/// `max_running` tasks are `Running` at any time, the rest wait in a FIFO
/// queue and are admitted as slots free up.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Downloader {
    /// Open the downloader and load persisted tasks. Must be called from
    /// within a Tokio runtime, the progress sampler is spawned here.
    ///
    /// Tasks that were active when the process stopped come back as
    /// `Pause`; nothing resumes until [`Downloader::resume`] is called.
    pub fn new(config: DownloaderConfig) -> Result<(Self, mpsc::UnboundedReceiver<DownloadEvent>)> {
        let DownloaderConfig {
            mut managers,
            storage,
            refresh_interval,
            resolve_ttl,
            resolve_hook,
            store,
        } = config;
        if managers.is_empty() {
            managers.push(Arc::new(HttpFetcherManager::new()));
        }

        storage.setup(&[BUCKET_TASK, BUCKET_SAVE, BUCKET_CONFIG])?;

        let store_config = match storage.get_json::<StoreConfig>(BUCKET_CONFIG, CONFIG_KEY) {
            Ok(Some(stored)) => stored,
            Ok(None) => StoreConfig {
                first_load: true,
                ..store
            },
            Err(Error::Serde(e)) => {
                warn!("ignoring unreadable stored config: {}", e);
                StoreConfig {
                    first_load: true,
                    ..store
                }
            }
            Err(e) => return Err(e),
        }
        .normalize();

        let mut tasks = Vec::new();
        for value in storage.list(BUCKET_TASK)? {
            let record: TaskInfo = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("dropping unreadable task record: {}", e);
                    continue;
                }
            };
            let manager = record
                .meta
                .as_ref()
                .and_then(|meta| find_manager(&managers, &meta.req.url));
            let id = record.id.clone();
            let Some(task) = Task::from_info(record, manager) else {
                warn!("dropping task {} without metadata", id);
                continue;
            };
            if task.manager.is_none() {
                warn!("no protocol registered for task {} ({})", id, task.protocol);
            }
            {
                let mut state = task.state.lock();
                if !state.status.is_terminal() {
                    state.status = Status::Pause;
                }
            }
            tasks.push(Arc::new(task));
        }
        tasks.sort_by_key(|t| t.created_at);
        debug!("loaded {} tasks from storage", tasks.len());

        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            managers,
            storage,
            resolve_ttl,
            resolve_hook,
            store_config: RwLock::new(store_config),
            queue: Mutex::new(Queue {
                tasks,
                waiting: VecDeque::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashMap::new()),
            watch_seq: AtomicU64::new(0),
            rename_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            events,
        });

        tokio::spawn(sample_loop(Arc::downgrade(&inner), refresh_interval));

        Ok((Self { inner }, receiver))
    }

    /// Resolve a request without committing to a task.
    pub async fn resolve(&self, req: Request) -> Result<ResolveResult> {
        self.inner.ensure_open()?;
        let manager = self.inner.manager_for(&req.url)?;
        let fetcher = self.inner.build_fetcher(&manager);
        let res = self.inner.resolve_with(&fetcher, &req).await?;

        let id = Uuid::new_v4().to_string();
        let ttl = self.inner.resolve_ttl;
        let mut pending = self.inner.pending.lock();
        pending.retain(|_, p| p.created.elapsed() < ttl);
        pending.insert(
            id.clone(),
            Pending {
                manager,
                fetcher,
                created: Instant::now(),
            },
        );
        debug!("resolved {} as {}", req.url, id);
        Ok(ResolveResult { id, res })
    }

    /// Turn a resolution into a task. Each resolution id can be used once.
    pub async fn create(&self, rid: &str, opts: Options) -> Result<String> {
        self.inner.ensure_open()?;
        let ttl = self.inner.resolve_ttl;
        let pending = self
            .inner
            .pending
            .lock()
            .remove(rid)
            .filter(|p| p.created.elapsed() < ttl)
            .ok_or(Error::InvalidResourceId)?;
        self.inner
            .create_task(pending.manager, pending.fetcher, opts)
    }

    /// Create a task straight from a request. Resolution happens when the
    /// task first starts.
    pub async fn create_direct(&self, req: Request, opts: Options) -> Result<String> {
        self.inner.ensure_open()?;
        let manager = self.inner.manager_for(&req.url)?;
        let fetcher = self.inner.build_fetcher(&manager);
        fetcher.meta().write().req = req;
        self.inner.create_task(manager, fetcher, opts)
    }

    pub async fn pause(&self, filter: &TaskFilter) -> Result<()> {
        self.inner.pause(filter).await
    }

    /// Continue matching tasks, preempting running ones if needed. An empty
    /// filter continues everything that fits without preempting.
    pub async fn resume(&self, filter: &TaskFilter) -> Result<()> {
        self.inner.ensure_open()?;
        if filter.is_empty() {
            self.inner.resume_all();
            return Ok(());
        }
        self.inner.resume(filter).await
    }

    /// Remove matching tasks and their stored state. With `force`, the
    /// downloaded files go too.
    pub async fn delete(&self, filter: &TaskFilter, force: bool) -> Result<()> {
        self.inner.delete(filter, force).await
    }

    pub fn get_task(&self, id: &str) -> Option<TaskInfo> {
        self.inner.find(id).map(|t| t.info())
    }

    pub fn get_tasks(&self) -> Vec<TaskInfo> {
        self.get_tasks_by_filter(&TaskFilter::all())
    }

    pub fn get_tasks_by_filter(&self, filter: &TaskFilter) -> Vec<TaskInfo> {
        let mut tasks = self.inner.queue.lock().select(filter);
        tasks.sort_by_key(|t| t.created_at);
        tasks.iter().map(|t| t.info()).collect()
    }

    /// Protocol-specific health statistics of a task.
    pub fn stats(&self, id: &str) -> Result<Value> {
        let task = self.inner.find(id).ok_or(Error::TaskNotFound)?;
        {
            let state = task.state.lock();
            if state.status.is_terminal() && state.fetcher.is_none() {
                return Ok(Value::Null);
            }
        }
        let fetcher = self.inner.ensure_fetcher(&task)?;
        Ok(fetcher.stats())
    }

    pub fn get_config(&self) -> StoreConfig {
        self.inner.store_config.read().clone()
    }

    /// Persist a new configuration. A larger budget admits queued tasks
    /// right away; a smaller one never preempts.
    pub fn put_config(&self, config: StoreConfig) -> Result<()> {
        let config = config.normalize();
        self.inner
            .storage
            .put_json(BUCKET_CONFIG, CONFIG_KEY, &config)?;
        *self.inner.store_config.write() = config;

        let admitted = {
            let mut queue = self.inner.queue.lock();
            self.inner.take_admissions(&mut queue)
        };
        self.inner.start_all(admitted);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Pause everything, close every protocol, then close storage. Every
    /// step runs even if an earlier one failed; the last error is returned.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut last_error = None;

        if let Err(e) = self.inner.pause(&TaskFilter::all()).await {
            error!("failed to pause tasks on close: {}", e);
            last_error = Some(e);
        }

        let pending: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, p) in pending {
            if let Err(e) = p.fetcher.close().await {
                debug!("failed to close unclaimed resolution: {:#}", e);
            }
        }

        for manager in &self.inner.managers {
            if let Err(e) = manager.close().await {
                error!("failed to close protocol {}: {:#}", manager.name(), e);
                last_error = Some(e.into());
            }
        }

        self.inner.shutdown.cancel();

        if let Err(e) = self.inner.storage.close() {
            error!("failed to close storage: {}", e);
            last_error = Some(e);
        }

        info!("downloader closed");
        last_error.map_or(Ok(()), Err)
    }

    /// Close if needed, forget every task and wipe storage.
    pub async fn clear(&self) -> Result<()> {
        if !self.is_closed() {
            self.close().await?;
        }
        {
            let mut queue = self.inner.queue.lock();
            for task in &queue.tasks {
                task.cancel.cancel();
            }
            queue.tasks.clear();
            queue.waiting.clear();
        }
        self.inner.watched.lock().clear();
        self.inner.storage.clear()
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn manager_for(&self, url: &str) -> Result<Arc<dyn FetcherManager>> {
        find_manager(&self.managers, url).ok_or_else(|| Error::UnsupportedProtocol(url.to_string()))
    }

    fn controller_for(&self, manager: &Arc<dyn FetcherManager>) -> Controller {
        let configured = self
            .store_config
            .read()
            .protocol_config
            .get(manager.name())
            .cloned();
        Controller::new(configured.or_else(|| manager.default_config()))
    }

    fn build_fetcher(&self, manager: &Arc<dyn FetcherManager>) -> Arc<dyn Fetcher> {
        let fetcher = manager.build();
        fetcher.setup(self.controller_for(manager));
        fetcher
    }

    fn max_running(&self) -> usize {
        self.store_config.read().max_running
    }

    fn remain(&self, queue: &Queue) -> usize {
        self.max_running().saturating_sub(queue.running())
    }

    fn find(&self, id: &str) -> Option<Arc<Task>> {
        self.queue.lock().tasks.iter().find(|t| t.id == id).cloned()
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    async fn resolve_with(&self, fetcher: &Arc<dyn Fetcher>, req: &Request) -> Result<Resource> {
        if let Some(hook) = &self.resolve_hook {
            match hook.on_resolve(req).await {
                Ok(Some(res)) if !res.files.is_empty() => {
                    let meta = fetcher.meta();
                    let mut meta = meta.write();
                    meta.req = req.clone();
                    meta.res = Some(res.clone());
                    return Ok(res);
                }
                Ok(_) => {}
                Err(e) => warn!("resolve hook failed for {}: {:#}", req.url, e),
            }
        }

        fetcher.resolve(req).await?;
        let res = fetcher.meta().read().res.clone();
        res.ok_or_else(|| anyhow::anyhow!("no resource resolved for {}", req.url).into())
    }

    fn create_task(
        self: &Arc<Self>,
        manager: Arc<dyn FetcherManager>,
        fetcher: Arc<dyn Fetcher>,
        mut opts: Options,
    ) -> Result<String> {
        if opts.path.as_os_str().is_empty() {
            opts.path = self.store_config.read().download_dir.clone();
        }
        fetcher.meta().write().opts = opts.clone();
        fetcher.create(&opts)?;

        let task = Arc::new(Task::new(Uuid::new_v4().to_string(), manager, fetcher.clone()));
        self.save_task(&task)?;
        self.watch(&task, fetcher);

        let start = {
            let mut queue = self.queue.lock();
            let remain = self.remain(&queue);
            queue.tasks.push(task.clone());
            let mut state = task.state.lock();
            if remain == 0 {
                state.set_status(Status::Wait);
                queue.waiting.push_back(task.clone());
                false
            } else {
                state.set_status(Status::Running);
                true
            }
        };
        info!("created task {} ({})", task.id, task.protocol);

        if start {
            self.spawn_start(task.clone());
        } else {
            self.persist(&task);
        }
        Ok(task.id.clone())
    }

    /// Rebuild the live fetcher of a task loaded from storage.
    fn ensure_fetcher(self: &Arc<Self>, task: &Arc<Task>) -> Result<Arc<dyn Fetcher>> {
        let fetcher = {
            let mut state = task.state.lock();
            if let Some(fetcher) = &state.fetcher {
                return Ok(fetcher.clone());
            }
            let manager = task
                .manager
                .clone()
                .ok_or_else(|| Error::UnsupportedProtocol(task.protocol.clone()))?;

            let meta = task.shared_meta();
            let saved = self.storage.get(BUCKET_SAVE, &task.id)?;
            let fetcher = match manager.restore(meta.clone(), saved) {
                Ok(fetcher) => fetcher,
                Err(e) => {
                    warn!("discarding saved state of task {}: {:#}", task.id, e);
                    manager.restore(meta, None)?
                }
            };
            fetcher.setup(self.controller_for(&manager));
            let opts = fetcher.meta().read().opts.clone();
            fetcher.create(&opts)?;
            task.bind_meta(&fetcher);

            state.fetcher = Some(fetcher.clone());
            state.fetcher_started = false;
            fetcher
        };
        debug!("restored fetcher for task {}", task.id);
        self.watch(task, fetcher.clone());
        Ok(fetcher)
    }

    fn spawn_start(self: &Arc<Self>, task: Arc<Task>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let _guard = task.handler_lock.lock().await;
            if task.is_deleted() || task.status() != Status::Running {
                return;
            }
            if let Err(e) = inner.start_locked(&task).await {
                error!("failed to start task {}: {}", task.id, e);
                inner.finish(&task, Err(e.to_string()));
            }
        });
    }

    async fn start_locked(self: &Arc<Self>, task: &Arc<Task>) -> Result<()> {
        let fetcher = self.ensure_fetcher(task)?;

        let mut resolved_now = false;
        if fetcher.meta().read().res.is_none() {
            let req = fetcher.meta().read().req.clone();
            self.resolve_with(&fetcher, &req).await?;
            resolved_now = true;
        }

        let (fresh, started) = {
            let mut state = task.state.lock();
            let fresh = std::mem::take(&mut state.fresh);
            (fresh, state.fetcher_started)
        };
        let auto_rename = task.manager.as_ref().is_some_and(|m| m.auto_rename());
        if (fresh || resolved_now) && auto_rename {
            self.rename_destination(&fetcher)?;
        }

        {
            let mut state = task.state.lock();
            if state.status != Status::Running {
                return Ok(());
            }
            state.progress.speed = 0;
            state.speed.reset();
            state.fetcher_started = true;
        }
        self.persist(task);
        self.emit(DownloadEvent::Start { task: task.info() });
        debug!("starting task {}", task.id);

        if started {
            fetcher.resume().await?;
        } else {
            fetcher.start().await?;
        }
        let mut state = task.state.lock();
        if state.status == Status::Running {
            state.timer.start();
        }
        Ok(())
    }

    fn rename_destination(&self, fetcher: &Arc<dyn Fetcher>) -> Result<()> {
        let _guard = self.rename_lock.lock();
        let meta = fetcher.meta();
        let Some(path) = meta.read().artifact_path() else {
            return Ok(());
        };
        let name = util::check_duplicate_and_rename(&path)?;
        let unchanged = path.file_name().is_some_and(|n| n.to_string_lossy() == name);
        if !unchanged {
            debug!("{:?} exists, saving as {}", path, name);
            meta.write().opts.name = name;
        }
        Ok(())
    }

    fn watch(self: &Arc<Self>, task: &Arc<Task>, fetcher: Arc<dyn Fetcher>) {
        let seq = self.watch_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = {
            let mut watched = self.watched.lock();
            if watched.get(&task.id).is_some_and(|w| !w.cancel.is_cancelled()) {
                return;
            }
            let cancel = task.cancel.child_token();
            watched.insert(
                task.id.clone(),
                Watch {
                    seq,
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        let inner = self.clone();
        let task = task.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = fetcher.wait() => Some(result),
                _ = cancel.cancelled() => None,
                _ = inner.shutdown.cancelled() => None,
            };
            {
                let mut watched = inner.watched.lock();
                if watched.get(&task.id).is_some_and(|w| w.seq == seq) {
                    watched.remove(&task.id);
                }
            }
            let Some(result) = result else {
                return;
            };

            let _guard = task.handler_lock.lock().await;
            let current = task.fetcher().is_some_and(|f| same_fetcher(&f, &fetcher));
            if !current || task.is_deleted() {
                return;
            }
            inner.finish(&task, result.map_err(|e| format!("{:#}", e)));
        });
    }

    fn unwatch(&self, id: &str) {
        if let Some(watch) = self.watched.lock().remove(id) {
            watch.cancel.cancel();
        }
    }

    /// Move a task to `Done` or `Error`. Runs with the task's handler lock
    /// held.
    fn finish(self: &Arc<Self>, task: &Arc<Task>, result: std::result::Result<(), String>) {
        let (released, admitted) = {
            let mut queue = self.queue.lock();
            if task.is_deleted() {
                return;
            }
            queue.remove_waiting(&task.id);

            let released = {
                let mut state = task.state.lock();
                match &result {
                    Ok(()) => {
                        state.set_status(Status::Done);
                        let downloaded = state
                            .fetcher
                            .as_ref()
                            .map(|f| f.progress().total())
                            .unwrap_or(state.progress.downloaded);
                        let size = {
                            let meta = task.shared_meta();
                            let mut meta = meta.write();
                            match meta.res.as_mut() {
                                Some(res) => {
                                    if res.size == 0 {
                                        res.size = downloaded;
                                    }
                                    res.size
                                }
                                None => downloaded,
                            }
                        };
                        let secs = state.timer.used().as_secs().max(1);
                        state.progress.speed = size / secs;
                        state.progress.downloaded = size;

                        let uploading = state
                            .fetcher
                            .as_ref()
                            .and_then(|f| f.as_uploader().map(|u| u.is_uploading()))
                            .unwrap_or(false);
                        state.uploading = uploading;
                        if uploading {
                            None
                        } else {
                            state.release_fetcher()
                        }
                    }
                    Err(_) => {
                        state.set_status(Status::Error);
                        state.progress.speed = 0;
                        state.release_fetcher()
                    }
                }
            };
            (released, self.take_admissions(&mut queue))
        };

        if let Some(fetcher) = released {
            self.unwatch(&task.id);
            if result.is_err() {
                self.store_blob(task, &fetcher);
            } else if let Err(e) = self.storage.delete(BUCKET_SAVE, &task.id) {
                warn!("failed to drop saved state of task {}: {}", task.id, e);
            }
            tokio::spawn(async move {
                if let Err(e) = fetcher.close().await {
                    debug!("failed to close fetcher: {:#}", e);
                }
            });
        }
        self.persist(task);

        let snapshot = task.info();
        match result {
            Ok(()) => {
                info!("task {} done", task.id);
                self.emit(DownloadEvent::Done {
                    task: snapshot.clone(),
                });
                self.emit(DownloadEvent::Finally {
                    task: snapshot,
                    error: None,
                });
            }
            Err(e) => {
                error!("task {} failed: {}", task.id, e);
                self.emit(DownloadEvent::Error {
                    task: snapshot.clone(),
                    error: e.clone(),
                });
                self.emit(DownloadEvent::Finally {
                    task: snapshot,
                    error: Some(e),
                });
            }
        }

        self.start_all(admitted);
    }

    /// Pop queued tasks into free slots, head first. Caller holds the queue
    /// lock and must hand the result to `start_all` after releasing it.
    fn take_admissions(&self, queue: &mut Queue) -> Vec<Arc<Task>> {
        let mut admitted = Vec::new();
        if self.closed.load(Ordering::SeqCst) {
            return admitted;
        }
        let mut remain = self.remain(queue);
        while remain > 0 {
            let Some(task) = queue.waiting.pop_front() else {
                break;
            };
            let mut state = task.state.lock();
            if state.status != Status::Wait {
                continue;
            }
            state.set_status(Status::Running);
            drop(state);
            admitted.push(task);
            remain -= 1;
        }
        admitted
    }

    fn start_all(self: &Arc<Self>, tasks: Vec<Arc<Task>>) {
        for task in tasks {
            self.spawn_start(task);
        }
    }

    async fn pause(self: &Arc<Self>, filter: &TaskFilter) -> Result<()> {
        let (paused, admitted) = {
            let mut queue = self.queue.lock();
            let matched = queue.select(filter);
            if matched.is_empty() && !filter.is_empty() {
                return Err(Error::TaskNotFound);
            }

            let mut paused = Vec::new();
            for task in matched {
                let mut state = task.state.lock();
                if matches!(state.status, Status::Ready | Status::Running | Status::Wait) {
                    state.set_status(Status::Pause);
                    state.progress.speed = 0;
                    drop(state);
                    queue.remove_waiting(&task.id);
                    paused.push(task);
                }
            }
            (paused, self.take_admissions(&mut queue))
        };
        self.start_all(admitted);

        let results = join_all(paused.iter().map(|t| self.run_pause(t))).await;
        last_error(results)
    }

    async fn run_pause(&self, task: &Arc<Task>) -> Result<()> {
        let _guard = task.handler_lock.lock().await;
        if task.is_deleted() {
            return Ok(());
        }
        let (status, fetcher) = {
            let state = task.state.lock();
            let fetcher = state.fetcher.clone().filter(|_| state.fetcher_started);
            (state.status, fetcher)
        };
        if !matches!(status, Status::Pause | Status::Wait) {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(fetcher) = &fetcher {
            if let Err(e) = fetcher.pause().await {
                warn!("failed to pause task {}: {:#}", task.id, e);
                result = Err(e.into());
            }
            self.store_blob(task, fetcher);
        }
        self.persist(task);
        debug!("paused task {} ({})", task.id, status);
        self.emit(DownloadEvent::Pause { task: task.info() });
        result
    }

    async fn resume(self: &Arc<Self>, filter: &TaskFilter) -> Result<()> {
        let (preempted, admitted, queued) = {
            let mut queue = self.queue.lock();
            let matched = queue.select(filter);
            if matched.is_empty() {
                return Err(Error::TaskNotFound);
            }
            let matched_ids: HashSet<&str> = matched.iter().map(|t| t.id.as_str()).collect();
            let requested: Vec<_> = matched
                .iter()
                .filter(|t| !matches!(t.status(), Status::Running | Status::Done))
                .cloned()
                .collect();
            if requested.is_empty() {
                return Ok(());
            }

            let wanted = self.max_running().min(requested.len());
            let slack = self.remain(&queue);
            let mut preempted = Vec::new();
            if wanted > slack {
                let mut need = wanted - slack;
                for task in queue.tasks.iter().rev() {
                    if need == 0 {
                        break;
                    }
                    if matched_ids.contains(task.id.as_str()) {
                        continue;
                    }
                    let mut state = task.state.lock();
                    if state.status == Status::Running {
                        state.set_status(Status::Wait);
                        state.progress.speed = 0;
                        preempted.push(task.clone());
                        need -= 1;
                    }
                }
                for task in &preempted {
                    queue.waiting.push_front(task.clone());
                }
            }
            let admit = wanted.min(slack + preempted.len());

            let mut admitted = Vec::new();
            let mut queued = Vec::new();
            for (i, task) in requested.into_iter().enumerate() {
                let mut state = task.state.lock();
                if i < admit {
                    state.set_status(Status::Running);
                    drop(state);
                    queue.remove_waiting(&task.id);
                    admitted.push(task);
                } else if state.status != Status::Wait {
                    state.set_status(Status::Wait);
                    drop(state);
                    queue.waiting.push_back(task.clone());
                    queued.push(task);
                }
            }
            (preempted, admitted, queued)
        };

        if !preempted.is_empty() {
            debug!("preempting {} running tasks", preempted.len());
        }
        self.start_all(admitted);
        for task in &queued {
            self.persist(task);
        }
        let results = join_all(preempted.iter().map(|t| self.run_pause(t))).await;
        last_error(results)
    }

    fn resume_all(self: &Arc<Self>) {
        let (admitted, queued) = {
            let mut queue = self.queue.lock();
            let mut admitted = self.take_admissions(&mut queue);
            let mut remain = self.remain(&queue);
            let mut queued = Vec::new();
            let tasks = queue.tasks.clone();
            for task in tasks {
                let mut state = task.state.lock();
                if !matches!(state.status, Status::Pause | Status::Error | Status::Ready) {
                    continue;
                }
                if remain > 0 {
                    state.set_status(Status::Running);
                    remain -= 1;
                    drop(state);
                    admitted.push(task);
                } else {
                    state.set_status(Status::Wait);
                    drop(state);
                    queue.waiting.push_back(task.clone());
                    queued.push(task);
                }
            }
            (admitted, queued)
        };

        self.start_all(admitted);
        for task in &queued {
            self.persist(task);
        }
    }

    async fn delete(self: &Arc<Self>, filter: &TaskFilter, force: bool) -> Result<()> {
        let (deleted, admitted) = {
            let mut queue = self.queue.lock();
            let deleted = queue.select(filter);
            if deleted.is_empty() {
                if filter.is_empty() {
                    return Ok(());
                }
                return Err(Error::TaskNotFound);
            }
            for task in &deleted {
                task.cancel.cancel();
            }
            queue.tasks.retain(|t| !t.is_deleted());
            queue.waiting.retain(|t| !t.is_deleted());
            (deleted, self.take_admissions(&mut queue))
        };
        self.start_all(admitted);

        let results = join_all(deleted.iter().map(|t| self.run_delete(t, force))).await;
        last_error(results)
    }

    async fn run_delete(&self, task: &Arc<Task>, force: bool) -> Result<()> {
        let _guard = task.handler_lock.lock().await;
        self.unwatch(&task.id);
        let mut last = None;

        let fetcher = task.state.lock().release_fetcher();
        if let Some(fetcher) = fetcher {
            if let Err(e) = fetcher.close().await {
                warn!("failed to close fetcher of task {}: {:#}", task.id, e);
                last = Some(e.into());
            }
        }
        for bucket in [BUCKET_TASK, BUCKET_SAVE] {
            if let Err(e) = self.storage.delete(bucket, &task.id) {
                warn!("failed to delete task {} from {}: {}", task.id, bucket, e);
                last = Some(e);
            }
        }
        if force {
            let meta = task.shared_meta().read().clone();
            if let Err(e) = remove_artifacts(&meta) {
                warn!("failed to remove files of task {}: {}", task.id, e);
                last = Some(e.into());
            }
        }

        info!("deleted task {}", task.id);
        self.emit(DownloadEvent::Delete { task: task.info() });
        last.map_or(Ok(()), Err)
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        self.storage.put_json(BUCKET_TASK, &task.id, &task.info())
    }

    fn persist(&self, task: &Task) -> bool {
        if task.is_deleted() {
            return false;
        }
        match self.save_task(task) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to persist task {}: {}", task.id, e);
                false
            }
        }
    }

    fn store_blob(&self, task: &Task, fetcher: &Arc<dyn Fetcher>) {
        if task.is_deleted() {
            return;
        }
        match fetcher.store() {
            Ok(Some(data)) => {
                if let Err(e) = self.storage.put(BUCKET_SAVE, &task.id, data) {
                    warn!("failed to save state of task {}: {}", task.id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("failed to serialize state of task {}: {:#}", task.id, e),
        }
    }

    fn sample(&self, tick: Duration) {
        let tasks = self.queue.lock().tasks.clone();
        for task in tasks {
            let (fetcher, dirty, upload_ended) = {
                let mut state = task.state.lock();
                if state.status != Status::Running && !state.uploading {
                    continue;
                }
                let Some(fetcher) = state.fetcher.clone() else {
                    continue;
                };

                if state.status == Status::Running {
                    let downloaded = fetcher.progress().total();
                    let delta = downloaded.saturating_sub(state.progress.downloaded);
                    if delta > 0 {
                        state.progress.downloaded = downloaded;
                        state.dirty = true;
                    }
                    state.progress.speed = state.speed.push(delta, tick);
                }

                let mut upload_ended = false;
                if let Some(uploader) = fetcher.as_uploader() {
                    let uploaded = uploader.uploaded_bytes();
                    let delta = uploaded.saturating_sub(state.progress.uploaded);
                    if delta > 0 {
                        state.progress.uploaded = uploaded;
                        state.dirty = true;
                    }
                    state.progress.upload_speed = state.upload_speed.push(delta, tick);
                    upload_ended = state.uploading && !uploader.is_uploading();
                }
                (fetcher, state.dirty, upload_ended)
            };

            self.emit(DownloadEvent::Progress { task: task.info() });

            if !dirty && !upload_ended {
                continue;
            }
            // A busy handler owns the task for now; the flags survive until
            // a later tick gets the lock.
            let Ok(_guard) = task.handler_lock.try_lock() else {
                continue;
            };
            if task.is_deleted() {
                continue;
            }
            let finished_upload = upload_ended && {
                let mut state = task.state.lock();
                state.uploading = false;
                state.progress.upload_speed = 0;
                state.status == Status::Done
            };
            if self.persist(&task) {
                task.state.lock().dirty = false;
            }
            if finished_upload {
                let released = task.state.lock().release_fetcher();
                if let Some(fetcher) = released {
                    self.unwatch(&task.id);
                    tokio::spawn(async move {
                        let _ = fetcher.close().await;
                    });
                }
            } else {
                self.store_blob(&task, &fetcher);
            }
        }
    }
}

async fn sample_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.sample(period);
    }
    debug!("progress sampler stopped");
}

fn find_manager(
    managers: &[Arc<dyn FetcherManager>],
    url: &str,
) -> Option<Arc<dyn FetcherManager>> {
    managers.iter().find(|m| m.accepts(url)).cloned()
}

fn remove_artifacts(meta: &FetcherMeta) -> io::Result<()> {
    let Some(res) = &meta.res else {
        return Ok(());
    };
    if !res.name.is_empty() {
        if let Some(folder) = meta.folder_path() {
            match std::fs::remove_dir_all(folder) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    } else if let Some(file) = meta.single_filepath() {
        util::safe_remove(&file)?;
    }
    Ok(())
}

fn last_error(results: Vec<Result<()>>) -> Result<()> {
    results
        .into_iter()
        .filter_map(|r| r.err())
        .last()
        .map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{Controller, FetchProgress, FileInfo, Options, Request, Resource, SharedMeta, UrlFilter};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    const RESOLVE_DELAY: Duration = Duration::from_millis(300);

    struct CountingFetcher {
        meta: SharedMeta,
        downloaded: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        fn setup(&self, _controller: Controller) {}

        async fn resolve(&self, _req: &Request) -> anyhow::Result<()> {
            tokio::time::sleep(RESOLVE_DELAY).await;
            self.meta.write().res = Some(Resource {
                size: 1000,
                range: true,
                files: vec![FileInfo {
                    name: "count.bin".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            });
            Ok(())
        }

        fn create(&self, opts: &Options) -> anyhow::Result<()> {
            self.meta.write().opts = opts.clone();
            Ok(())
        }

        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn pause(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn wait(&self) -> anyhow::Result<()> {
            std::future::pending().await
        }

        fn meta(&self) -> SharedMeta {
            self.meta.clone()
        }

        fn progress(&self) -> FetchProgress {
            FetchProgress::single(self.downloaded.load(Ordering::SeqCst))
        }
    }

    struct CountingManager {
        downloaded: Arc<AtomicU64>,
    }

    impl CountingManager {
        fn fetcher(&self, meta: SharedMeta) -> Arc<dyn Fetcher> {
            Arc::new(CountingFetcher {
                meta,
                downloaded: self.downloaded.clone(),
            })
        }
    }

    #[async_trait]
    impl FetcherManager for CountingManager {
        fn name(&self) -> &str {
            "count"
        }

        fn filters(&self) -> Vec<UrlFilter> {
            vec![UrlFilter::url("count")]
        }

        fn build(&self) -> Arc<dyn Fetcher> {
            self.fetcher(crate::fetcher::shared_meta(Default::default()))
        }

        fn restore(&self, meta: SharedMeta, _data: Option<Value>) -> anyhow::Result<Arc<dyn Fetcher>> {
            Ok(self.fetcher(meta))
        }
    }

    async fn started_task() -> (Downloader, Arc<dyn Storage>, Arc<AtomicU64>, String) {
        let downloaded = Arc::new(AtomicU64::new(0));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let managers: Vec<Arc<dyn FetcherManager>> = vec![Arc::new(CountingManager {
            downloaded: downloaded.clone(),
        })];
        let config = DownloaderConfig::new()
            .with_managers(managers)
            .with_storage(storage.clone())
            .with_refresh_interval(Duration::from_secs(3600));
        let (downloader, mut events) = Downloader::new(config).unwrap();

        let id = downloader
            .create_direct(Request::new("count://file"), Options::default())
            .await
            .unwrap();
        loop {
            match events.recv().await {
                Some(DownloadEvent::Start { task }) if task.id == id => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
        (downloader, storage, downloaded, id)
    }

    fn stored_downloaded(storage: &Arc<dyn Storage>, id: &str) -> u64 {
        let record = storage.get(BUCKET_TASK, id).unwrap().unwrap();
        record["progress"]["downloaded"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_sampled_progress_survives_busy_handler() {
        let (downloader, storage, downloaded, id) = started_task().await;
        let task = downloader.inner.find(&id).unwrap();
        let tick = Duration::from_millis(100);

        downloaded.store(400, Ordering::SeqCst);
        {
            let _busy = task.handler_lock.lock().await;
            downloader.inner.sample(tick);
        }
        assert_eq!(task.info().progress.downloaded, 400);
        assert_eq!(stored_downloaded(&storage, &id), 0);

        // No new bytes, but the earlier sample still has to reach storage.
        downloader.inner.sample(tick);
        assert_eq!(stored_downloaded(&storage, &id), 400);
        assert!(!task.state.lock().dirty);
    }

    #[tokio::test]
    async fn test_resolution_is_not_active_time() {
        let (downloader, _storage, _downloaded, id) = started_task().await;
        let task = downloader.inner.find(&id).unwrap();

        let _started = task.handler_lock.lock().await;
        let state = task.state.lock();
        assert_eq!(state.status, Status::Running);
        assert!(state.timer.is_running());
        assert!(
            state.timer.used() < RESOLVE_DELAY,
            "timer counted {:?}",
            state.timer.used()
        );
    }
}
