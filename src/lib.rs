pub mod config;
pub mod download;
pub mod error;
pub mod fetcher;
pub mod storage;
pub mod util;

// Re-export commonly used types for easier access in tests
pub use config::ConfigManager;
pub use download::{
    Command, DownloadEvent, Downloader, DownloaderConfig, Reply, ResolveResult, Status,
    StoreConfig, TaskFilter, TaskInfo, dispatch,
};
pub use error::{Error, Result};
pub use fetcher::{Fetcher, FetcherManager, FetcherMeta, Options, Request, Resource};
pub use storage::{FileStorage, MemoryStorage, Storage};
