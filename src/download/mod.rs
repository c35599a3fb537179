pub mod command;
pub mod config;
pub mod downloader;
pub mod event;
pub mod task;

pub use command::{Command, Reply, dispatch};
pub use config::{DownloaderConfig, StoreConfig};
pub use downloader::{Downloader, ResolveResult};
pub use event::{DownloadEvent, EventKey};
pub use task::{Progress, Status, TaskFilter, TaskInfo, Timer};
