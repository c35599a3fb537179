pub mod add;
pub mod config;
pub mod list;
pub mod manage;
pub mod progress;

use crate::cli::Commands;
use anyhow::{Context, Result};
use ferry::{ConfigManager, DownloadEvent, Downloader, TaskFilter};
use tokio::sync::mpsc::UnboundedReceiver;

// Re-export all handlers
pub use add::handle_add;
pub use config::handle_config;
pub use list::handle_list;
pub use manage::{handle_pause, handle_remove, handle_resume};

pub type Events = UnboundedReceiver<DownloadEvent>;

/// Check if config validation should be skipped for certain commands
pub fn should_skip_config_validation(command: &Commands) -> bool {
    matches!(command, Commands::Config { .. })
}

/// Open a downloader on the configured storage. Settings from the config
/// file override whatever the previous run left in storage.
pub fn open_downloader(config_manager: &ConfigManager) -> Result<(Downloader, Events)> {
    let config = config_manager.downloader_config()?;
    let (downloader, events) = Downloader::new(config).context("Failed to open downloader")?;

    let mut store = downloader.get_config();
    config_manager.apply(&mut store)?;
    downloader
        .put_config(store)
        .context("Failed to store configuration")?;

    Ok((downloader, events))
}

/// Expand id prefixes (as printed by `ferry list`) to full task ids.
pub fn resolve_ids(downloader: &Downloader, prefixes: &[String]) -> Result<Vec<String>> {
    let tasks = downloader.get_tasks();
    prefixes
        .iter()
        .map(|prefix| -> Result<String> {
            let matches: Vec<_> = tasks
                .iter()
                .filter(|task| task.id.starts_with(prefix.as_str()))
                .collect();
            match matches.as_slice() {
                [task] => Ok(task.id.clone()),
                [] => anyhow::bail!("No task matches '{}'", prefix),
                _ => anyhow::bail!(
                    "'{}' matches {} tasks, use a longer id",
                    prefix,
                    matches.len()
                ),
            }
        })
        .collect()
}

pub fn task_filter(downloader: &Downloader, ids: &[String], all: bool) -> Result<TaskFilter> {
    if all {
        return Ok(TaskFilter::all());
    }
    Ok(TaskFilter::ids(resolve_ids(downloader, ids)?))
}

pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
