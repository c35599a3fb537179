use super::progress::{follow, report};
use super::{open_downloader, short_id};
use anyhow::Result;
use console::{Term, style};
use ferry::{ConfigManager, Options, Request};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

pub async fn handle_add(
    config_manager: &ConfigManager,
    urls: Vec<String>,
    output: Option<String>,
    name: Option<String>,
    detach: bool,
) -> Result<()> {
    let term = Term::stdout();
    let (downloader, mut events) = open_downloader(config_manager)?;

    let download_dir = output
        .map(PathBuf::from)
        .unwrap_or_else(|| downloader.get_config().download_dir);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut ids = Vec::new();
    for url in &urls {
        spinner.set_message(format!("Resolving {}...", url));

        let resolved = match downloader.resolve(Request::new(url.as_str())).await {
            Ok(resolved) => resolved,
            Err(e) => {
                spinner.suspend(|| {
                    term.write_line(&format!(
                        "{} Failed to resolve {}: {}",
                        style("❌").red(),
                        style(url).cyan(),
                        e
                    ))
                })?;
                continue;
            }
        };

        let mut opts = Options::new(download_dir.clone());
        if let Some(name) = &name {
            opts = opts.with_name(name.as_str());
        }

        let id = downloader.create(&resolved.id, opts).await?;
        let display = downloader
            .get_task(&id)
            .map(|task| task.name)
            .unwrap_or_else(|| url.clone());
        spinner.suspend(|| {
            term.write_line(&format!(
                "{} Queued {} as {}",
                style("➕").green(),
                style(display).cyan(),
                style(short_id(&id)).dim()
            ))
        })?;
        ids.push(id);
    }
    spinner.finish_and_clear();

    if ids.is_empty() {
        downloader.close().await?;
        anyhow::bail!("No downloads were queued");
    }

    term.write_line(&format!(
        "{} Saving to {}",
        style("📁").cyan(),
        style(download_dir.display()).cyan()
    ))?;

    if detach {
        downloader.close().await?;
        term.write_line(&format!(
            "{} Run 'ferry resume --all' to start the queued downloads",
            style("💡").yellow()
        ))?;
        return Ok(());
    }

    let summary = follow(&downloader, &mut events, &ids).await?;
    downloader.close().await?;
    report(&term, &summary)
}
