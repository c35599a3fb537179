use super::progress::{follow, report};
use super::{open_downloader, short_id, task_filter};
use anyhow::Result;
use console::{Term, style};
use dialoguer::Confirm;
use ferry::{Command, ConfigManager, Status, TaskFilter, dispatch};

pub async fn handle_pause(config_manager: &ConfigManager, ids: Vec<String>, all: bool) -> Result<()> {
    let term = Term::stdout();
    let (downloader, _events) = open_downloader(config_manager)?;

    let result = match task_filter(&downloader, &ids, all) {
        Ok(filter) => dispatch(&downloader, Command::Pause(filter))
            .await
            .map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    downloader.close().await?;
    result?;

    term.write_line(&format!("{} Paused", style("⏸").yellow()))?;
    Ok(())
}

pub async fn handle_resume(config_manager: &ConfigManager, ids: Vec<String>, all: bool) -> Result<()> {
    let term = Term::stdout();
    let (downloader, mut events) = open_downloader(config_manager)?;

    let filter = match task_filter(&downloader, &ids, all) {
        Ok(filter) => filter,
        Err(e) => {
            downloader.close().await?;
            return Err(e);
        }
    };
    if let Err(e) = dispatch(&downloader, Command::Continue(filter.clone())).await {
        downloader.close().await?;
        return Err(e.into());
    }

    let followed: Vec<String> = downloader
        .get_tasks_by_filter(&filter)
        .into_iter()
        .filter(|task| matches!(task.status, Status::Running | Status::Wait))
        .map(|task| task.id)
        .collect();

    if followed.is_empty() {
        term.write_line(&format!("{} Nothing to resume", style("📭").dim()))?;
        downloader.close().await?;
        return Ok(());
    }

    term.write_line(&format!(
        "{} Resuming {} task(s)",
        style("▶️").green(),
        followed.len()
    ))?;
    let summary = follow(&downloader, &mut events, &followed).await?;
    downloader.close().await?;
    report(&term, &summary)
}

pub async fn handle_remove(
    config_manager: &ConfigManager,
    ids: Vec<String>,
    all: bool,
    force: bool,
    skip_confirmation: bool,
) -> Result<()> {
    let term = Term::stdout();
    let (downloader, _events) = open_downloader(config_manager)?;

    let filter = match task_filter(&downloader, &ids, all) {
        Ok(filter) => filter,
        Err(e) => {
            downloader.close().await?;
            return Err(e);
        }
    };
    let targets = downloader.get_tasks_by_filter(&filter);
    if targets.is_empty() {
        term.write_line(&format!("{} No tasks to remove", style("📭").dim()))?;
        downloader.close().await?;
        return Ok(());
    }

    term.write_line(&format!("{} Tasks to remove:", style("🎯").cyan()))?;
    for task in &targets {
        term.write_line(&format!(
            "   • {} {}",
            style(short_id(&task.id)).dim(),
            style(&task.name).cyan()
        ))?;
    }
    if force {
        term.write_line(&format!(
            "{} Downloaded files will be deleted too",
            style("⚠️").yellow()
        ))?;
    }

    if !skip_confirmation {
        let confirmed = Confirm::new()
            .with_prompt(format!("Remove {} task(s)?", targets.len()))
            .default(false)
            .interact()?;

        if !confirmed {
            term.write_line(&format!("{} Operation cancelled", style("❌").red()))?;
            downloader.close().await?;
            return Ok(());
        }
    }

    let ids: Vec<String> = targets.into_iter().map(|task| task.id).collect();
    let count = ids.len();
    let result = dispatch(
        &downloader,
        Command::Delete {
            filter: TaskFilter::ids(ids),
            force,
        },
    )
    .await;
    downloader.close().await?;
    result?;

    term.write_line(&format!(
        "{} Removed {} task(s)",
        style("🗑️").green(),
        count
    ))?;
    Ok(())
}
