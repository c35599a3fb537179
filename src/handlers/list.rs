use super::progress::size_line;
use super::{open_downloader, short_id};
use anyhow::Result;
use console::{Term, style};
use ferry::download::event::{estimate_eta, format_duration, format_speed};
use ferry::{Command, ConfigManager, Reply, Status, TaskFilter, dispatch};

fn styled_status(status: Status) -> String {
    let label = format!("{:<7}", status.as_str());
    match status {
        Status::Running => style(label).green().to_string(),
        Status::Wait | Status::Ready => style(label).blue().to_string(),
        Status::Pause => style(label).yellow().to_string(),
        Status::Error => style(label).red().to_string(),
        Status::Done => style(label).dim().to_string(),
    }
}

pub async fn handle_list(
    config_manager: &ConfigManager,
    status: Option<Status>,
    detailed: bool,
) -> Result<()> {
    let term = Term::stdout();
    let (downloader, _events) = open_downloader(config_manager)?;

    let filter = match status {
        Some(status) => TaskFilter::statuses([status]),
        None => TaskFilter::all(),
    };
    let tasks = match dispatch(&downloader, Command::GetTasks(filter)).await? {
        Reply::Tasks(tasks) => tasks,
        _ => Vec::new(),
    };

    if tasks.is_empty() {
        term.write_line(&format!("{} No tasks found", style("📭").dim()))?;
        downloader.close().await?;
        return Ok(());
    }

    term.write_line(&format!("{} Tasks:", style("📋").cyan()))?;
    for task in &tasks {
        term.write_line(&format!(
            "  {} {} {:>5.1}%  {:<22} {}",
            style(short_id(&task.id)).dim(),
            styled_status(task.status),
            task.percent(),
            size_line(task),
            style(&task.name).cyan()
        ))?;

        if detailed {
            if let Some(path) = task.meta.as_ref().and_then(|meta| meta.artifact_path()) {
                term.write_line(&format!("      {}: {}", style("Path").dim(), path.display()))?;
            }
            if let Some(meta) = &task.meta {
                term.write_line(&format!("      {}: {}", style("URL").dim(), meta.req.url))?;
            }
            if task.status == Status::Running {
                term.write_line(&format!(
                    "      {}: {}",
                    style("Speed").dim(),
                    format_speed(task.progress.speed)
                ))?;
                if let Some(eta) = estimate_eta(task) {
                    term.write_line(&format!(
                        "      {}: {}",
                        style("ETA").dim(),
                        format_duration(eta)
                    ))?;
                }
            }
            term.write_line(&format!(
                "      {}: {}  {}: {}",
                style("Created").dim(),
                task.created_at.format("%Y-%m-%d %H:%M:%S"),
                style("Updated").dim(),
                task.updated_at.format("%Y-%m-%d %H:%M:%S")
            ))?;
        }
    }

    term.write_line(&format!("\n{} {} task(s)", style("📊").cyan(), tasks.len()))?;
    downloader.close().await?;
    Ok(())
}
