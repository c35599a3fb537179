use super::{Events, short_id};
use anyhow::Result;
use console::{Term, style};
use ferry::download::event::{format_bytes, format_speed};
use ferry::{DownloadEvent, Downloader, TaskInfo};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Summary {
    pub done: usize,
    pub failed: usize,
    pub interrupted: bool,
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{prefix:.dim} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}")?
        .progress_chars("#>-"))
}

fn describe(task: &TaskInfo) -> String {
    if task.progress.speed > 0 {
        format!("{} ({})", task.name, format_speed(task.progress.speed))
    } else {
        task.name.clone()
    }
}

/// Render a bar per task until every one of them is done, failed or gone.
/// Ctrl-C stops following; the caller closes the downloader, which pauses
/// and persists whatever is still running.
pub async fn follow(downloader: &Downloader, events: &mut Events, ids: &[String]) -> Result<Summary> {
    let multi = MultiProgress::new();
    let bar_template = bar_style()?;
    let mut summary = Summary::default();
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    for id in ids {
        let Some(task) = downloader.get_task(id) else {
            continue;
        };
        match task.status {
            ferry::Status::Done => summary.done += 1,
            _ => {
                let bar = multi.add(ProgressBar::new(task.size));
                bar.set_style(bar_template.clone());
                bar.set_prefix(short_id(&task.id).to_string());
                bar.set_position(task.progress.downloaded);
                bar.set_message(describe(&task));
                bars.insert(task.id.clone(), bar);
            }
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !bars.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(bar) = bars.get(event.task_id()).cloned() else {
                    continue;
                };
                match &event {
                    DownloadEvent::Start { task } | DownloadEvent::Progress { task } => {
                        if task.size > 0 {
                            bar.set_length(task.size);
                        }
                        bar.set_position(task.progress.downloaded);
                        bar.set_message(describe(task));
                    }
                    DownloadEvent::Done { task } => {
                        bar.set_length(task.size.max(task.progress.downloaded));
                        bar.set_position(task.progress.downloaded);
                        bar.finish_with_message(format!("{} {}", style("✅").green(), task.name));
                        bars.remove(&task.id);
                        summary.done += 1;
                    }
                    DownloadEvent::Error { task, error } => {
                        bar.abandon_with_message(format!(
                            "{} {}: {}",
                            style("❌").red(),
                            task.name,
                            error
                        ));
                        bars.remove(&task.id);
                        summary.failed += 1;
                    }
                    DownloadEvent::Delete { task } => {
                        bar.abandon_with_message(format!("{} removed", style("🗑️").dim()));
                        bars.remove(&task.id);
                    }
                    _ => {}
                }
            }
            _ = &mut ctrl_c => {
                summary.interrupted = true;
                for bar in bars.values() {
                    bar.abandon_with_message(format!("{} interrupted", style("⏸").yellow()));
                }
                break;
            }
        }
    }

    Ok(summary)
}

pub fn report(term: &Term, summary: &Summary) -> Result<()> {
    term.write_line("")?;
    if summary.done > 0 {
        term.write_line(&format!(
            "{} {} download(s) completed",
            style("✅").green(),
            summary.done
        ))?;
    }
    if summary.interrupted {
        term.write_line(&format!(
            "{} Interrupted; progress is saved. Run 'ferry resume --all' to continue",
            style("💡").yellow()
        ))?;
    }
    if summary.failed > 0 {
        anyhow::bail!("{} download(s) failed", summary.failed);
    }
    Ok(())
}

/// One-line size summary such as `1.5 MB / 3.0 MB`.
pub fn size_line(task: &TaskInfo) -> String {
    if task.size == 0 {
        format_bytes(task.progress.downloaded)
    } else {
        format!(
            "{} / {}",
            format_bytes(task.progress.downloaded),
            format_bytes(task.size)
        )
    }
}
