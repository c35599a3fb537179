use std::time::Duration;

use super::task::TaskInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Start,
    Pause,
    Progress,
    Error,
    Done,
    Delete,
    Finally,
}

/// Lifecycle notifications. Each carries a snapshot of the task taken when
/// the transition happened.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Start { task: TaskInfo },
    Pause { task: TaskInfo },
    Progress { task: TaskInfo },
    Error { task: TaskInfo, error: String },
    Done { task: TaskInfo },
    Delete { task: TaskInfo },
    /// Follows `Done` or `Error`.
    Finally { task: TaskInfo, error: Option<String> },
}

impl DownloadEvent {
    pub fn key(&self) -> EventKey {
        match self {
            DownloadEvent::Start { .. } => EventKey::Start,
            DownloadEvent::Pause { .. } => EventKey::Pause,
            DownloadEvent::Progress { .. } => EventKey::Progress,
            DownloadEvent::Error { .. } => EventKey::Error,
            DownloadEvent::Done { .. } => EventKey::Done,
            DownloadEvent::Delete { .. } => EventKey::Delete,
            DownloadEvent::Finally { .. } => EventKey::Finally,
        }
    }

    pub fn task(&self) -> &TaskInfo {
        match self {
            DownloadEvent::Start { task }
            | DownloadEvent::Pause { task }
            | DownloadEvent::Progress { task }
            | DownloadEvent::Error { task, .. }
            | DownloadEvent::Done { task }
            | DownloadEvent::Delete { task }
            | DownloadEvent::Finally { task, .. } => task,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task().id
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Remaining time at the current speed, if it can be estimated.
pub fn estimate_eta(task: &TaskInfo) -> Option<Duration> {
    let speed = task.progress.speed;
    let downloaded = task.progress.downloaded;
    if speed == 0 || task.size == 0 || downloaded >= task.size {
        return None;
    }
    Some(Duration::from_secs((task.size - downloaded) / speed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
        assert_eq!(format_speed(2048), "2.0 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
