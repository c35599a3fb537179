use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// What the user asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    /// Protocol-specific request data (headers, tracker list, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// What a resolution found behind a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Root folder name for multi-file resources, empty for a single file.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Whether the source supports ranged (resumable) reads.
    #[serde(default)]
    pub range: bool,
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    /// Directory relative to the resource root.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

/// Where and how to store a download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Custom file (or folder) name, overriding the resolved one.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: PathBuf,
    /// Indexes into `Resource::files`; empty selects everything.
    #[serde(default)]
    pub select_files: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetcherMeta {
    pub req: Request,
    #[serde(default)]
    pub res: Option<Resource>,
    #[serde(default)]
    pub opts: Options,
}

/// Metadata shared between a task and its live fetcher.
pub type SharedMeta = Arc<RwLock<FetcherMeta>>;

pub fn shared_meta(meta: FetcherMeta) -> SharedMeta {
    Arc::new(RwLock::new(meta))
}

impl FetcherMeta {
    /// Folder of a multi-file resource, honouring a custom name.
    pub fn folder_path(&self) -> Option<PathBuf> {
        let res = self.res.as_ref()?;
        let folder = if self.opts.name.is_empty() {
            &res.name
        } else {
            &self.opts.name
        };
        Some(self.opts.path.join(folder))
    }

    /// Path of the first file of a single-file resource.
    pub fn single_filepath(&self) -> Option<PathBuf> {
        let file = self.res.as_ref()?.files.first()?;
        let name = if self.opts.name.is_empty() {
            &file.name
        } else {
            &self.opts.name
        };
        Some(self.opts.path.join(&file.path).join(name))
    }

    /// The path that holds everything this download wrote.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        let res = self.res.as_ref()?;
        if res.name.is_empty() {
            self.single_filepath()
        } else {
            self.folder_path()
        }
    }
}

/// Cumulative downloaded bytes, one entry per file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchProgress(pub Vec<u64>);

impl FetchProgress {
    pub fn single(downloaded: u64) -> Self {
        Self(vec![downloaded])
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(res_name: &str, opts_name: &str) -> FetcherMeta {
        FetcherMeta {
            req: Request::new("http://example.com/a.bin"),
            res: Some(Resource {
                name: res_name.to_string(),
                size: 10,
                range: true,
                files: vec![FileInfo {
                    name: "a.bin".to_string(),
                    path: "sub".to_string(),
                    size: 10,
                }],
            }),
            opts: Options::new("/downloads").with_name(opts_name),
        }
    }

    #[test]
    fn test_single_filepath_uses_custom_name() {
        assert_eq!(
            meta("", "").single_filepath(),
            Some(PathBuf::from("/downloads/sub/a.bin"))
        );
        assert_eq!(
            meta("", "b.bin").single_filepath(),
            Some(PathBuf::from("/downloads/sub/b.bin"))
        );
    }

    #[test]
    fn test_artifact_path_prefers_folder() {
        assert_eq!(
            meta("pack", "").artifact_path(),
            Some(PathBuf::from("/downloads/pack"))
        );
        assert_eq!(
            meta("pack", "renamed").artifact_path(),
            Some(PathBuf::from("/downloads/renamed"))
        );
    }

    #[test]
    fn test_unresolved_meta_has_no_paths() {
        let meta = FetcherMeta::default();
        assert!(meta.artifact_path().is_none());
        assert!(meta.single_filepath().is_none());
    }

    #[test]
    fn test_progress_total() {
        assert_eq!(FetchProgress(vec![1, 2, 3]).total(), 6);
        assert_eq!(FetchProgress::default().total(), 0);
    }
}
