use anyhow::{Context, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::download::{DownloaderConfig, StoreConfig};
use crate::storage::{FileStorage, MemoryStorage, Storage};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-protocol tables, e.g. `[protocols.http]`.
    #[serde(default)]
    pub protocols: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default = "default_max_running")]
    pub max_running: usize,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

fn default_download_dir() -> String {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|d| d.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "downloads".to_string())
}

fn default_max_running() -> usize {
    5
}

fn default_refresh_interval_ms() -> u64 {
    350
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_running: default_max_running(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

pub struct ConfigManager {
    config_dir: PathBuf,
    config_file: PathBuf,
    data_dir: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Load the config from the platform config directory, creating a
    /// default one on first use.
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("", "", "ferry").context("Failed to determine config directory")?;

        let config_dir = project_dirs.config_dir().to_path_buf();
        let config_file = config_dir.join("config.toml");
        let data_dir = project_dirs.data_dir().to_path_buf();
        Self::open(config_dir, config_file, data_dir)
    }

    /// Use an explicit config file; storage defaults to a `data` folder
    /// next to it.
    pub fn with_file(config_file: impl Into<PathBuf>) -> Result<Self> {
        let config_file = config_file.into();
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let data_dir = config_dir.join("data");
        Self::open(config_dir, config_file, data_dir)
    }

    fn open(config_dir: PathBuf, config_file: PathBuf, data_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_dir,
            config_file,
            data_dir,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    /// Restore defaults and write them to disk.
    pub fn reset(&mut self) -> Result<()> {
        self.config = Config::default();
        self.save()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn storage_dir(&self) -> PathBuf {
        match &self.config.storage.dir {
            Some(dir) => PathBuf::from(dir),
            None => self.data_dir.clone(),
        }
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))?;

        Ok(config)
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let general = &self.config.general;
        if general.max_running == 0 {
            anyhow::bail!("max_running must be greater than 0");
        }

        if general.refresh_interval_ms == 0 {
            anyhow::bail!("refresh_interval_ms must be greater than 0");
        }

        if general.download_dir.trim().is_empty() {
            anyhow::bail!("download_dir cannot be empty");
        }

        for (name, table) in &self.config.protocols {
            if !table.is_table() {
                anyhow::bail!("protocols.{} must be a table", name);
            }
        }

        Ok(())
    }

    /// Protocol tables converted to the JSON shape fetchers read.
    pub fn protocol_config(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        self.config
            .protocols
            .iter()
            .map(|(name, table)| {
                let value = serde_json::to_value(table)
                    .with_context(|| format!("Invalid settings for protocol '{}'", name))?;
                Ok((name.clone(), value))
            })
            .collect()
    }

    /// Overlay the file settings onto the configuration a downloader keeps
    /// in storage.
    pub fn apply(&self, store: &mut StoreConfig) -> Result<()> {
        store.download_dir = PathBuf::from(&self.config.general.download_dir);
        store.max_running = self.config.general.max_running;
        store.protocol_config.extend(self.protocol_config()?);
        Ok(())
    }

    /// Everything needed to open a downloader with these settings.
    pub fn downloader_config(&self) -> Result<DownloaderConfig> {
        let storage: Arc<dyn Storage> = match self.config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::File => {
                let dir = self.storage_dir();
                Arc::new(
                    FileStorage::open(&dir)
                        .with_context(|| format!("Failed to open storage in {:?}", dir))?,
                )
            }
        };

        let mut store = StoreConfig::default();
        self.apply(&mut store)?;

        Ok(DownloaderConfig::default()
            .with_storage(storage)
            .with_refresh_interval(Duration::from_millis(
                self.config.general.refresh_interval_ms,
            ))
            .with_store_config(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config.toml");
        let manager = ConfigManager::with_file(&file).unwrap();

        assert!(file.exists());
        assert_eq!(manager.config().general.max_running, 5);
        assert_eq!(manager.storage_dir(), dir.path().join("data"));
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_parses_protocol_tables() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("config.toml");
        fs::write(
            &file,
            r#"
[general]
download_dir = "/srv/downloads"
max_running = 2

[storage]
backend = "memory"

[protocols.http]
maxRetries = 7
"#,
        )
        .unwrap();

        let manager = ConfigManager::with_file(&file).unwrap();
        assert_eq!(manager.config().storage.backend, StorageBackend::Memory);
        assert_eq!(manager.config().general.refresh_interval_ms, 350);

        let mut store = StoreConfig::default();
        manager.apply(&mut store).unwrap();
        assert_eq!(store.max_running, 2);
        assert_eq!(store.download_dir, PathBuf::from("/srv/downloads"));
        assert_eq!(store.protocol_config["http"]["maxRetries"], 7);
    }

    #[test]
    fn test_validation_rejects_zero_budget() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::with_file(dir.path().join("config.toml")).unwrap();
        manager.config_mut().general.max_running = 0;
        assert!(manager.validate().is_err());

        manager.reset().unwrap();
        assert!(manager.validate().is_ok());
    }
}
