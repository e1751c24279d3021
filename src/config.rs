use anyhow::{anyhow, Context, Result};
use jsonc_parser::{parse_to_serde_value, ParseOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time;

use crate::error_log::DEFAULT_ERROR_LOG_CAPACITY;

const APP_NAME: &str = "markclip-rs";

/// Host process settings. Format options are not here: they live in the
/// key/value store next to the error log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub storage_path: Option<String>,

    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,

    #[serde(default = "default_auto_copy_clipboard")]
    pub auto_copy_clipboard: bool,

    #[serde(default)]
    pub extra_protected_prefixes: Vec<String>,
}

fn default_error_log_capacity() -> usize {
    DEFAULT_ERROR_LOG_CAPACITY
}

fn default_auto_copy_clipboard() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: None,
            error_log_capacity: default_error_log_capacity(),
            auto_copy_clipboard: default_auto_copy_clipboard(),
            extra_protected_prefixes: Vec::new(),
        }
    }
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        let value = parse_to_serde_value(content, &ParseOptions::default())
            .context("Failed to parse config as JSONC")?
            .ok_or_else(|| anyhow!("Config file did not contain a JSON value"))?;
        let mut config: Config =
            serde_json::from_value(value).context("Failed to deserialize config")?;
        config.error_log_capacity = config.error_log_capacity.max(1);
        Ok(config)
    }
}

#[derive(Clone)]
pub struct ConfigManager {
    inner: Arc<ConfigManagerInner>,
}

struct ConfigManagerInner {
    config: RwLock<Config>,
    config_path: PathBuf,
    data_dir: PathBuf,
    change_tx: watch::Sender<Config>,
    watcher_active: AtomicBool,
}

impl ConfigManager {
    pub fn load() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", APP_NAME)
            .context("Failed to get config directory")?;
        let config_dir = dirs.config_dir().to_path_buf();
        let data_dir = dirs.data_dir().to_path_buf();

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        let config_path = config_dir.join("config.jsonc");
        Self::load_from(config_path, data_dir)
    }

    /// Loads (or creates with defaults) the config at `config_path`.
    pub fn load_from(config_path: PathBuf, data_dir: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::read_config_from_disk(&config_path)?
        } else {
            let default_config = Config::default();
            Self::write_config_file(&config_path, &default_config)?;
            tracing::info!("Created default config at: {:?}", config_path);
            default_config
        };

        tracing::info!("Loaded config from: {:?}", config_path);

        let (change_tx, _) = watch::channel(config.clone());

        Ok(Self {
            inner: Arc::new(ConfigManagerInner {
                config: RwLock::new(config),
                config_path,
                data_dir,
                change_tx,
                watcher_active: AtomicBool::new(false),
            }),
        })
    }

    pub fn start_watching(&self) {
        if self.inner.watcher_active.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut last_state = Self::file_state(&inner.config_path);
            let mut ticker = time::interval(Duration::from_millis(500));

            loop {
                ticker.tick().await;

                let current_state = Self::file_state(&inner.config_path);
                if current_state == last_state {
                    continue;
                }

                last_state = current_state;

                match Self::read_config_from_disk(&inner.config_path) {
                    Ok(new_config) => {
                        let changed = match inner.config.write() {
                            Ok(mut guard) if *guard != new_config => {
                                *guard = new_config.clone();
                                true
                            }
                            Ok(_) => false,
                            Err(_) => {
                                tracing::warn!("Config lock poisoned; ignoring reload");
                                false
                            }
                        };

                        if changed && inner.change_tx.send(new_config).is_ok() {
                            tracing::info!("Reloaded config from: {:?}", inner.config_path);
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Failed to reload config: {err:#}");
                    }
                }
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.inner.change_tx.subscribe()
    }

    pub fn get(&self) -> Config {
        match self.inner.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Where the key/value store lives: the configured override, or
    /// `storage.json` in the platform data directory.
    pub fn storage_file(&self) -> PathBuf {
        match self.get().storage_path {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => self.inner.data_dir.join("storage.json"),
        }
    }

    fn read_config_from_disk(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {:?}", path))?;
        Config::parse(&content)
    }

    fn write_config_file(path: &Path, config: &Config) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(path, json).with_context(|| format!("Failed to write config file at {:?}", path))
    }

    fn file_state(path: &Path) -> Option<(SystemTime, u64)> {
        let metadata = fs::metadata(path).ok()?;
        let modified = metadata.modified().ok()?;
        Some((modified, metadata.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_jsonc_with_comments_and_defaults() {
        let config = Config::parse(
            r#"{
                // keep the log short
                "error_log_capacity": 0,
                "extra_protected_prefixes": ["https://intranet.local"]
            }"#,
        )
        .expect("parse");
        assert_eq!(config.error_log_capacity, 1);
        assert!(config.auto_copy_clipboard);
        assert_eq!(config.extra_protected_prefixes, vec!["https://intranet.local"]);
    }

    #[test]
    fn creates_default_file_and_resolves_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("cfg").join("config.jsonc");
        let manager =
            ConfigManager::load_from(config_path.clone(), dir.path().join("data")).expect("load");

        assert!(config_path.exists());
        assert_eq!(manager.get(), Config::default());
        assert_eq!(
            manager.storage_file(),
            dir.path().join("data").join("storage.json")
        );

        fs::write(&config_path, r#"{ "storage_path": "/tmp/custom.json" }"#).unwrap();
        let reloaded =
            ConfigManager::load_from(config_path, dir.path().join("data")).expect("reload");
        assert_eq!(reloaded.storage_file(), PathBuf::from("/tmp/custom.json"));
    }
}
