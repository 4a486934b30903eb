use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::booru::dataset::DatasetSettings;
use crate::booru::image_cache::{DEFAULT_LOAD_CONCURRENCY, DEFAULT_THUMBNAIL_WIDTH};
use crate::booru::source::{PostOrder, SourceError};

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid value: {0}")]
    Invalid(#[from] SourceError),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub download_directory: String,
    pub log_directory: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            download_directory: "./downloads".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Pools {
    /// Concurrent image loads across all loaders.
    pub image_load_concurrency: usize,
    /// Download workers; 0 means one per CPU core.
    pub download_workers: usize,
    /// Memory cache entries kept before the cache is flushed; 0 is unbounded.
    pub image_cache_entries: usize,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            image_load_concurrency: DEFAULT_LOAD_CONCURRENCY,
            download_workers: 0,
            image_cache_entries: 512,
        }
    }
}

impl Pools {
    pub fn worker_count(&self) -> usize {
        if self.download_workers == 0 {
            num_cpus::get()
        } else {
            self.download_workers
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Http {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("booru_downloader/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Search {
    pub posts_per_page: u32,
    pub default_order: String,
}

impl Default for Search {
    fn default() -> Self {
        Self {
            posts_per_page: 32,
            default_order: PostOrder::Default.to_string(),
        }
    }
}

impl Search {
    pub fn order(&self) -> ConfigResult<PostOrder> {
        Ok(self.default_order.parse()?)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Sources {
    pub enabled: Vec<String>,
    pub danbooru_url: String,
    pub testbooru_url: String,
    pub e621_url: String,
}

impl Default for Sources {
    fn default() -> Self {
        use crate::booru::sources::{danbooru, e621};

        Self {
            enabled: crate::booru::sources::BUILTIN_SOURCES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            danbooru_url: danbooru::DANBOORU_URL.to_string(),
            testbooru_url: danbooru::TESTBOORU_URL.to_string(),
            e621_url: e621::E621_URL.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            log_to_terminal: false,
            log_to_file: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Library {
    /// Rescan when files appear in the download directory.
    pub watch: bool,
    pub thumbnail_width: u32,
}

impl Default for Library {
    fn default() -> Self {
        Self {
            watch: true,
            thumbnail_width: DEFAULT_THUMBNAIL_WIDTH,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub pools: Pools,
    pub http: Http,
    pub search: Search,
    pub sources: Sources,
    pub logging: Logging,
    pub library: Library,
    /// Defaults for dataset export.
    pub dataset: DatasetSettings,
}

// Config manager to handle config.toml
pub struct ConfigManager {
    app_config: RwLock<AppConfig>,
    config_dir: PathBuf,
}

impl ConfigManager {
    // Create a new ConfigManager, writing defaults when no config exists
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir)?;
        let manager = Self {
            app_config: RwLock::new(app_config),
            config_dir,
        };
        manager.create_default_config()?;
        Ok(manager)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse {}: {}", CONFIG_FILE, e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                fs::write(&config_path, toml::to_string_pretty(&default_config)?)?;
                info!("Created new {} with default values", CONFIG_FILE);

                Ok(default_config)
            }
        }
    }

    // Re-read config.toml from disk
    pub fn reload(&self) -> ConfigResult<AppConfig> {
        let config = Self::load_app_config(&self.config_dir)?;
        *self.app_config.write() = config.clone();
        info!("Reloaded app config");
        Ok(config)
    }

    // Get app config
    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    // Save app config to file
    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        fs::write(self.config_path(), toml::to_string_pretty(config)?)?;
        *self.app_config.write() = config.clone();
        Ok(())
    }

    // Create config.toml if it doesn't exist
    fn create_default_config(&self) -> ConfigResult<()> {
        let config_path = self.config_path();
        if !config_path.exists() {
            let config = self.get_app_config();
            fs::write(&config_path, toml::to_string_pretty(&config)?)?;
            info!("Wrote default config to {}", config_path.display());
        }
        Ok(())
    }
}

// Helper function to create a shared ConfigManager instance
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
    Ok(Arc::new(ConfigManager::new(config_dir)?))
}
