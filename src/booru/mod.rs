//! Booru aggregation: sources, image loading, downloads and the local library.

pub mod config_loader;
pub mod dataset;
pub mod download;
pub mod image_cache;
pub mod library;
pub mod logger;
pub mod metadata;
pub mod post;
pub mod session;
pub mod source;
pub mod sources;
pub mod tags;
pub mod watcher;

#[cfg(test)]
mod tests;

// Re-export commonly used types for convenience
pub use config_loader::{AppConfig, ConfigError, ConfigManager, ConfigResult, init_config};

pub use logger::{Logger, LoggerError, LoggerResult, init_logger, log_error, log_system_event};

pub use session::{Session, SessionError, SessionResult};
