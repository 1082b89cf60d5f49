//! Environment-driven configuration.

use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Chain file storage settings.
    pub storage: StorageConfig,
    /// Node cache settings.
    pub cache: CacheConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Chain storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory where chain files and metadata sidecars live.
    pub directory: PathBuf,
    /// Whether saves request compression by default.
    pub compress: bool,
    /// Whether saves rotate a backup of the previous file.
    pub backup: bool,
    /// How many timestamped backups to retain per chain file.
    pub max_backups: usize,
}

/// Node cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached nodes across all chains.
    pub capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g. `info`, `debug`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    /// Human-readable console output.
    Pretty,
    /// Structured JSON lines.
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let storage = StorageConfig {
            directory: PathBuf::from(
                env::var("CHAIN_STORAGE_DIR").unwrap_or_else(|_| "./data/chains".to_string()),
            ),
            compress: env::var("CHAIN_COMPRESS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
            backup: env::var("CHAIN_BACKUP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            max_backups: env::var("CHAIN_MAX_BACKUPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        };

        let cache = CacheConfig {
            capacity: match env::var("NODE_CACHE_CAPACITY") {
                Ok(raw) => raw.parse().map_err(|_| AppError::Config {
                    message: format!("NODE_CACHE_CAPACITY is not a valid size: {}", raw),
                })?,
                Err(_) => 256,
            },
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        Ok(Config {
            storage,
            cache,
            logging,
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/chains"),
            compress: false,
            backup: true,
            max_backups: 3,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}
