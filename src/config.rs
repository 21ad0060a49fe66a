//! Configuration Module
//!
//! Handles loading and managing service configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, ServiceError};

// == Cache Driver Kind ==
/// Index backend used by the image cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDriverKind {
    /// Embedded SQLite database inside the cache directory
    Sqlite,
    /// Extended attributes on the cached files themselves
    Xattr,
}

impl FromStr for CacheDriverKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "xattr" => Ok(Self::Xattr),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown image cache driver '{other}'"
            ))),
        }
    }
}

// == Executor Mode ==
/// Execution engine for asynchronous tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorMode {
    /// One worker, tasks run in submission order
    Serial,
    /// Every task gets its own tokio task
    Parallel,
    /// Bounded worker pool
    Pool,
}

impl FromStr for ExecutorMode {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "parallel" => Ok(Self::Parallel),
            "pool" | "worker-pool" => Ok(Self::Pool),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown task executor '{other}'"
            ))),
        }
    }
}

// == Backend Spec ==
/// A named backing store from `ENABLED_BACKENDS` (`name:type`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub name: String,
    pub kind: String,
}

/// Parses `fast:file, cheap:file` into backend specs.
pub fn parse_backends(raw: &str) -> Result<Vec<BackendSpec>> {
    let mut specs = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, kind) = item.split_once(':').ok_or_else(|| {
            ServiceError::InvalidRequest(format!("backend '{item}' must be written as name:type"))
        })?;
        let (name, kind) = (name.trim(), kind.trim());
        if name.is_empty() || kind.is_empty() {
            return Err(ServiceError::InvalidRequest(format!(
                "backend '{item}' must be written as name:type"
            )));
        }
        if specs.iter().any(|s: &BackendSpec| s.name == name) {
            return Err(ServiceError::InvalidRequest(format!(
                "backend '{name}' is listed twice"
            )));
        }
        specs.push(BackendSpec {
            name: name.to_string(),
            kind: kind.to_string(),
        });
    }
    Ok(specs)
}

/// Service configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    /// Registry database file (images, tasks, schema version)
    pub database_path: PathBuf,
    /// Root directory of the node-local image cache
    pub image_cache_dir: PathBuf,
    /// Cache index file name, relative to the cache directory
    pub image_cache_sqlite_db: String,
    /// Cache index backend
    pub image_cache_driver: CacheDriverKind,
    /// Cache ceiling in bytes, enforced by the pruner
    pub image_cache_max_size: u64,
    /// Seconds after which an incomplete cache write is considered stalled
    pub image_cache_stall_time: u64,
    /// Prefetcher period in seconds (0 disables the in-process prefetcher)
    pub cache_prefetcher_interval: u64,
    /// Maximum concurrent fetches per prefetch run
    pub cache_prefetcher_concurrency: usize,
    /// Run the pruner and cleaner inside the server's maintenance loop
    pub cache_inline_maintenance: bool,
    /// Maintenance loop period in seconds
    pub maintenance_interval: u64,
    /// Enabled backing stores
    pub enabled_backends: Vec<BackendSpec>,
    /// Store used for direct uploads
    pub default_backend: String,
    /// Parent directory for filesystem stores (one subdirectory per store)
    pub filesystem_store_datadir: PathBuf,
    /// Staging location for the interoperable import flow
    pub node_staging_uri: String,
    /// Import methods accepted by the import call
    pub enabled_import_methods: Vec<String>,
    /// Default completion policy for multi-store imports
    pub all_stores_must_succeed: bool,
    /// Directory `file://` import tasks may read from; unset disables them
    pub import_file_root: Option<PathBuf>,
    /// Fail unfinished image imports at startup. Turn off when several API
    /// nodes share one registry.
    pub recover_imports_on_start: bool,
    /// Task execution engine
    pub task_executor: ExecutorMode,
    /// Worker count for the pool executor
    pub task_max_workers: usize,
    /// Hours a finished task is kept before it expires
    pub task_time_to_live: u64,
    /// Largest accepted image upload in bytes
    pub image_size_cap: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// Unparseable numeric values fall back to their defaults; malformed
    /// backend lists and unknown driver or executor names are errors.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let enabled_backends = match env::var("ENABLED_BACKENDS") {
            Ok(raw) => parse_backends(&raw)?,
            Err(_) => defaults.enabled_backends.clone(),
        };
        let default_backend = env::var("DEFAULT_BACKEND").unwrap_or_else(|_| {
            enabled_backends
                .first()
                .map(|b| b.name.clone())
                .unwrap_or_default()
        });

        let config = Self {
            server_port: env_or("SERVER_PORT", defaults.server_port),
            database_path: env_or("DATABASE_PATH", defaults.database_path),
            image_cache_dir: env_or("IMAGE_CACHE_DIR", defaults.image_cache_dir),
            image_cache_sqlite_db: env_or("IMAGE_CACHE_SQLITE_DB", defaults.image_cache_sqlite_db),
            image_cache_driver: match env::var("IMAGE_CACHE_DRIVER") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.image_cache_driver,
            },
            image_cache_max_size: env_or("IMAGE_CACHE_MAX_SIZE", defaults.image_cache_max_size),
            image_cache_stall_time: env_or("IMAGE_CACHE_STALL_TIME", defaults.image_cache_stall_time),
            cache_prefetcher_interval: env_or(
                "CACHE_PREFETCHER_INTERVAL",
                defaults.cache_prefetcher_interval,
            ),
            cache_prefetcher_concurrency: env_or(
                "CACHE_PREFETCHER_CONCURRENCY",
                defaults.cache_prefetcher_concurrency,
            ),
            cache_inline_maintenance: env_or(
                "CACHE_INLINE_MAINTENANCE",
                defaults.cache_inline_maintenance,
            ),
            maintenance_interval: env_or("MAINTENANCE_INTERVAL", defaults.maintenance_interval),
            enabled_backends,
            default_backend,
            filesystem_store_datadir: env_or(
                "FILESYSTEM_STORE_DATADIR",
                defaults.filesystem_store_datadir,
            ),
            node_staging_uri: env_or("NODE_STAGING_URI", defaults.node_staging_uri),
            enabled_import_methods: env_list("ENABLED_IMPORT_METHODS", "glance-direct,copy-image"),
            all_stores_must_succeed: env_or(
                "ALL_STORES_MUST_SUCCEED",
                defaults.all_stores_must_succeed,
            ),
            import_file_root: env::var("IMPORT_FILE_ROOT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            recover_imports_on_start: env_or(
                "RECOVER_IMPORTS_ON_START",
                defaults.recover_imports_on_start,
            ),
            task_executor: match env::var("TASK_EXECUTOR") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.task_executor,
            },
            task_max_workers: env_or("TASK_MAX_WORKERS", defaults.task_max_workers),
            task_time_to_live: env_or("TASK_TIME_TO_LIVE", defaults.task_time_to_live),
            image_size_cap: env_or("IMAGE_SIZE_CAP", defaults.image_size_cap),
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_backends.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "at least one backend must be enabled".to_string(),
            ));
        }
        if !self
            .enabled_backends
            .iter()
            .any(|b| b.name == self.default_backend)
        {
            return Err(ServiceError::InvalidRequest(format!(
                "default backend '{}' is not enabled",
                self.default_backend
            )));
        }
        if self.cache_prefetcher_concurrency == 0 {
            return Err(ServiceError::InvalidRequest(
                "cache prefetcher concurrency must be at least 1".to_string(),
            ));
        }
        if self.task_max_workers == 0 {
            return Err(ServiceError::InvalidRequest(
                "task max workers must be at least 1".to_string(),
            ));
        }
        if self.maintenance_interval == 0 {
            return Err(ServiceError::InvalidRequest(
                "maintenance interval must be at least 1 second".to_string(),
            ));
        }
        self.staging_dir()?;
        Ok(())
    }

    /// Full path of the cache index database.
    pub fn cache_index_path(&self) -> PathBuf {
        self.image_cache_dir.join(&self.image_cache_sqlite_db)
    }

    /// Stall grace period as a Duration.
    pub fn stall_time(&self) -> Duration {
        Duration::from_secs(self.image_cache_stall_time)
    }

    /// Resolves `node_staging_uri` to a local directory. Only `file://` is supported.
    pub fn staging_dir(&self) -> Result<PathBuf> {
        self.node_staging_uri
            .strip_prefix("file://")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                ServiceError::InvalidRequest(format!(
                    "node staging uri '{}' must be a file:// uri",
                    self.node_staging_uri
                ))
            })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 9292,
            database_path: PathBuf::from("./data/registry.db"),
            image_cache_dir: PathBuf::from("./data/image-cache"),
            image_cache_sqlite_db: "cache.db".to_string(),
            image_cache_driver: CacheDriverKind::Sqlite,
            image_cache_max_size: 10 * 1024 * 1024 * 1024,
            image_cache_stall_time: 86_400,
            cache_prefetcher_interval: 300,
            cache_prefetcher_concurrency: 4,
            cache_inline_maintenance: false,
            maintenance_interval: 600,
            enabled_backends: vec![BackendSpec {
                name: "fast".to_string(),
                kind: "file".to_string(),
            }],
            default_backend: "fast".to_string(),
            filesystem_store_datadir: PathBuf::from("./data/images"),
            node_staging_uri: "file://./data/staging".to_string(),
            enabled_import_methods: vec!["glance-direct".to_string(), "copy-image".to_string()],
            all_stores_must_succeed: true,
            import_file_root: None,
            recover_imports_on_start: true,
            task_executor: ExecutorMode::Pool,
            task_max_workers: 10,
            task_time_to_live: 48,
            image_size_cap: 1024 * 1024 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server_port, 9292);
        assert_eq!(config.image_cache_max_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.image_cache_driver, CacheDriverKind::Sqlite);
        assert_eq!(config.task_executor, ExecutorMode::Pool);
        assert!(config.all_stores_must_succeed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        for key in [
            "SERVER_PORT",
            "IMAGE_CACHE_MAX_SIZE",
            "IMAGE_CACHE_DRIVER",
            "ENABLED_BACKENDS",
            "DEFAULT_BACKEND",
            "TASK_EXECUTOR",
            "NODE_STAGING_URI",
            "IMPORT_FILE_ROOT",
        ] {
            env::remove_var(key);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.server_port, 9292);
        assert_eq!(config.default_backend, "fast");
        assert_eq!(config.enabled_backends.len(), 1);
        assert!(config.import_file_root.is_none());
    }

    #[test]
    fn test_parse_backends() {
        let specs = parse_backends("fast:file, cheap:file").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].name, "cheap");
        assert_eq!(specs[1].kind, "file");

        assert!(parse_backends("fast").is_err());
        assert!(parse_backends("fast:file,fast:file").is_err());
        assert!(parse_backends("").unwrap().is_empty());
    }

    #[test]
    fn test_driver_and_executor_parsing() {
        assert_eq!("XATTR".parse::<CacheDriverKind>().unwrap(), CacheDriverKind::Xattr);
        assert!("redis".parse::<CacheDriverKind>().is_err());
        assert_eq!("serial".parse::<ExecutorMode>().unwrap(), ExecutorMode::Serial);
        assert!("threads".parse::<ExecutorMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_default_backend() {
        let config = Config {
            default_backend: "missing".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_staging_dir_requires_file_scheme() {
        let config = Config {
            node_staging_uri: "http://example.com/staging".to_string(),
            ..Config::default()
        };
        assert!(config.staging_dir().is_err());

        let config = Config {
            node_staging_uri: "file:///var/staging".to_string(),
            ..Config::default()
        };
        assert_eq!(config.staging_dir().unwrap(), PathBuf::from("/var/staging"));
    }
}
