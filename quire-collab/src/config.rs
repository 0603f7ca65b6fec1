//! Configuration for the collaboration components.
//!
//! Every section has production defaults and a `for_testing` constructor
//! with short timers and scratch paths.

use std::path::PathBuf;
use std::time::Duration;

/// Update store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Expected schema version; a store at any other version is moved aside
    pub version: u32,
    /// Squash a document's history when its newest record is older than this
    pub history_ttl: Option<Duration>,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".quire/updates"),
            version: 1,
            history_ttl: None,
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// File identity tracker configuration.
#[derive(Debug, Clone)]
pub struct FileIdConfig {
    /// Tree whose files receive stable identifiers
    pub root_dir: PathBuf,
    /// Database directory for the id table
    pub db_path: PathBuf,
    /// Run the filesystem watcher after the initial scan
    pub watch_filesystem: bool,
    /// How long raw events are collected before a batch is processed
    pub batch_window: Duration,
    /// Directories whose events are never processed, besides `db_path`
    pub ignored_paths: Vec<PathBuf>,
}

impl Default for FileIdConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            db_path: PathBuf::from(".quire/file_ids"),
            watch_filesystem: true,
            batch_window: Duration::from_millis(100),
            ignored_paths: Vec::new(),
        }
    }
}

impl FileIdConfig {
    /// No watcher; tests drive batches through `process_events`.
    pub fn for_testing(root_dir: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            db_path: db_path.into(),
            watch_filesystem: false,
            batch_window: Duration::from_millis(20),
            ignored_paths: Vec::new(),
        }
    }

    /// Ignore events under `path` (typically the update store directory).
    pub fn ignore(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignored_paths.push(path.into());
        self
    }
}

/// Per-room behaviour.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Debounce before saving to disk; `None` disables saving
    pub save_delay: Option<Duration>,
    /// Grace period before an empty room closes; `None` keeps rooms open
    pub cleanup_delay: Option<Duration>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            save_delay: Some(Duration::from_secs(1)),
            cleanup_delay: Some(Duration::from_secs(60)),
            broadcast_capacity: 256,
        }
    }
}

impl RoomConfig {
    pub fn for_testing() -> Self {
        Self {
            save_delay: Some(Duration::from_millis(50)),
            cleanup_delay: Some(Duration::from_millis(100)),
            broadcast_capacity: 64,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Everything the server binary wires together.
#[derive(Debug, Clone, Default)]
pub struct CollabConfig {
    pub server: ServerConfig,
    pub room: RoomConfig,
    pub store: StoreConfig,
    pub file_ids: FileIdConfig,
}

impl CollabConfig {
    /// Defaults rooted at `root`, with databases under `data_dir`.
    pub fn rooted(root: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data_dir = data_dir.into();
        let store_path = data_dir.join("updates");
        Self {
            server: ServerConfig::default(),
            room: RoomConfig::default(),
            store: StoreConfig {
                path: store_path.clone(),
                ..StoreConfig::default()
            },
            file_ids: FileIdConfig {
                root_dir: root,
                db_path: data_dir.join("file_ids"),
                ..FileIdConfig::default()
            }
            .ignore(store_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_config_default() {
        let config = RoomConfig::default();
        assert_eq!(config.save_delay, Some(Duration::from_secs(1)));
        assert_eq!(config.cleanup_delay, Some(Duration::from_secs(60)));
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.version, 1);
        assert!(config.history_ttl.is_none());
    }

    #[test]
    fn test_rooted_ignores_store_directory() {
        let config = CollabConfig::rooted("/srv/docs", "/srv/data");
        assert_eq!(config.store.path, PathBuf::from("/srv/data/updates"));
        assert_eq!(config.file_ids.db_path, PathBuf::from("/srv/data/file_ids"));
        assert_eq!(config.file_ids.ignored_paths, vec![PathBuf::from("/srv/data/updates")]);
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
    }
}
