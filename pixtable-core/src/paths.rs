use std::path::{Path, PathBuf};

use directories::BaseDirs;

/// Subdirectory under the platform root that holds every table.
pub const TABLES_SUBDIR: &str = "ImageTables";

/// Where a cache keeps its files and under which namespace. Namespaces keep
/// multiple cache instances apart on disk.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub namespace: String,
    /// Explicit directory override; wins over platform resolution.
    pub directory: Option<PathBuf>,
    /// When false, tables live under the persistent data directory instead
    /// of the purgeable platform cache directory.
    pub use_cache_directory: bool,
}

impl CacheConfig {
    pub fn new(namespace: &str) -> CacheConfig {
        CacheConfig {
            namespace: namespace.to_string(),
            directory: None,
            use_cache_directory: true,
        }
    }

    pub fn with_directory(mut self, directory: impl AsRef<Path>) -> CacheConfig {
        self.directory = Some(directory.as_ref().to_path_buf());
        self
    }

    pub fn persistent(mut self) -> CacheConfig {
        self.use_cache_directory = false;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig::new("default")
    }
}

/// Resolve the directory that holds this cache's table and sidecar files:
/// explicit override, else the platform cache (or data) directory, always
/// sub-pathed `ImageTables/<namespace>`.
pub fn tables_directory(config: &CacheConfig) -> PathBuf {
    let root = match &config.directory {
        Some(dir) => dir.clone(),
        None => match BaseDirs::new() {
            Some(base) if config.use_cache_directory => base.cache_dir().to_path_buf(),
            Some(base) => base.data_dir().to_path_buf(),
            None => std::env::temp_dir(),
        },
    };
    root.join(TABLES_SUBDIR).join(&config.namespace)
}
