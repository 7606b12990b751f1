//! File system configuration
//!
//! Stored as JSON (`semfs.json` by convention). A missing file yields the
//! defaults.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Provider id used when no ancestor carries a template id
pub const DEFAULT_PROVIDER_ID: &str = "default";

/// Cache storage backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process memory; lost on exit
    #[default]
    Memory,
    /// Fjall database at `path`
    Fjall { path: PathBuf },
}

/// Configuration of a [`crate::SemanticFileSystem`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystemConfig {
    /// Persisted tree document; `None` keeps the tree in memory only
    #[serde(default)]
    pub tree_path: Option<PathBuf>,
    /// Provider id for nodes without a bound ancestor
    #[serde(default = "default_provider_id")]
    pub default_provider_id: String,
    /// Write the tree document as soon as a flush is requested
    #[serde(default = "default_auto_flush")]
    pub auto_flush: bool,
    #[serde(default)]
    pub cache: CacheBackend,
    /// Spool directory for local file copies
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_auto_flush() -> bool {
    true
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            tree_path: None,
            default_provider_id: default_provider_id(),
            auto_flush: default_auto_flush(),
            cache: CacheBackend::default(),
            local_dir: None,
        }
    }
}

impl FileSystemConfig {
    /// In-memory configuration, handy for tests
    pub fn in_memory() -> Self {
        Self {
            auto_flush: false,
            ..Self::default()
        }
    }

    /// Configuration rooted in `dir`: tree document, Fjall cache and spool directory
    pub fn persistent(dir: &Path) -> Self {
        Self {
            tree_path: Some(dir.join("tree.json")),
            cache: CacheBackend::Fjall {
                path: dir.join("cache"),
            },
            local_dir: Some(dir.join("local")),
            ..Self::default()
        }
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        let config: FileSystemConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Save configuration to `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Spool directory, defaulting below the system temp dir
    pub fn local_dir(&self) -> PathBuf {
        self.local_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("semfs-local"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = FileSystemConfig::load(&dir.path().join("semfs.json")).unwrap();
        assert_eq!(config.default_provider_id, DEFAULT_PROVIDER_ID);
        assert!(config.auto_flush);
        assert_eq!(config.cache, CacheBackend::Memory);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("semfs.json");
        let config = FileSystemConfig::persistent(dir.path());
        config.save(&path).unwrap();

        let loaded = FileSystemConfig::load(&path).unwrap();
        assert_eq!(loaded.tree_path, config.tree_path);
        assert_eq!(loaded.cache, config.cache);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_partial_document_uses_field_defaults() {
        let config: FileSystemConfig =
            serde_json::from_str(r#"{"cache": {"backend": "fjall", "path": "/tmp/c"}}"#).unwrap();
        assert_eq!(config.default_provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(
            config.cache,
            CacheBackend::Fjall {
                path: PathBuf::from("/tmp/c")
            }
        );
    }
}
