//! CLI settings file
//!
//! `semfs.json` holds the file system configuration plus the provider
//! wiring only the CLI knows about.

use anyhow::{Context, Result};
use semfs_core::FileSystemConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub file_system: FileSystemConfig,
    /// First-level child name → provider id, for folders bound to `federation`
    #[serde(default)]
    pub federation: BTreeMap<String, String>,
    /// HTTP timeout of the REST provider in seconds
    #[serde(default)]
    pub rest_timeout_secs: Option<u64>,
}

impl Settings {
    /// Settings for a store directory; tree, cache and spool files live below `dir`
    pub fn for_dir(dir: &Path) -> Self {
        Self {
            file_system: FileSystemConfig::persistent(dir),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semfs_core::CacheBackend;
    use tempfile::TempDir;

    #[test]
    fn test_missing_settings_are_in_memory() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("semfs.json")).unwrap();
        assert!(settings.file_system.tree_path.is_none());
        assert!(settings.federation.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("semfs.json");
        let mut settings = Settings::for_dir(&dir.path().join("store"));
        settings.federation.insert("api".to_string(), "rest".to_string());
        settings.rest_timeout_secs = Some(5);
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.federation.get("api").map(String::as_str), Some("rest"));
        assert_eq!(loaded.rest_timeout_secs, Some(5));
        assert_eq!(
            loaded.file_system.tree_path,
            Some(dir.path().join("store").join("tree.json"))
        );
        assert!(matches!(loaded.file_system.cache, CacheBackend::Fjall { .. }));
    }

    #[test]
    fn test_flattened_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"federation": {"a": "b"}}"#).unwrap();
        assert_eq!(settings.file_system.default_provider_id, "default");
        assert!(settings.file_system.auto_flush);
        assert_eq!(settings.federation.len(), 1);
    }
}
