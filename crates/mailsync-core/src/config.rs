//! Persistent sync configuration.
//!
//! Stored as JSON, by default under the platform config directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sync::SyncOptions;
use crate::{Error, Result};

/// Directory name used under the platform config and data directories.
const APP_DIR: &str = "mailsync";

/// Sync settings that persist across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Location of the envelope cache database.
    pub database_path: PathBuf,
    /// Maximum number of concurrent fetch sessions.
    pub workers: usize,
    /// Seconds between progress reports during parallel fetches.
    pub progress_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            workers: 1,
            progress_interval_secs: 5,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `path`, falling back to defaults if the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`validate`](Self::validate).
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        tracing::info!("Sync configuration saved to {:?}", path);
        Ok(())
    }

    /// Check that the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.progress_interval_secs == 0 {
            return Err(Error::Config(
                "progress_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path is empty".to_string()));
        }
        Ok(())
    }

    /// Build run options from this configuration.
    #[must_use]
    pub fn options(&self) -> SyncOptions {
        SyncOptions::default()
            .with_workers(self.workers)
            .with_progress_interval(Duration::from_secs(self.progress_interval_secs))
    }
}

/// Default location of the configuration file.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.json")
}

/// Default location of the cache database.
#[must_use]
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("cache.db")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.progress_interval_secs, 5);
        assert!(config.database_path.ends_with("mailsync/cache.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"workers": 6}"#).unwrap();
        assert_eq!(config.workers, 6);
        assert_eq!(config.progress_interval_secs, 5);

        let options = config.options();
        assert_eq!(options.workers, 6);
        assert_eq!(options.progress_interval, Duration::from_secs(5));
        assert!(options.progress.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = SyncConfig {
            workers: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = SyncConfig {
            database_path: dir.path().join("cache.db"),
            workers: 4,
            progress_interval_secs: 2,
        };

        config.save(&path).await.unwrap();
        let loaded = SyncConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"progress_interval_secs": 0}"#)
            .await
            .unwrap();

        assert!(matches!(
            SyncConfig::load(&path).await,
            Err(Error::Config(_))
        ));
    }
}
