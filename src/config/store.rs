use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by an optional TOML file
///
/// Uses `ArcSwap` for lock-free reads; connection handlers read the
/// signaling settings on every new connection.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load configuration from `path`.
    ///
    /// A missing file is created with the default configuration. Without a
    /// path the store is memory-only.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_file(path).await?,
            None => AppConfig::default(),
        };
        config.validate()?;

        Ok(Self::from_parts(path.map(Path::to_path_buf), config))
    }

    /// Memory-only store holding `config`
    pub fn in_memory(config: AppConfig) -> Self {
        Self::from_parts(None, config)
    }

    fn from_parts(path: Option<PathBuf>, config: AppConfig) -> Self {
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    async fn load_file(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_file(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = toml::to_string_pretty(config)
            .map_err(|e| AppError::Config(e.to_string()))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Path of the backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("sfu-signal.toml");

        let store = ConfigStore::load(Some(&path)).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(*store.get(), AppConfig::default());
    }

    #[tokio::test]
    async fn test_load_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sfu-signal.toml");
        std::fs::write(
            &path,
            "[web]\nhttp_port = 9000\n\n[signaling]\nconsume_paused = true\n",
        )
        .unwrap();

        let config = ConfigStore::load(Some(&path)).await.unwrap().get();
        assert_eq!(config.web.http_port, 9000);
        assert!(config.signaling.consume_paused);
        assert_eq!(config.media.rtc_min_port, 2000);
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sfu-signal.toml");
        std::fs::write(&path, "[media]\nrtc_min_port = 5000\nrtc_max_port = 4000\n").unwrap();
        assert!(ConfigStore::load(Some(&path)).await.is_err());
    }

    #[tokio::test]
    async fn test_without_path_is_memory_only() {
        let store = ConfigStore::load(None).await.unwrap();
        assert!(store.path().is_none());
        assert_eq!(store.get().signaling.heartbeat_secs, 30);
    }

    #[tokio::test]
    async fn test_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[media\nrtc_min_port = ").unwrap();
        assert!(matches!(
            ConfigStore::load(Some(&path)).await,
            Err(AppError::Config(_))
        ));
    }
}
