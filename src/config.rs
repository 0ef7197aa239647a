//! Engine configuration.

use crate::error::{EngineError, Result};
use crate::types::ImageFormat;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Engine configuration.
///
/// Deserializes from JSON with every field optional; durations are given
/// in whole seconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base path for all persisted state.
    pub path: PathBuf,

    /// Whether to create the storage directory if it doesn't exist.
    pub create_if_missing: bool,

    /// How long a session lives after creation or refresh.
    #[serde(deserialize_with = "seconds")]
    pub session_retention: Duration,

    /// Uploads are rejected once a session owns this many images.
    pub max_images_per_session: usize,

    /// Largest accepted upload payload.
    pub max_upload_bytes: usize,

    /// Formats accepted at upload.
    pub allowed_formats: Vec<ImageFormat>,

    /// Longest edge of generated thumbnails.
    pub thumbnail_max_edge: u32,

    /// Revision cache size (number of revisions).
    pub revision_cache_size: usize,

    /// How long a mutation waits for the image lock before failing with
    /// `Busy`. `None` waits indefinitely.
    #[serde(deserialize_with = "optional_seconds")]
    pub lock_timeout: Option<Duration>,

    /// Interval between background expiry sweeps.
    #[serde(deserialize_with = "seconds")]
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./storage"),
            create_if_missing: true,
            session_retention: 7 * DAY,
            max_images_per_session: 5,
            max_upload_bytes: 20 * 1024 * 1024,
            allowed_formats: ImageFormat::ALL.to_vec(),
            thumbnail_max_edge: 300,
            revision_cache_size: 64,
            lock_timeout: None,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| EngineError::Deserialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_retention.is_zero() {
            return Err(EngineError::validation("session_retention must be positive"));
        }
        if self.max_images_per_session == 0 {
            return Err(EngineError::validation("max_images_per_session must be positive"));
        }
        if self.max_upload_bytes == 0 {
            return Err(EngineError::validation("max_upload_bytes must be positive"));
        }
        if self.allowed_formats.is_empty() {
            return Err(EngineError::validation("allowed_formats must not be empty"));
        }
        if self.thumbnail_max_edge == 0 {
            return Err(EngineError::validation("thumbnail_max_edge must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(EngineError::validation("sweep_interval must be positive"));
        }
        Ok(())
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

fn optional_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.session_retention, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.max_images_per_session, 5);
        assert_eq!(config.thumbnail_max_edge, 300);
        assert!(config.lock_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(
            r#"{
                "path": "/tmp/retouch",
                "session_retention": 3600,
                "lock_timeout": 2,
                "allowed_formats": ["png", "jpeg"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.path, PathBuf::from("/tmp/retouch"));
        assert_eq!(config.session_retention, Duration::from_secs(3600));
        assert_eq!(config.lock_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.allowed_formats, vec![ImageFormat::Png, ImageFormat::Jpeg]);
        assert_eq!(config.max_images_per_session, 5);
    }

    #[test]
    fn test_from_json_rejects_zero_limits() {
        let result = EngineConfig::from_json(r#"{"max_images_per_session": 0}"#);
        assert!(matches!(result, Err(EngineError::Validation(_))));

        let result = EngineConfig::from_json(r#"{"thumbnail_max_edge": "big"}"#);
        assert!(matches!(result, Err(EngineError::Deserialization(_))));
    }
}
