//! Compression profiles.
//!
//! Profile CRUD lives outside the engine; the engine only needs to resolve
//! an id to its current parameters through [`ProfileRegistry`].

use crate::error::{EngineError, Result};
use crate::types::ImageFormat;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named compression parameter bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionProfile {
    pub id: String,
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
    /// Encoder quality, 1..=100.
    pub quality: u8,
    /// Size the encoder should try to stay under.
    pub target_size_kb: u32,
    pub format: ImageFormat,
    pub retain_aspect_ratio: bool,
}

impl CompressionProfile {
    pub fn email() -> Self {
        Self {
            id: "email".into(),
            name: "Email Optimized".into(),
            max_width: 800,
            max_height: 800,
            quality: 85,
            target_size_kb: 500,
            format: ImageFormat::Jpeg,
            retain_aspect_ratio: true,
        }
    }

    pub fn web() -> Self {
        Self {
            id: "web".into(),
            name: "Web Standard".into(),
            max_width: 1920,
            max_height: 1920,
            quality: 90,
            target_size_kb: 500,
            format: ImageFormat::Jpeg,
            retain_aspect_ratio: true,
        }
    }

    pub fn web_hq() -> Self {
        Self {
            id: "web_hq".into(),
            name: "Web High Quality".into(),
            max_width: 2560,
            max_height: 2560,
            quality: 95,
            target_size_kb: 1000,
            format: ImageFormat::Webp,
            retain_aspect_ratio: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::validation("compression profile id is empty"));
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err(EngineError::validation(format!(
                "profile '{}' has non-positive max dimensions {}x{}",
                self.id, self.max_width, self.max_height
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(EngineError::validation(format!(
                "profile '{}' quality must be within 1..=100, got {}",
                self.id, self.quality
            )));
        }
        Ok(())
    }
}

/// Resolves compression profile ids.
pub trait ProfileRegistry: Send + Sync {
    /// Current parameters for `id`, or `None` if no such profile exists.
    fn get_profile(&self, id: &str) -> Option<CompressionProfile>;
}

/// In-memory profile registry.
pub struct StaticProfiles {
    profiles: RwLock<HashMap<String, CompressionProfile>>,
}

impl StaticProfiles {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
        }
    }

    /// Registry seeded with the `email`, `web` and `web_hq` profiles.
    pub fn system_defaults() -> Self {
        let registry = Self::new();
        {
            let mut profiles = registry.profiles.write();
            for profile in [
                CompressionProfile::email(),
                CompressionProfile::web(),
                CompressionProfile::web_hq(),
            ] {
                profiles.insert(profile.id.clone(), profile);
            }
        }
        registry
    }

    /// Insert or replace a profile.
    pub fn upsert(&self, profile: CompressionProfile) -> Result<()> {
        profile.validate()?;
        self.profiles.write().insert(profile.id.clone(), profile);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<CompressionProfile> {
        self.profiles.write().remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.profiles.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for StaticProfiles {
    fn default() -> Self {
        Self::system_defaults()
    }
}

impl ProfileRegistry for StaticProfiles {
    fn get_profile(&self, id: &str) -> Option<CompressionProfile> {
        self.profiles.read().get(id).cloned()
    }
}
