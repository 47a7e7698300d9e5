use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Sizing of the multi-resolution tier cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on sample values (rows x channels) held across all cached tiles.
    pub budget_samples: usize,
    /// Output rows per tile, at every downsampling factor.
    pub tile_len: usize,
    /// Ratio between the downsampling factors of adjacent tiers.
    pub level_ratio: u64,
    /// Factors at or above this are served as min/max envelopes instead of filtered samples.
    pub envelope_from_factor: u64,
    /// Anti-alias FIR length per unit of `level_ratio`.
    pub filter_taps_per_ratio: usize,
    /// Background threads building tiles for deadline-bounded requests.
    pub build_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_samples: 16 * 1024 * 1024,
            tile_len: 2048,
            level_ratio: 4,
            envelope_from_factor: 256,
            filter_taps_per_ratio: 16,
            build_workers: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Amplitude scale for channels without a per-channel override.
    pub base_scale: f32,
    /// Narrowest window navigation will allow, in native samples.
    pub min_view_samples: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            base_scale: 1.0,
            min_view_samples: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub render: RenderConfig,
    /// How long a window request waits for missing tiers before serving a coarser one.
    pub build_deadline_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            render: RenderConfig::default(),
            build_deadline_ms: 30,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn build_deadline(&self) -> Duration {
        Duration::from_millis(self.build_deadline_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.tile_len == 0 {
            return Err(EngineError::Config("tile_len must be positive".into()));
        }
        if cache.level_ratio < 2 {
            return Err(EngineError::Config("level_ratio must be at least 2".into()));
        }
        if cache.envelope_from_factor < cache.level_ratio {
            return Err(EngineError::Config(
                "envelope_from_factor must be at least level_ratio".into(),
            ));
        }
        if cache.filter_taps_per_ratio == 0 {
            return Err(EngineError::Config(
                "filter_taps_per_ratio must be positive".into(),
            ));
        }
        if cache.budget_samples == 0 {
            return Err(EngineError::Config("budget_samples must be positive".into()));
        }
        if !(self.render.base_scale.is_finite() && self.render.base_scale > 0.0) {
            return Err(EngineError::InvalidScale(self.render.base_scale));
        }
        Ok(())
    }
}
