//! Configuration for the acoustics core
//!
//! All values are read-only inputs; nothing in the core mutates them. The
//! whole tree (de)serializes from JSON so tuning can happen without a rebuild.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcousticsConfig {
    /// Master switch. When off every pipeline returns its neutral result.
    pub enabled: bool,
    pub occlusion: OcclusionConfig,
    pub enclosure: EnclosureConfig,
    pub cluster: ClusterConfig,
    pub tracker: TrackerConfig,
    pub reverb_cache: ReverbCacheConfig,
    pub paths: PathConfig,
}

impl Default for AcousticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            occlusion: OcclusionConfig::default(),
            enclosure: EnclosureConfig::default(),
            cluster: ClusterConfig::default(),
            tracker: TrackerConfig::default(),
            reverb_cache: ReverbCacheConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

/// Per-ray occlusion and multi-ray voting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionConfig {
    /// Saturation point of accumulated occlusion
    pub max_occlusion: f32,
    /// Exponent scale when converting occlusion to a filter value
    pub absorption_coefficient: f32,
    /// Filter value never drops below this
    pub min_filter: f32,
    /// Occlusion applied by one liquid cell
    pub liquid_occlusion: f32,
    /// Offset applied to the source end of the voting rays
    pub variation_distance: f32,
    /// Center ray at or above this is trusted as blocked
    pub trust_blocked_threshold: f32,
    /// Center ray below this is trusted as clear
    pub trust_clear_threshold: f32,
    /// Offset ray at or above this counts as a vote
    pub vote_threshold: f32,
    /// Votes needed (out of 8) to override a clear center ray
    pub votes_required: usize,
    /// Stop voting once enough votes are in and one of them reached this fraction of max
    pub vote_early_exit_fraction: f32,
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            max_occlusion: 5.0,
            absorption_coefficient: 0.35,
            min_filter: 0.05,
            liquid_occlusion: 0.6,
            variation_distance: 0.35,
            trust_blocked_threshold: 0.5,
            trust_clear_threshold: 0.3,
            vote_threshold: 0.5,
            votes_required: 6,
            vote_early_exit_fraction: 0.95,
        }
    }
}

/// Enclosure scan: sky coverage, DDA verification and opening cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclosureConfig {
    /// Minimum time between two scans
    pub scan_interval_ms: u64,
    /// Manhattan radius of the sampling diamond, in columns
    pub scan_radius: i32,
    /// Gaussian falloff of sample weights
    pub sample_sigma: f32,
    /// Exposed columns further below the listener than this are ignored
    pub max_vertical_difference: f32,
    pub min_verify_budget: usize,
    pub max_verify_budget: usize,
    /// Listener body height, used to detect multi-story gaps
    pub body_height: f32,
    /// Listener position is taken as the ears, this far above the feet
    pub eye_height: f32,
    /// Heights above the rain impact point tested per candidate
    pub height_ladder: Vec<f32>,
    /// How many ladder rungs the neighbor search uses
    pub neighbor_ladder_len: usize,
    /// Occlusion a new column must stay at or under to be verified
    pub join_threshold: f32,
    /// Occlusion a cached column must stay at or under to remain verified
    pub leave_threshold: f32,
    /// Blocked columns under this are neighbor-search suspects
    pub partial_threshold: f32,
    /// Strict threshold for neighbor and cave-probe openings
    pub occluded_threshold: f32,
    pub max_neighbor_suspects: usize,
    /// Consecutive missed scans tolerated before a cached column is evicted
    pub grace_misses: u32,
    /// Extra distance beyond the scan radius before cached columns are pruned
    pub prune_margin: f32,
    pub cave_probe_coverage: f32,
    pub cave_directions: usize,
    pub cave_elevations_deg: Vec<f32>,
    pub cave_probe_distance: f32,
    /// Coverage under this with no exposed columns means "outdoors"
    pub outdoor_coverage_threshold: f32,
    /// Coverage is raised to at least raw DDA occlusion times this
    pub coverage_floor_scale: f32,
    /// Coverage is capped at raw DDA occlusion plus this when the listener sees the sky
    pub coverage_ceiling_margin: f32,
    /// Per-scan approach rate of the smoothed outputs
    pub smoothing_rate: f32,
}

impl Default for EnclosureConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 250,
            scan_radius: 12,
            sample_sigma: 6.0,
            max_vertical_difference: 24.0,
            min_verify_budget: 15,
            max_verify_budget: 40,
            body_height: 1.8,
            eye_height: 1.62,
            height_ladder: vec![1.01, 2.0, 3.0, 4.0, 8.0, 12.0],
            neighbor_ladder_len: 4,
            join_threshold: 0.35,
            leave_threshold: 0.75,
            partial_threshold: 2.5,
            occluded_threshold: 0.25,
            max_neighbor_suspects: 4,
            grace_misses: 3,
            prune_margin: 4.0,
            cave_probe_coverage: 0.6,
            cave_directions: 16,
            cave_elevations_deg: vec![0.0, 25.0, 50.0],
            cave_probe_distance: 24.0,
            outdoor_coverage_threshold: 0.3,
            coverage_floor_scale: 0.85,
            coverage_ceiling_margin: 0.15,
            smoothing_rate: 0.35,
        }
    }
}

/// Opening clusterer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Horizontal absorption radius around a seed or anchor
    pub radius: f32,
    /// Clarity floor so no member ends up with zero weight
    pub min_clarity: f32,
    pub max_clusters: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius: 4.0,
            min_clarity: 0.05,
            max_clusters: 4,
        }
    }
}

/// Persistent opening tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub match_radius: f32,
    pub merge_radius: f32,
    /// Added to the scan radius before an opening counts as out of range
    pub distance_padding: f32,
    /// Linear decay of the smoothed weight per cycle
    pub weight_decay: f32,
    pub position_snap_min: f32,
    pub position_snap_max: f32,
    pub position_lerp: f32,
    /// Larger shifts are damped by `1 / (1 + shift * damping)`
    pub position_damping: f32,
    /// Heights above each member checked for solid blocks
    pub integrity_offsets: Vec<f32>,
    /// Unverified, inaudible openings are dropped after this long
    pub timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_radius: 5.0,
            merge_radius: 2.5,
            distance_padding: 6.0,
            weight_decay: 0.1,
            position_snap_min: 0.1,
            position_snap_max: 10.0,
            position_lerp: 0.5,
            position_damping: 0.25,
            integrity_offsets: vec![0.0, 1.0, 2.0],
            timeout_ms: 3000,
        }
    }
}

/// Spatial reverb cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbCacheConfig {
    pub sound_cell_size: f32,
    /// Listener cell sizes for near, mid and far sounds
    pub listener_cell_sizes: [f32; 3],
    /// Distance bounds between the near/mid and mid/far listener cells
    pub listener_tier_distances: [f32; 2],
    /// Sounds further than this from the listener are subject to the TTL
    pub far_distance: f32,
    pub ttl_ms: u64,
    /// A sound further than this (in occlusion) from the entry's creator is in another zone
    pub wall_check_occlusion: f32,
    pub capacity: usize,
    pub eviction_interval_ms: u64,
}

impl Default for ReverbCacheConfig {
    fn default() -> Self {
        Self {
            sound_cell_size: 4.0,
            listener_cell_sizes: [1.0, 2.0, 4.0],
            listener_tier_distances: [16.0, 48.0],
            far_distance: 32.0,
            ttl_ms: 2000,
            wall_check_occlusion: 0.99,
            capacity: 512,
            eviction_interval_ms: 1000,
        }
    }
}

/// Sound path blending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Weight percentile whose occlusion is reported as the blend
    pub blend_percentile: f32,
    /// Direction sums shorter than this (relative to total weight) count as cancelled
    pub cancellation_epsilon: f32,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            blend_percentile: 0.25,
            cancellation_epsilon: 1e-3,
        }
    }
}

impl AcousticsConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded acoustics config from {:?}", path.as_ref());
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        debug!("Saved acoustics config to {:?}", path.as_ref());
        Ok(())
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.occlusion;
        let e = &self.enclosure;

        let non_negative = [
            ("occlusion.max_occlusion", o.max_occlusion),
            ("occlusion.absorption_coefficient", o.absorption_coefficient),
            ("occlusion.min_filter", o.min_filter),
            ("occlusion.liquid_occlusion", o.liquid_occlusion),
            ("occlusion.variation_distance", o.variation_distance),
            ("enclosure.sample_sigma", e.sample_sigma),
            ("enclosure.join_threshold", e.join_threshold),
            ("enclosure.leave_threshold", e.leave_threshold),
            ("cluster.radius", self.cluster.radius),
            ("tracker.match_radius", self.tracker.match_radius),
            ("tracker.merge_radius", self.tracker.merge_radius),
            ("tracker.weight_decay", self.tracker.weight_decay),
            ("reverb_cache.sound_cell_size", self.reverb_cache.sound_cell_size),
            ("paths.blend_percentile", self.paths.blend_percentile),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }

        if o.max_occlusion <= 0.0 {
            return Err(ConfigError::Invalid(
                "occlusion.max_occlusion must be positive".to_string(),
            ));
        }
        if o.votes_required > 8 {
            return Err(ConfigError::Invalid(format!(
                "occlusion.votes_required cannot exceed 8, got {}",
                o.votes_required
            )));
        }
        if e.join_threshold > e.leave_threshold {
            return Err(ConfigError::Invalid(format!(
                "enclosure.join_threshold ({}) must not be looser than leave_threshold ({})",
                e.join_threshold, e.leave_threshold
            )));
        }
        if e.min_verify_budget > e.max_verify_budget {
            return Err(ConfigError::Invalid(
                "enclosure.min_verify_budget exceeds max_verify_budget".to_string(),
            ));
        }
        if e.height_ladder.is_empty() {
            return Err(ConfigError::Invalid(
                "enclosure.height_ladder must not be empty".to_string(),
            ));
        }
        if self.paths.blend_percentile > 1.0 {
            return Err(ConfigError::Invalid(
                "paths.blend_percentile must be within 0..=1".to_string(),
            ));
        }
        let sizes = &self.reverb_cache.listener_cell_sizes;
        if sizes.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ConfigError::Invalid(
                "reverb_cache.listener_cell_sizes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AcousticsConfig::default();
        assert!(config.enabled);
        assert!(config.validate().is_ok());
        assert_eq!(config.enclosure.height_ladder.len(), 6);
        assert_eq!(config.occlusion.votes_required, 6);
    }

    #[test]
    fn test_save_load_config() {
        let mut config = AcousticsConfig::default();
        config.occlusion.max_occlusion = 8.0;
        config.enclosure.scan_radius = 10;

        let temp_file = NamedTempFile::new().unwrap();
        config.save_to(temp_file.path()).unwrap();

        let loaded = AcousticsConfig::load_from(temp_file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "occlusion": { "max_occlusion": 3.0 }, "enabled": false }"#;
        let config: AcousticsConfig = serde_json::from_str(json).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.occlusion.max_occlusion, 3.0);
        assert_eq!(config.occlusion.min_filter, 0.05);
        assert_eq!(config.enclosure, EnclosureConfig::default());
    }

    #[test]
    fn test_inverted_hysteresis_rejected() {
        let mut config = AcousticsConfig::default();
        config.enclosure.join_threshold = 1.0;
        config.enclosure.leave_threshold = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let mut config = AcousticsConfig::default();
        config.occlusion.absorption_coefficient = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = AcousticsConfig::load_from("/definitely/not/here.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
