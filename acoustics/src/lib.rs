//! Voxel sound propagation
//!
//! This crate estimates how sound moves through a voxel world:
//! - Ray-based occlusion with material weights and multi-ray voting
//! - Enclosure scanning to find where outdoor ambience gets in
//! - Clustering and tracking of openings with stable identity
//! - A spatial cache for expensive reverb traces
//! - Blending of weighted sound paths into one apparent source

pub mod cluster;
pub mod config;
pub mod enclosure;
pub mod error;
pub mod occlusion;
pub mod path_resolver;
pub mod raymarch;
pub mod reverb_cache;
pub mod system;
pub mod tracker;
pub mod world;

// Re-export commonly used types
pub use cluster::{cluster_openings, ClusterAnchor, OpeningCluster};
pub use config::AcousticsConfig;
pub use enclosure::{EnclosureScanner, VerifiedOpening};
pub use error::{ConfigError, WorldError};
pub use occlusion::{OcclusionEvaluator, WeatherOcclusion};
pub use path_resolver::{ResolvedPath, SoundPathResolver};
pub use raymarch::{DdaMarcher, GridMarcher};
pub use reverb_cache::{ReverbCache, ReverbData};
pub use system::{acoustics_update_system, AcousticsState};
pub use tracker::{OpeningTracker, TrackedOpening};
pub use world::{CellInfo, VoxelGrid, WorldQuery};

/// Initialize logging with a sensible default filter
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
