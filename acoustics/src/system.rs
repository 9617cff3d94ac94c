//! Acoustics update system

use crate::cluster::cluster_openings;
use crate::config::AcousticsConfig;
use crate::enclosure::EnclosureScanner;
use crate::occlusion::OcclusionEvaluator;
use crate::path_resolver::SoundPathResolver;
use crate::reverb_cache::ReverbCache;
use crate::tracker::{OpeningTracker, TrackerUpdate};
use glam::{IVec3, Vec3};
use tracing::trace;

/// Everything the acoustics pipeline keeps between ticks
#[derive(Debug)]
pub struct AcousticsState {
    pub scanner: EnclosureScanner,
    pub tracker: OpeningTracker,
    pub reverb_cache: ReverbCache,
    pub resolver: SoundPathResolver,
}

impl AcousticsState {
    pub fn new(config: &AcousticsConfig) -> Self {
        Self {
            scanner: EnclosureScanner::new(&config.enclosure),
            tracker: OpeningTracker::new(),
            reverb_cache: ReverbCache::new(&config.reverb_cache),
            resolver: SoundPathResolver::new(),
        }
    }

    /// Forward a block change to everything that caches geometry
    pub fn on_block_changed(&mut self, pos: IVec3) {
        let flagged = self.tracker.on_block_changed(pos);
        let invalidated = self
            .reverb_cache
            .invalidate_cell_at(pos.as_vec3() + Vec3::splat(0.5));
        trace!(?pos, flagged, invalidated, "Block changed");
    }
}

/// Update the acoustics pipeline
///
/// Returns the tracker changes when an enclosure scan ran this tick.
pub fn acoustics_update_system(
    state: &mut AcousticsState,
    evaluator: &OcclusionEvaluator,
    listener: Vec3,
    now_ms: u64,
) -> Option<TrackerUpdate> {
    let config = evaluator.config();
    if !config.enabled {
        state.scanner.update(evaluator, listener, now_ms);
        state.tracker.clear();
        state.reverb_cache.clear();
        return None;
    }

    state.reverb_cache.maintain(now_ms);

    if !state.scanner.update(evaluator, listener, now_ms) {
        return None;
    }

    let anchors = state.tracker.anchors();
    let clusters = cluster_openings(
        state.scanner.verified_openings(),
        config.cluster.max_clusters,
        &anchors,
        &config.cluster,
    );
    trace!(clusters = clusters.len(), anchors = anchors.len(), "Clustered openings");

    Some(state.tracker.update(
        evaluator,
        &clusters,
        listener,
        now_ms,
        config.enclosure.scan_radius as f32,
    ))
}
