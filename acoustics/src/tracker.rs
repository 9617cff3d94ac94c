//! Persistent openings with stable identity across scan cycles
//!
//! Clusters come and go from one scan to the next. The tracker turns them
//! into long-lived [`TrackedOpening`]s that ambient emitters can be attached
//! to, and decides when an opening has really gone away.

use crate::cluster::{ClusterAnchor, OpeningCluster};
use crate::config::AcousticsConfig;
use crate::enclosure::horizontal_distance;
use crate::occlusion::OcclusionEvaluator;
use glam::{IVec3, Vec3};
use tracing::{debug, trace};

/// An opening followed across scans
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOpening {
    pub id: u32,
    pub position: Vec3,
    /// Latest cluster weight
    pub raw_weight: f32,
    /// Fast-attack, slow-decay view of `raw_weight`
    pub smoothed_weight: f32,
    pub occlusion: f32,
    pub created_ms: u64,
    pub last_verified_ms: u64,
    /// Matched by a cluster this cycle
    pub verified: bool,
    pub member_positions: Vec<Vec3>,
    pub member_entry_positions: Vec<Vec3>,
    pub member_count: usize,
    pub last_verified_listener: Vec3,
    /// Set when a nearby block changed; the opening is dropped on the next update
    pub force_reverify: bool,
}

impl TrackedOpening {
    fn from_cluster(id: u32, cluster: &OpeningCluster, listener: Vec3, now_ms: u64) -> Self {
        Self {
            id,
            position: cluster.centroid,
            raw_weight: cluster.total_weight,
            smoothed_weight: cluster.total_weight,
            occlusion: cluster.average_occlusion,
            created_ms: now_ms,
            last_verified_ms: now_ms,
            verified: true,
            member_positions: cluster.member_positions.clone(),
            member_entry_positions: cluster.member_entry_positions.clone(),
            member_count: cluster.member_count,
            last_verified_listener: listener,
            force_reverify: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    BlockChanged,
    OutOfRange,
    Sealed,
    TimedOut,
    /// Absorbed into a stronger opening nearby
    Merged,
}

/// What changed during one tracker update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    pub created: Vec<u32>,
    pub removed: Vec<(u32, RemovalReason)>,
}

impl TrackerUpdate {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }
}

type AudibilityCheck = Box<dyn Fn(u32) -> bool>;

#[derive(Default)]
pub struct OpeningTracker {
    openings: Vec<TrackedOpening>,
    next_id: u32,
    audibility: Option<AudibilityCheck>,
}

impl std::fmt::Debug for OpeningTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningTracker")
            .field("openings", &self.openings)
            .field("next_id", &self.next_id)
            .field("audibility", &self.audibility.is_some())
            .finish()
    }
}

impl OpeningTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the "is this opening's emitter still playing" query.
    ///
    /// Without one, every unverified opening counts as inaudible and only
    /// lives out its timeout.
    pub fn set_audibility_check<F>(&mut self, check: F)
    where
        F: Fn(u32) -> bool + 'static,
    {
        self.audibility = Some(Box::new(check));
    }

    pub fn tracked_openings(&self) -> &[TrackedOpening] {
        &self.openings
    }

    pub fn get(&self, id: u32) -> Option<&TrackedOpening> {
        self.openings.iter().find(|o| o.id == id)
    }

    pub fn len(&self) -> usize {
        self.openings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.openings.is_empty()
    }

    /// Seeds for the next clustering pass, one per verified opening
    pub fn anchors(&self) -> Vec<ClusterAnchor> {
        self.openings
            .iter()
            .filter(|o| o.verified)
            .map(|o| ClusterAnchor::new(o.position))
            .collect()
    }

    pub fn clear(&mut self) {
        self.openings.clear();
    }

    /// Flag openings whose geometry touches `pos` for removal on the next update
    pub fn on_block_changed(&mut self, pos: IVec3) -> usize {
        let mut flagged = 0;
        for opening in &mut self.openings {
            let entry_hit = opening
                .member_entry_positions
                .iter()
                .any(|p| (p.floor().as_ivec3() - pos).abs().max_element() <= 1);
            let member_hit = opening.member_positions.iter().any(|p| {
                let cell = p.floor().as_ivec3();
                (cell.x - pos.x).abs() <= 1 && (cell.z - pos.z).abs() <= 1
            });
            if (entry_hit || member_hit) && !opening.force_reverify {
                opening.force_reverify = true;
                flagged += 1;
            }
        }
        if flagged > 0 {
            debug!(?pos, flagged, "Block change invalidated openings");
        }
        flagged
    }

    /// Reconcile tracked openings with this cycle's clusters
    pub fn update(
        &mut self,
        evaluator: &OcclusionEvaluator,
        clusters: &[OpeningCluster],
        listener: Vec3,
        now_ms: u64,
        scan_radius: f32,
    ) -> TrackerUpdate {
        let config = evaluator.config();
        let mut result = TrackerUpdate::default();

        self.match_clusters(config, clusters, listener, now_ms, &mut result);
        self.merge_overlapping(config.tracker.merge_radius, &mut result);
        self.remove_stale(evaluator, listener, now_ms, scan_radius, &mut result);

        if !result.is_empty() {
            debug!(
                created = result.created.len(),
                removed = result.removed.len(),
                tracked = self.openings.len(),
                "Opening tracker update"
            );
        }
        result
    }

    fn match_clusters(
        &mut self,
        config: &AcousticsConfig,
        clusters: &[OpeningCluster],
        listener: Vec3,
        now_ms: u64,
        result: &mut TrackerUpdate,
    ) {
        let tracker = &config.tracker;
        let mut consumed = vec![false; clusters.len()];

        for opening in &mut self.openings {
            opening.verified = false;

            let nearest = clusters
                .iter()
                .enumerate()
                .filter(|(i, _)| !consumed[*i])
                .map(|(i, c)| (i, horizontal_distance(c.centroid, opening.position)))
                .filter(|(_, d)| *d <= tracker.match_radius)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            let Some((index, _)) = nearest else {
                continue;
            };
            consumed[index] = true;
            let cluster = &clusters[index];

            opening.raw_weight = cluster.total_weight;
            opening.smoothed_weight = if cluster.total_weight >= opening.smoothed_weight {
                cluster.total_weight
            } else {
                cluster
                    .total_weight
                    .max(opening.smoothed_weight - tracker.weight_decay)
            };

            let shift = cluster.centroid.distance(opening.position);
            if shift < tracker.position_snap_min || shift > tracker.position_snap_max {
                opening.position = cluster.centroid;
            } else {
                let t = tracker.position_lerp / (1.0 + shift * tracker.position_damping);
                opening.position = opening.position.lerp(cluster.centroid, t);
            }

            opening.occlusion = cluster.average_occlusion;
            opening.member_positions = cluster.member_positions.clone();
            opening.member_entry_positions = cluster.member_entry_positions.clone();
            opening.member_count = cluster.member_count;
            opening.last_verified_ms = now_ms;
            opening.last_verified_listener = listener;
            opening.verified = true;
        }

        for (cluster, _) in clusters.iter().zip(&consumed).filter(|(_, used)| !**used) {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            trace!(id, position = ?cluster.centroid, "New tracked opening");
            self.openings
                .push(TrackedOpening::from_cluster(id, cluster, listener, now_ms));
            result.created.push(id);
        }
    }

    /// Fold openings that drifted onto each other; the weaker one is absorbed
    ///
    /// An opening created and absorbed in the same update is never reported.
    fn merge_overlapping(&mut self, merge_radius: f32, result: &mut TrackerUpdate) {
        'restart: loop {
            for i in 0..self.openings.len() {
                for j in (i + 1)..self.openings.len() {
                    let distance = self.openings[i]
                        .position
                        .distance(self.openings[j].position);
                    if distance > merge_radius {
                        continue;
                    }

                    let (keep, drop) =
                        if self.openings[i].smoothed_weight >= self.openings[j].smoothed_weight {
                            (i, j)
                        } else {
                            (j, i)
                        };
                    let absorbed = self.openings.remove(drop);
                    let keep = if keep > drop { keep - 1 } else { keep };
                    let survivor = &mut self.openings[keep];
                    survivor.verified |= absorbed.verified;
                    survivor.force_reverify |= absorbed.force_reverify;
                    survivor.last_verified_ms =
                        survivor.last_verified_ms.max(absorbed.last_verified_ms);
                    trace!(kept = survivor.id, absorbed = absorbed.id, "Merged openings");

                    let created = result.created.iter().position(|&id| id == absorbed.id);
                    if let Some(index) = created {
                        result.created.remove(index);
                    } else {
                        result.removed.push((absorbed.id, RemovalReason::Merged));
                    }
                    continue 'restart;
                }
            }
            break;
        }
    }

    fn remove_stale(
        &mut self,
        evaluator: &OcclusionEvaluator,
        listener: Vec3,
        now_ms: u64,
        scan_radius: f32,
        result: &mut TrackerUpdate,
    ) {
        let config = evaluator.config();
        let max_distance = scan_radius + config.tracker.distance_padding;
        let audibility = self.audibility.as_deref();

        self.openings.retain_mut(|opening| {
            let reason = if opening.force_reverify {
                Some(RemovalReason::BlockChanged)
            } else if horizontal_distance(opening.position, listener) > max_distance {
                Some(RemovalReason::OutOfRange)
            } else if is_sealed(evaluator, opening, listener) {
                Some(RemovalReason::Sealed)
            } else {
                if !opening.verified {
                    check_integrity(evaluator, opening);
                }
                let audible = !opening.verified
                    && audibility.map_or(false, |check| check(opening.id));
                if audible {
                    opening.last_verified_ms = now_ms;
                }
                let silent_for = now_ms.saturating_sub(opening.last_verified_ms);
                if !opening.verified && silent_for > config.tracker.timeout_ms {
                    Some(RemovalReason::TimedOut)
                } else {
                    None
                }
            };

            match reason {
                Some(reason) => {
                    trace!(id = opening.id, ?reason, "Removing tracked opening");
                    result.removed.push((opening.id, reason));
                    false
                }
                None => true,
            }
        });
    }
}

/// Every member column is roofed over, above both the member and the listener
fn is_sealed(evaluator: &OcclusionEvaluator, opening: &TrackedOpening, listener: Vec3) -> bool {
    if opening.member_positions.is_empty() {
        return false;
    }
    let world = evaluator.world();
    opening.member_positions.iter().all(|member| {
        let cell = member.floor().as_ivec3();
        match world.rain_height(cell.x, cell.z) {
            Ok(height) => {
                let height = height as f32;
                height > member.y && height > listener.y
            }
            Err(_) => false,
        }
    })
}

/// Re-check unverified members and scale the weight down to what is still open
fn check_integrity(evaluator: &OcclusionEvaluator, opening: &mut TrackedOpening) {
    let config = evaluator.config();
    if opening.member_positions.is_empty() {
        return;
    }

    let world = evaluator.world();
    let leave = config.enclosure.leave_threshold;
    let live = opening
        .member_positions
        .iter()
        .filter(|member| {
            config.tracker.integrity_offsets.iter().any(|&offset| {
                let point = **member + Vec3::Y * offset;
                let open = world
                    .cell(point.floor().as_ivec3())
                    .map(|cell| !cell.is_solid())
                    .unwrap_or(false);
                open && evaluator
                    .evaluate_weather(point, opening.last_verified_listener)
                    .structural
                    <= leave
            })
        })
        .count();

    if live != opening.member_count {
        let count = opening.member_positions.len();
        opening.smoothed_weight = opening.raw_weight * live as f32 / count as f32;
        opening.member_count = live;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raymarch::DdaMarcher;
    use crate::world::{CellInfo, VoxelGrid};
    use std::cell::Cell;
    use std::rc::Rc;

    fn cluster_at(x: f32, z: f32, weight: f32) -> OpeningCluster {
        let pos = Vec3::new(x, 2.5, z);
        OpeningCluster {
            centroid: pos,
            member_count: 1,
            average_occlusion: 0.0,
            average_distance: 5.0,
            total_weight: weight,
            member_positions: vec![pos],
            member_entry_positions: vec![pos],
        }
    }

    fn ground() -> VoxelGrid {
        let mut grid = VoxelGrid::new();
        grid.fill(IVec3::new(-30, 0, -30), IVec3::new(30, 0, 30), &CellInfo::stone());
        grid
    }

    const LISTENER: Vec3 = Vec3::new(0.5, 2.62, 0.5);

    #[test]
    fn test_new_clusters_become_openings() {
        let grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();

        let clusters = [cluster_at(5.0, 0.0, 1.0), cluster_at(-5.0, 0.0, 1.0)];
        let update = tracker.update(&eval, &clusters, LISTENER, 0, 12.0);
        assert_eq!(update.created, vec![0, 1]);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.anchors().len(), 2);
    }

    #[test]
    fn test_matching_keeps_identity_and_smooths_weight() {
        let grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();

        tracker.update(&eval, &[cluster_at(5.0, 0.0, 2.0)], LISTENER, 0, 12.0);
        let update = tracker.update(&eval, &[cluster_at(6.0, 0.0, 1.0)], LISTENER, 250, 12.0);
        assert!(update.created.is_empty());

        let opening = &tracker.tracked_openings()[0];
        assert_eq!(opening.id, 0);
        // Slow decay
        assert!((opening.smoothed_weight - 1.9).abs() < 1e-5);
        assert_eq!(opening.raw_weight, 1.0);
        // Damped move toward the new centroid
        assert!(opening.position.x > 5.0 && opening.position.x < 6.0);

        // Fast attack
        tracker.update(&eval, &[cluster_at(6.0, 0.0, 3.0)], LISTENER, 500, 12.0);
        assert_eq!(tracker.tracked_openings()[0].smoothed_weight, 3.0);
    }

    #[test]
    fn test_large_jump_snaps_position() {
        let grid = ground();
        let config = AcousticsConfig {
            tracker: crate::config::TrackerConfig {
                match_radius: 20.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();

        tracker.update(&eval, &[cluster_at(0.0, 5.0, 1.0)], LISTENER, 0, 12.0);
        tracker.update(&eval, &[cluster_at(0.0, -8.0, 1.0)], LISTENER, 250, 12.0);
        assert_eq!(tracker.tracked_openings()[0].position.z, -8.0);
    }

    #[test]
    fn test_overlapping_openings_merge() {
        let grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();

        let clusters = [cluster_at(5.0, 0.0, 1.0), cluster_at(6.0, 0.0, 2.0)];
        let update = tracker.update(&eval, &clusters, LISTENER, 0, 12.0);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.tracked_openings()[0].id, 1);
        // The absorbed newcomer never surfaces
        assert_eq!(update.created, vec![1]);
        assert!(update.removed.is_empty());
    }

    /// Two openings far enough apart to live side by side, and snapping config
    /// so the next clusters move them within merge range in one update
    fn drifting_pair(tracker: &mut OpeningTracker, eval: &OcclusionEvaluator) {
        let clusters = [cluster_at(5.0, 0.0, 1.0), cluster_at(9.0, 0.0, 2.0)];
        let update = tracker.update(eval, &clusters, LISTENER, 0, 12.0);
        assert_eq!(update.created, vec![0, 1]);
    }

    fn snapping_config() -> AcousticsConfig {
        AcousticsConfig {
            tracker: crate::config::TrackerConfig {
                position_snap_max: 0.5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_merged_opening_is_reported_removed() {
        let grid = ground();
        let config = snapping_config();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();
        drifting_pair(&mut tracker, &eval);

        let clusters = [cluster_at(6.5, 0.0, 1.0), cluster_at(8.0, 0.0, 2.0)];
        let update = tracker.update(&eval, &clusters, LISTENER, 250, 12.0);
        assert!(update.created.is_empty());
        assert_eq!(update.removed, vec![(0, RemovalReason::Merged)]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.tracked_openings()[0].id, 1);
    }

    #[test]
    fn test_merge_keeps_pending_block_change() {
        let grid = ground();
        let config = snapping_config();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();
        drifting_pair(&mut tracker, &eval);

        // Only the weaker opening sits next to the change
        assert_eq!(tracker.on_block_changed(IVec3::new(5, 2, 0)), 1);

        let clusters = [cluster_at(6.5, 0.0, 1.0), cluster_at(8.0, 0.0, 2.0)];
        let update = tracker.update(&eval, &clusters, LISTENER, 250, 12.0);
        assert_eq!(
            update.removed,
            vec![(0, RemovalReason::Merged), (1, RemovalReason::BlockChanged)]
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unverified_opening_times_out() {
        let grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();

        tracker.update(&eval, &[cluster_at(5.0, 0.0, 1.0)], LISTENER, 0, 12.0);
        let update = tracker.update(&eval, &[], LISTENER, 1000, 12.0);
        assert!(update.removed.is_empty());
        assert!(!tracker.tracked_openings()[0].verified);

        let update = tracker.update(&eval, &[], LISTENER, 3500, 12.0);
        assert_eq!(update.removed, vec![(0, RemovalReason::TimedOut)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_audible_opening_persists() {
        let grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();
        let playing = Rc::new(Cell::new(true));
        let flag = playing.clone();
        tracker.set_audibility_check(move |_| flag.get());

        tracker.update(&eval, &[cluster_at(5.0, 0.0, 1.0)], LISTENER, 0, 12.0);
        for tick in 1..20 {
            tracker.update(&eval, &[], LISTENER, tick * 1000, 12.0);
        }
        assert_eq!(tracker.len(), 1);

        playing.set(false);
        tracker.update(&eval, &[], LISTENER, 21_000, 12.0);
        assert_eq!(tracker.len(), 1);
        let update = tracker.update(&eval, &[], LISTENER, 30_000, 12.0);
        assert_eq!(update.removed, vec![(0, RemovalReason::TimedOut)]);
    }

    #[test]
    fn test_out_of_range_is_removed() {
        let grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();

        tracker.update(&eval, &[cluster_at(5.0, 0.0, 1.0)], LISTENER, 0, 12.0);
        let update = tracker.update(&eval, &[], Vec3::new(40.0, 2.62, 0.0), 250, 12.0);
        assert_eq!(update.removed, vec![(0, RemovalReason::OutOfRange)]);
    }

    #[test]
    fn test_roofed_over_opening_is_sealed() {
        let mut grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let mut tracker = OpeningTracker::new();

        {
            let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
            tracker.update(&eval, &[cluster_at(5.5, 0.5, 1.0)], LISTENER, 0, 12.0);
        }

        grid.set(IVec3::new(5, 6, 0), CellInfo::stone());
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let update = tracker.update(&eval, &[], LISTENER, 250, 12.0);
        assert_eq!(update.removed, vec![(0, RemovalReason::Sealed)]);
    }

    #[test]
    fn test_blocked_member_scales_weight_down() {
        let mut grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let mut tracker = OpeningTracker::new();

        let mut cluster = cluster_at(5.5, 0.5, 2.0);
        cluster.member_positions.push(Vec3::new(6.5, 2.5, 0.5));
        cluster.member_entry_positions.push(Vec3::new(6.5, 2.5, 0.5));
        cluster.member_count = 2;
        {
            let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
            tracker.update(&eval, &[cluster], LISTENER, 0, 12.0);
        }

        // Wall off the far member at every probed height
        grid.fill(IVec3::new(6, 1, 0), IVec3::new(6, 5, 0), &CellInfo::stone());
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        tracker.update(&eval, &[], LISTENER, 250, 12.0);

        let opening = &tracker.tracked_openings()[0];
        assert_eq!(opening.member_count, 1);
        assert!((opening.smoothed_weight - 1.0).abs() < 1e-5);

        // Clearing the wall brings the member straight back
        for y in 1..=5 {
            grid.clear(IVec3::new(6, y, 0));
        }
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        tracker.update(&eval, &[], LISTENER, 500, 12.0);

        let opening = &tracker.tracked_openings()[0];
        assert_eq!(opening.member_count, 2);
        assert!((opening.smoothed_weight - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_block_change_flags_and_removes() {
        let grid = ground();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut tracker = OpeningTracker::new();

        tracker.update(&eval, &[cluster_at(5.5, 0.5, 1.0)], LISTENER, 0, 12.0);
        assert_eq!(tracker.on_block_changed(IVec3::new(-10, 2, 0)), 0);
        assert_eq!(tracker.on_block_changed(IVec3::new(6, 40, 1)), 1);
        // Already flagged
        assert_eq!(tracker.on_block_changed(IVec3::new(5, 2, 0)), 0);

        let update = tracker.update(&eval, &[cluster_at(5.5, 0.5, 1.0)], LISTENER, 250, 12.0);
        assert_eq!(update.removed, vec![(0, RemovalReason::BlockChanged)]);
    }
}
