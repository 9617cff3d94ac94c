//! Behavioral properties of the clusterer, tracker, reverb cache and path resolver

use acoustics::config::{ClusterConfig, PathConfig};
use acoustics::tracker::RemovalReason;
use acoustics::{
    cluster_openings, AcousticsConfig, CellInfo, DdaMarcher, OcclusionEvaluator, OpeningCluster,
    OpeningTracker, ReverbCache, ReverbData, SoundPathResolver, VerifiedOpening, VoxelGrid,
};
use glam::{IVec3, Vec3};

fn ground() -> VoxelGrid {
    let mut grid = VoxelGrid::new();
    grid.fill(IVec3::new(-30, 0, -30), IVec3::new(30, 0, 30), &CellInfo::stone());
    grid
}

fn opening(x: i32, z: i32, occlusion: f32) -> VerifiedOpening {
    let world_pos = Vec3::new(x as f32 + 0.5, 2.01, z as f32 + 0.5);
    VerifiedOpening {
        world_pos,
        entry_pos: None,
        occlusion,
        distance: world_pos.length(),
        column_x: x,
        column_z: z,
    }
}

#[test]
fn test_cluster_member_counts_match_consumed_points() {
    let config = ClusterConfig::default();
    let openings: Vec<VerifiedOpening> = (0..12)
        .map(|i| opening((i % 4) * 9, (i / 4) * 9, 0.1 * (i % 3) as f32))
        .collect();

    let unlimited = cluster_openings(&openings, 64, &[], &config);
    let total: usize = unlimited.iter().map(|c| c.member_count).sum();
    assert_eq!(total, openings.len());

    // Points beyond the cluster limit are dropped, never double counted
    let limited = cluster_openings(&openings, 3, &[], &config);
    assert_eq!(limited.len(), 3);
    let total: usize = limited.iter().map(|c| c.member_count).sum();
    assert_eq!(total, 3);
    for pair in limited.windows(2) {
        assert!(pair[0].total_weight >= pair[1].total_weight);
    }
}

#[test]
fn test_audible_opening_survives_timeout() {
    let grid = ground();
    let config = AcousticsConfig::default();
    let marcher = DdaMarcher::default();
    let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
    let mut tracker = OpeningTracker::new();
    tracker.set_audibility_check(|_| true);

    let listener = Vec3::new(0.5, 2.62, 0.5);
    let cluster = OpeningCluster {
        centroid: Vec3::new(6.5, 2.01, 0.5),
        member_count: 1,
        average_occlusion: 0.0,
        average_distance: 6.0,
        total_weight: 1.0,
        member_positions: vec![Vec3::new(6.5, 2.01, 0.5)],
        member_entry_positions: vec![Vec3::new(6.5, 2.01, 0.5)],
    };
    tracker.update(&eval, &[cluster], listener, 0, 12.0);

    let timeout = config.tracker.timeout_ms;
    for tick in 1..=10 {
        let update = tracker.update(&eval, &[], listener, tick * timeout, 12.0);
        assert!(update.removed.is_empty(), "removed at tick {}", tick);
    }
    assert_eq!(tracker.len(), 1);

    // Distance still applies
    let update = tracker.update(&eval, &[], Vec3::new(60.5, 2.62, 0.5), 11 * timeout, 12.0);
    assert_eq!(update.removed, vec![(0, RemovalReason::OutOfRange)]);
}

#[test]
fn test_reverb_cache_store_and_lookup() {
    let grid = ground();
    let config = AcousticsConfig::default();
    let marcher = DdaMarcher::default();
    let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
    let mut cache = ReverbCache::new(&config.reverb_cache);

    let sound = Vec3::new(4.5, 1.5, 9.5);
    let listener = Vec3::new(0.5, 1.62, 0.5);
    let first = ReverbData {
        shared_airspace_ratio: 0.75,
        direct_occlusion: 0.4,
        ..Default::default()
    };
    let second = ReverbData {
        shared_airspace_ratio: 0.1,
        ..Default::default()
    };

    assert!(cache.store_if_empty(sound, listener, first.clone(), 0));
    assert_eq!(cache.try_get(&eval, sound, listener, 0), Some(&first));
    assert!(!cache.store_if_empty(sound, listener, second, 1));
    assert_eq!(cache.try_get(&eval, sound, listener, 2), Some(&first));
}

#[test]
fn test_path_resolution() {
    let config = PathConfig::default();
    let listener = Vec3::new(-4.0, 70.0, 12.0);

    let mut resolver = SoundPathResolver::new();
    resolver.add_path(Vec3::Z, 0.0, 1.0, 0.0);
    let resolved = resolver.resolve(listener, listener, &config).unwrap();
    assert_eq!(resolved.apparent_position, listener);
    assert_eq!(resolved.blended_occlusion, 0.0);

    resolver.add_path(Vec3::Z, 6.0, 1.0, 0.0);
    resolver.add_path(-Vec3::Z, 6.0, 1.0, 0.0);
    assert!(resolver
        .resolve(listener + Vec3::Z * 6.0, listener, &config)
        .is_none());
}
