//! Spatial cache for reverb raytrace results
//!
//! Multi-bounce reverb tracing is by far the most expensive per-sound query.
//! Results are keyed by a coarse sound cell and a distance-dependent listener
//! cell, so sounds that start near each other and are heard from roughly the
//! same spot share one trace.

use crate::config::ReverbCacheConfig;
use crate::occlusion::OcclusionEvaluator;
use glam::{IVec3, Vec3};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{debug, trace};

const AXIS_BITS: u32 = 10;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;
const TIER_SHIFT: u32 = 60;

/// One reflection point found by the reverb tracer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BouncePoint {
    pub position: Vec3,
    pub normal: Vec3,
    /// Path length from the sound to this point
    pub distance: f32,
    /// Occlusion between this point and the listener
    pub occlusion: f32,
}

/// A direction in which the tracer escaped into open air
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OpeningProbe {
    pub position: Vec3,
    pub occlusion: f32,
    pub distance: f32,
}

/// Raw output of one reverb trace
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReverbData {
    pub bounce_points: Vec<BouncePoint>,
    pub opening_probes: Vec<OpeningProbe>,
    /// Fraction of bounce points that can also see the listener
    pub shared_airspace_ratio: f32,
    pub direct_occlusion: f32,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: ReverbData,
    /// Position of the sound that created the entry
    sound_pos: Vec3,
    listener_pos: Vec3,
    sound_cell: IVec3,
    listener_cell: IVec3,
    listener_cell_size: f32,
    far: bool,
    created_ms: u64,
    last_used_ms: u64,
    use_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReverbCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits rejected because the querying sound is behind a wall from the creator
    pub wall_rejections: u64,
    pub stores: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellKey {
    sound_cell: IVec3,
    listener_cell: IVec3,
    tier: u8,
}

impl CellKey {
    fn pack(&self) -> u64 {
        let axis = |v: i32| (v as u32 as u64) & AXIS_MASK;
        let s = self.sound_cell;
        let l = self.listener_cell;
        axis(s.x)
            | axis(s.y) << AXIS_BITS
            | axis(s.z) << (AXIS_BITS * 2)
            | axis(l.x) << (AXIS_BITS * 3)
            | axis(l.y) << (AXIS_BITS * 4)
            | axis(l.z) << (AXIS_BITS * 5)
            | ((self.tier as u64) & 0xF) << TIER_SHIFT
    }
}

#[derive(Debug)]
pub struct ReverbCache {
    config: ReverbCacheConfig,
    entries: HashMap<u64, CacheEntry>,
    last_maintain_ms: Option<u64>,
    stats: ReverbCacheStats,
}

impl ReverbCache {
    pub fn new(config: &ReverbCacheConfig) -> Self {
        Self {
            config: config.clone(),
            entries: HashMap::new(),
            last_maintain_ms: None,
            stats: ReverbCacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> ReverbCacheStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn cell_key(&self, sound: Vec3, listener: Vec3) -> (CellKey, f32) {
        let distance = sound.distance(listener);
        let [near, mid] = self.config.listener_tier_distances;
        let tier: u8 = if distance < near {
            0
        } else if distance < mid {
            1
        } else {
            2
        };
        let listener_size = self.config.listener_cell_sizes[tier as usize].max(f32::EPSILON);
        let sound_size = self.config.sound_cell_size.max(f32::EPSILON);

        let key = CellKey {
            sound_cell: (sound / sound_size).floor().as_ivec3(),
            listener_cell: (listener / listener_size).floor().as_ivec3(),
            tier,
        };
        (key, listener_size)
    }

    /// Look up a cached trace for `sound` heard at `listener`
    pub fn try_get(
        &mut self,
        evaluator: &OcclusionEvaluator,
        sound: Vec3,
        listener: Vec3,
        now_ms: u64,
    ) -> Option<&ReverbData> {
        if !evaluator.config().enabled {
            return None;
        }

        let (key, _) = self.cell_key(sound, listener);
        let entry = match self.entries.get_mut(&key.pack()) {
            Some(entry)
                if entry.sound_cell == key.sound_cell
                    && entry.listener_cell == key.listener_cell =>
            {
                entry
            }
            _ => {
                self.stats.misses += 1;
                return None;
            }
        };

        if entry.far && now_ms.saturating_sub(entry.created_ms) > self.config.ttl_ms {
            self.stats.misses += 1;
            return None;
        }

        // Same cells can still be on opposite sides of a wall
        let separation = evaluator.evaluate(sound, entry.sound_pos);
        if separation > self.config.wall_check_occlusion {
            trace!(?sound, creator = ?entry.sound_pos, separation, "Reverb cache wall rejection");
            self.stats.wall_rejections += 1;
            self.stats.misses += 1;
            return None;
        }

        entry.last_used_ms = now_ms;
        entry.use_count += 1;
        self.stats.hits += 1;
        Some(&entry.data)
    }

    /// Store a trace unless its key is already taken. Returns whether it was stored.
    pub fn store_if_empty(
        &mut self,
        sound: Vec3,
        listener: Vec3,
        data: ReverbData,
        now_ms: u64,
    ) -> bool {
        let (key, listener_cell_size) = self.cell_key(sound, listener);
        let far = sound.distance(listener) > self.config.far_distance;

        match self.entries.entry(key.pack()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    data,
                    sound_pos: sound,
                    listener_pos: listener,
                    sound_cell: key.sound_cell,
                    listener_cell: key.listener_cell,
                    listener_cell_size,
                    far,
                    created_ms: now_ms,
                    last_used_ms: now_ms,
                    use_count: 0,
                });
                self.stats.stores += 1;
                true
            }
        }
    }

    /// Drop every entry whose sound or listener cell contains `pos`
    pub fn invalidate_cell_at(&mut self, pos: Vec3) -> usize {
        let sound_size = self.config.sound_cell_size.max(f32::EPSILON);
        let sound_cell = (pos / sound_size).floor().as_ivec3();
        let before = self.entries.len();

        self.entries.retain(|_, entry| {
            let listener_cell = (pos / entry.listener_cell_size).floor().as_ivec3();
            entry.sound_cell != sound_cell && entry.listener_cell != listener_cell
        });

        let removed = before - self.entries.len();
        if removed > 0 {
            trace!(?pos, removed, "Invalidated reverb cache cells");
        }
        removed
    }

    /// Periodic eviction: expired far entries first, then least recently used
    /// down to half capacity. Returns the number of entries evicted.
    pub fn maintain(&mut self, now_ms: u64) -> usize {
        if let Some(last) = self.last_maintain_ms {
            if now_ms >= last && now_ms - last < self.config.eviction_interval_ms {
                return 0;
            }
        }
        self.last_maintain_ms = Some(now_ms);

        let before = self.entries.len();
        let ttl = self.config.ttl_ms;
        self.entries
            .retain(|_, entry| !(entry.far && now_ms.saturating_sub(entry.created_ms) > ttl));

        if self.entries.len() > self.config.capacity {
            let target = self.config.capacity / 2;
            let mut by_age: Vec<(u64, u64)> = self
                .entries
                .iter()
                .map(|(key, entry)| (entry.last_used_ms, *key))
                .collect();
            by_age.sort_unstable();
            let excess = self.entries.len() - target;
            for (_, key) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }

        let evicted = before - self.entries.len();
        self.stats.evictions += evicted as u64;
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Reverb cache eviction");
        }
        evicted
    }

    /// Creator positions of an entry, mainly for debug display
    pub fn entry_origin(&self, sound: Vec3, listener: Vec3) -> Option<(Vec3, Vec3)> {
        let (key, _) = self.cell_key(sound, listener);
        self.entries
            .get(&key.pack())
            .map(|entry| (entry.sound_pos, entry.listener_pos))
    }

    pub fn use_count(&self, sound: Vec3, listener: Vec3) -> Option<u32> {
        let (key, _) = self.cell_key(sound, listener);
        self.entries.get(&key.pack()).map(|entry| entry.use_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcousticsConfig;
    use crate::raymarch::DdaMarcher;
    use crate::world::{CellInfo, VoxelGrid};

    fn data(direct: f32) -> ReverbData {
        ReverbData {
            bounce_points: vec![BouncePoint {
                position: Vec3::new(1.0, 2.0, 3.0),
                normal: Vec3::Y,
                distance: 4.0,
                occlusion: 0.0,
            }],
            opening_probes: Vec::new(),
            shared_airspace_ratio: 0.5,
            direct_occlusion: direct,
        }
    }

    #[test]
    fn test_key_packing_separates_axes() {
        let a = CellKey {
            sound_cell: IVec3::new(1, 0, 0),
            listener_cell: IVec3::ZERO,
            tier: 0,
        };
        let b = CellKey {
            sound_cell: IVec3::new(0, 1, 0),
            listener_cell: IVec3::ZERO,
            tier: 0,
        };
        let c = CellKey {
            tier: 2,
            ..a
        };
        assert_ne!(a.pack(), b.pack());
        assert_ne!(a.pack(), c.pack());
        assert_eq!(c.pack() >> TIER_SHIFT, 2);
    }

    #[test]
    fn test_store_then_get() {
        let grid = VoxelGrid::new();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut cache = ReverbCache::new(&config.reverb_cache);

        let sound = Vec3::new(5.0, 1.0, 5.0);
        let listener = Vec3::new(0.5, 1.0, 0.5);
        assert!(cache.try_get(&eval, sound, listener, 0).is_none());
        assert!(cache.store_if_empty(sound, listener, data(0.2), 0));
        assert_eq!(cache.try_get(&eval, sound, listener, 10), Some(&data(0.2)));

        // Nearby sound in the same cells shares the entry
        let neighbor = Vec3::new(5.5, 1.5, 6.0);
        assert!(cache.try_get(&eval, neighbor, listener, 20).is_some());
        assert_eq!(cache.use_count(sound, listener), Some(2));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_store_never_overwrites() {
        let mut cache = ReverbCache::new(&ReverbCacheConfig::default());
        let sound = Vec3::new(5.0, 1.0, 5.0);
        let listener = Vec3::new(0.5, 1.0, 0.5);
        assert!(cache.store_if_empty(sound, listener, data(0.2), 0));
        assert!(!cache.store_if_empty(sound, listener, data(3.0), 5));
        assert_eq!(cache.len(), 1);

        let grid = VoxelGrid::new();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let hit = cache.try_get(&eval, sound, listener, 10);
        assert_eq!(hit.map(|d| d.direct_occlusion), Some(0.2));
    }

    #[test]
    fn test_far_entries_expire() {
        let grid = VoxelGrid::new();
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut cache = ReverbCache::new(&config.reverb_cache);

        let sound = Vec3::new(40.0, 1.0, 0.5);
        let near_sound = Vec3::new(6.0, 1.0, 0.5);
        let listener = Vec3::new(0.5, 1.0, 0.5);
        cache.store_if_empty(sound, listener, data(0.0), 0);
        cache.store_if_empty(near_sound, listener, data(0.0), 0);

        assert!(cache.try_get(&eval, sound, listener, 1500).is_some());
        assert!(cache.try_get(&eval, sound, listener, 2500).is_none());
        // Near entries have no TTL
        assert!(cache.try_get(&eval, near_sound, listener, 60_000).is_some());

        assert_eq!(cache.maintain(2500), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_wall_between_sounds_rejects_without_evicting() {
        let mut grid = VoxelGrid::new();
        grid.fill(IVec3::new(2, 0, 0), IVec3::new(2, 3, 3), &CellInfo::stone());
        let config = AcousticsConfig::default();
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut cache = ReverbCache::new(&config.reverb_cache);

        let creator = Vec3::new(0.5, 1.5, 1.5);
        let behind_wall = Vec3::new(3.5, 1.5, 1.5);
        let listener = Vec3::new(10.5, 1.5, 1.5);
        cache.store_if_empty(creator, listener, data(0.0), 0);

        assert!(cache.try_get(&eval, behind_wall, listener, 10).is_none());
        assert_eq!(cache.stats().wall_rejections, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.try_get(&eval, creator, listener, 20).is_some());
    }

    #[test]
    fn test_listener_cell_follows_distance() {
        let cache = ReverbCache::new(&ReverbCacheConfig::default());
        let listener = Vec3::new(0.5, 1.0, 0.5);

        let (near, near_size) = cache.cell_key(Vec3::new(4.0, 1.0, 0.5), listener);
        let (far, far_size) = cache.cell_key(Vec3::new(100.0, 1.0, 0.5), listener);
        assert_eq!(near.tier, 0);
        assert_eq!(near_size, 1.0);
        assert_eq!(far.tier, 2);
        assert_eq!(far_size, 4.0);
    }

    #[test]
    fn test_lru_eviction_down_to_half_capacity() {
        let config = ReverbCacheConfig {
            capacity: 4,
            ..Default::default()
        };
        let mut cache = ReverbCache::new(&config);
        let listener = Vec3::new(0.5, 1.0, 0.5);
        for i in 0..6 {
            let sound = Vec3::new(0.5, 1.0, 4.0 * i as f32 + 0.5);
            cache.store_if_empty(sound, listener, data(0.0), i as u64);
        }
        assert_eq!(cache.len(), 6);

        assert_eq!(cache.maintain(100), 4);
        assert_eq!(cache.len(), 2);
        // The two most recently stored survive
        assert!(cache.entry_origin(Vec3::new(0.5, 1.0, 20.5), listener).is_some());
        assert!(cache.entry_origin(Vec3::new(0.5, 1.0, 16.5), listener).is_some());

        // Interval gate
        for i in 0..6 {
            let sound = Vec3::new(8.5, 1.0, 4.0 * i as f32 + 0.5);
            cache.store_if_empty(sound, listener, data(0.0), 200);
        }
        assert_eq!(cache.maintain(500), 0);
    }

    #[test]
    fn test_invalidate_cell() {
        let mut cache = ReverbCache::new(&ReverbCacheConfig::default());
        let listener = Vec3::new(0.5, 1.0, 0.5);
        cache.store_if_empty(Vec3::new(9.0, 1.0, 9.0), listener, data(0.0), 0);
        cache.store_if_empty(Vec3::new(-9.0, 1.0, 9.0), listener, data(0.0), 0);

        assert_eq!(cache.invalidate_cell_at(Vec3::new(10.0, 2.0, 11.0)), 1);
        assert_eq!(cache.len(), 1);
        // Inside the listener cell every entry heard from there goes
        assert_eq!(cache.invalidate_cell_at(Vec3::new(0.2, 1.5, 0.9)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let grid = VoxelGrid::new();
        let config = AcousticsConfig {
            enabled: false,
            ..Default::default()
        };
        let marcher = DdaMarcher::default();
        let eval = OcclusionEvaluator::new(&grid, &marcher, &config);
        let mut cache = ReverbCache::new(&config.reverb_cache);
        let sound = Vec3::new(5.0, 1.0, 5.0);
        let listener = Vec3::new(0.5, 1.0, 0.5);
        cache.store_if_empty(sound, listener, data(0.0), 0);
        assert!(cache.try_get(&eval, sound, listener, 0).is_none());
    }
}
