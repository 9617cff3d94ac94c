//! Enclosure scan: how much of the sky is blocked around the listener and
//! where outdoor ambience can still get in
//!
//! One scan runs per interval and goes through these stages:
//! 1. heightmap sampling over a Gaussian-weighted diamond of columns
//! 2. outdoor early exit
//! 3. DDA verification of the nearest exposed columns, with join/leave hysteresis
//! 4. neighbor search around near misses when nothing verified
//! 5. directional cave-exit probes when the listener is meaningfully enclosed
//! 6. merge into the per-column cache with a grace period for misses
//! 7. clamp heightmap coverage with the raw DDA occlusion

use crate::config::EnclosureConfig;
use crate::occlusion::{OcclusionEvaluator, WeatherOcclusion};
use glam::{IVec3, Vec2, Vec3};
use std::collections::{HashMap, HashSet};
use std::f32::consts::TAU;
use std::ops::ControlFlow;
use tracing::{debug, trace};

/// Columns searched around each near-miss suspect
const NEIGHBOR_PATTERN: [(i32, i32); 12] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
    (2, 0),
    (-2, 0),
    (0, 2),
    (0, -2),
];

/// A column through which outdoor sound verifiably reaches the listener
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedOpening {
    /// Point above the rain impact that had the best path to the listener
    pub world_pos: Vec3,
    /// Last solid-to-air transition on the way to the listener, `None` for clear sky
    pub entry_pos: Option<Vec3>,
    /// Structural plus interactable occlusion of the best path
    pub occlusion: f32,
    /// Distance from the listener at the last scan
    pub distance: f32,
    pub column_x: i32,
    pub column_z: i32,
}

impl VerifiedOpening {
    pub fn column(&self) -> (i32, i32) {
        (self.column_x, self.column_z)
    }

    /// Where sound enters the listener's space
    pub fn entry_or_world_pos(&self) -> Vec3 {
        self.entry_pos.unwrap_or(self.world_pos)
    }
}

/// Cache state of a single column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnState {
    /// Never verified, or evicted
    Absent,
    /// Verified by the last scan
    Verified,
    /// Missed by the given number of consecutive scans
    Stale(u32),
}

/// Counters for the most recent scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStats {
    pub samples: usize,
    pub candidates: usize,
    pub verify_budget: usize,
    pub rays_cast: usize,
    pub fresh_verified: usize,
    pub neighbor_hits: usize,
    pub cave_hits: usize,
    pub cached_columns: usize,
    pub early_exit: bool,
}

#[derive(Debug, Clone, Copy)]
struct SampleOffset {
    dx: i32,
    dz: i32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct CachedColumn {
    opening: VerifiedOpening,
    fail_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    column_x: i32,
    column_z: i32,
    rain_height: i32,
    distance: f32,
    weight: f32,
}

#[derive(Debug, Clone, Copy)]
struct ColumnProbe {
    point: Vec3,
    occlusion: WeatherOcclusion,
}

/// Per-listener enclosure estimator
#[derive(Debug, Clone)]
pub struct EnclosureScanner {
    offsets: Vec<SampleOffset>,
    sample_sigma: f32,
    column_cache: HashMap<(i32, i32), CachedColumn>,
    verified: Vec<VerifiedOpening>,
    heightmap_coverage: f32,
    sky_coverage: f32,
    raw_occlusion: f32,
    occlusion_factor: f32,
    smoothed_sky_coverage: f32,
    smoothed_occlusion_factor: f32,
    last_scan_ms: Option<u64>,
    stats: ScanStats,
}

impl EnclosureScanner {
    /// Create a scanner, precomputing the sampling diamond from `config`
    pub fn new(config: &EnclosureConfig) -> Self {
        let radius = config.scan_radius.max(0);
        let sigma = config.sample_sigma.max(0.1);
        let mut offsets = Vec::new();
        for dx in -radius..=radius {
            let span = radius - dx.abs();
            for dz in -span..=span {
                offsets.push(SampleOffset {
                    dx,
                    dz,
                    weight: gaussian_weight(Vec2::new(dx as f32, dz as f32).length(), sigma),
                });
            }
        }

        Self {
            offsets,
            sample_sigma: sigma,
            column_cache: HashMap::new(),
            verified: Vec::new(),
            heightmap_coverage: 0.0,
            sky_coverage: 0.0,
            raw_occlusion: 0.0,
            occlusion_factor: 0.0,
            smoothed_sky_coverage: 0.0,
            smoothed_occlusion_factor: 0.0,
            last_scan_ms: None,
            stats: ScanStats::default(),
        }
    }

    /// Fraction of sampled overhead columns blocked, after DDA correction
    pub fn sky_coverage(&self) -> f32 {
        self.sky_coverage
    }

    /// Coverage straight from the heightmap, before any correction
    pub fn heightmap_coverage(&self) -> f32 {
        self.heightmap_coverage
    }

    /// `1 - verifiedWeight / exposedWeight` from the last scan
    pub fn raw_occlusion(&self) -> f32 {
        self.raw_occlusion
    }

    pub fn occlusion_factor(&self) -> f32 {
        self.occlusion_factor
    }

    pub fn smoothed_sky_coverage(&self) -> f32 {
        self.smoothed_sky_coverage
    }

    pub fn smoothed_occlusion_factor(&self) -> f32 {
        self.smoothed_occlusion_factor
    }

    /// Verified and still-in-grace openings, nearest first
    pub fn verified_openings(&self) -> &[VerifiedOpening] {
        &self.verified
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn sample_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn column_state(&self, x: i32, z: i32) -> ColumnState {
        match self.column_cache.get(&(x, z)) {
            None => ColumnState::Absent,
            Some(entry) if entry.fail_count == 0 => ColumnState::Verified,
            Some(entry) => ColumnState::Stale(entry.fail_count),
        }
    }

    /// Drop all state, as if the listener just arrived
    pub fn reset(&mut self) {
        self.column_cache.clear();
        self.verified.clear();
        self.heightmap_coverage = 0.0;
        self.sky_coverage = 0.0;
        self.raw_occlusion = 0.0;
        self.occlusion_factor = 0.0;
        self.smoothed_sky_coverage = 0.0;
        self.smoothed_occlusion_factor = 0.0;
        self.last_scan_ms = None;
        self.stats = ScanStats::default();
    }

    /// Run a scan if the interval has elapsed. Returns whether a scan ran.
    pub fn update(&mut self, evaluator: &OcclusionEvaluator, listener: Vec3, now_ms: u64) -> bool {
        if !evaluator.config().enabled {
            if self.last_scan_ms.is_some() || !self.verified.is_empty() {
                self.reset();
            }
            return false;
        }

        let config = &evaluator.config().enclosure;
        if let Some(last) = self.last_scan_ms {
            if now_ms >= last && now_ms - last < config.scan_interval_ms {
                return false;
            }
        }

        let first_scan = self.last_scan_ms.is_none();
        self.last_scan_ms = Some(now_ms);
        self.scan(evaluator, config, listener);
        self.smooth(config, first_scan);

        debug!(
            listener = ?listener,
            coverage = self.sky_coverage,
            heightmap = self.heightmap_coverage,
            occlusion = self.occlusion_factor,
            openings = self.verified.len(),
            "Enclosure scan"
        );
        true
    }

    fn scan(&mut self, evaluator: &OcclusionEvaluator, config: &EnclosureConfig, listener: Vec3) {
        let world = evaluator.world();
        let listener_cell = listener.floor().as_ivec3();
        let mut stats = ScanStats::default();

        // 1. Sky coverage from the heightmap
        let mut total_weight = 0.0f32;
        let mut covered_weight = 0.0f32;
        let mut listener_exposed = false;
        let mut candidates = Vec::new();

        for offset in &self.offsets {
            let column_x = listener_cell.x + offset.dx;
            let column_z = listener_cell.z + offset.dz;
            let rain_height = match world.rain_height(column_x, column_z) {
                Ok(height) => height,
                Err(err) => {
                    trace!(%err, "skipping unloaded sample column");
                    continue;
                }
            };

            stats.samples += 1;
            total_weight += offset.weight;

            if listener.y < rain_height as f32 {
                covered_weight += offset.weight;
                continue;
            }
            if offset.dx == 0 && offset.dz == 0 {
                listener_exposed = true;
            }
            if listener.y - rain_height as f32 <= config.max_vertical_difference {
                candidates.push(Candidate {
                    column_x,
                    column_z,
                    rain_height,
                    distance: horizontal_distance(column_center(column_x, column_z, 0.0), listener),
                    weight: offset.weight,
                });
            }
        }

        let coverage = if total_weight > 0.0 {
            covered_weight / total_weight
        } else {
            0.0
        };
        self.heightmap_coverage = coverage;
        stats.candidates = candidates.len();

        // 2. Nothing exposed and little overhead: plainly outdoors
        if candidates.is_empty() && coverage < config.outdoor_coverage_threshold {
            self.sky_coverage = coverage;
            self.raw_occlusion = 0.0;
            self.occlusion_factor = 0.0;
            self.column_cache.clear();
            self.verified.clear();
            stats.early_exit = true;
            self.stats = stats;
            return;
        }

        // 3. DDA verification of the nearest candidates
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        let budget_span = config.max_verify_budget.saturating_sub(config.min_verify_budget);
        let budget = config.min_verify_budget + (budget_span as f32 * coverage).round() as usize;
        stats.verify_budget = budget;

        let mut fresh: HashMap<(i32, i32), VerifiedOpening> = HashMap::new();
        let mut tested: HashSet<(i32, i32)> = HashSet::new();
        let mut suspects: Vec<(Candidate, f32)> = Vec::new();

        for candidate in candidates.iter().take(budget) {
            let key = (candidate.column_x, candidate.column_z);
            tested.insert(key);

            let probe = self.probe_candidate(evaluator, config, candidate, listener, &mut stats);
            let Some(probe) = probe else {
                continue;
            };

            let threshold = if self.column_cache.contains_key(&key) {
                config.leave_threshold
            } else {
                config.join_threshold
            };

            if probe.occlusion.structural <= threshold {
                fresh.insert(key, make_opening(evaluator, key, probe, listener));
            } else if probe.occlusion.structural < config.partial_threshold {
                suspects.push((*candidate, probe.occlusion.structural));
            }
        }

        // 4. Neighbor search around the most promising near misses
        if fresh.is_empty() && !suspects.is_empty() {
            suspects.sort_by(|a, b| a.1.total_cmp(&b.1));
            let heights_len = config.neighbor_ladder_len.min(config.height_ladder.len());
            let heights = &config.height_ladder[..heights_len];

            for (suspect, _) in suspects.iter().take(config.max_neighbor_suspects) {
                for (dx, dz) in NEIGHBOR_PATTERN {
                    let key = (suspect.column_x + dx, suspect.column_z + dz);
                    if !tested.insert(key) {
                        continue;
                    }
                    let rain_height = match world.rain_height(key.0, key.1) {
                        Ok(height) => height,
                        Err(_) => continue,
                    };
                    if listener.y < rain_height as f32 {
                        continue;
                    }

                    let probe = self.probe_ladder(
                        evaluator,
                        key,
                        rain_height,
                        heights,
                        listener,
                        &mut stats,
                    );
                    if let Some(probe) = probe {
                        if probe.occlusion.structural <= config.occluded_threshold {
                            fresh.insert(key, make_opening(evaluator, key, probe, listener));
                            stats.neighbor_hits += 1;
                        }
                    }
                }
            }
        }

        // 5. Cave exits
        if coverage > config.cave_probe_coverage {
            self.probe_cave_exits(evaluator, config, listener, &mut fresh, &mut stats);
        }

        // 6. Merge into the column cache
        stats.fresh_verified = fresh.len();
        for (key, entry) in self.column_cache.iter_mut() {
            if !fresh.contains_key(key) {
                entry.fail_count += 1;
            }
        }
        for (key, opening) in fresh {
            self.column_cache.insert(
                key,
                CachedColumn {
                    opening,
                    fail_count: 0,
                },
            );
        }

        let prune_distance = config.scan_radius as f32 + config.prune_margin;
        self.column_cache.retain(|_, entry| {
            entry.fail_count <= config.grace_misses
                && horizontal_distance(entry.opening.world_pos, listener) <= prune_distance
        });

        self.verified = self
            .column_cache
            .values_mut()
            .map(|entry| {
                entry.opening.distance = entry.opening.world_pos.distance(listener);
                entry.opening.clone()
            })
            .collect();
        self.verified.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        stats.cached_columns = self.column_cache.len();

        // 7. Bound coverage by the DDA result, relative to what was actually tested
        let exposed_weight: f32 = candidates.iter().take(budget).map(|c| c.weight).sum();
        let verified_weight: f32 = self
            .verified
            .iter()
            .map(|opening| {
                let offset = Vec2::new(
                    (opening.column_x - listener_cell.x) as f32,
                    (opening.column_z - listener_cell.z) as f32,
                );
                gaussian_weight(offset.length(), self.sample_sigma)
            })
            .sum();

        let raw_occlusion = if exposed_weight > 0.0 {
            (1.0 - verified_weight / exposed_weight).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let mut bounded = coverage.max(raw_occlusion * config.coverage_floor_scale);
        if listener_exposed {
            bounded = bounded.min(raw_occlusion + config.coverage_ceiling_margin);
        }
        let bounded = bounded.clamp(0.0, 1.0);

        self.sky_coverage = bounded;
        self.raw_occlusion = raw_occlusion;
        self.occlusion_factor = raw_occlusion.max(bounded * bounded);
        self.stats = stats;
    }

    /// Best path from a candidate column, choosing the ray set by geometry
    fn probe_candidate(
        &self,
        evaluator: &OcclusionEvaluator,
        config: &EnclosureConfig,
        candidate: &Candidate,
        listener: Vec3,
        stats: &mut ScanStats,
    ) -> Option<ColumnProbe> {
        let key = (candidate.column_x, candidate.column_z);
        let gap = listener.y - candidate.rain_height as f32;

        if gap > config.body_height {
            // Multi-story gap: steep rays would cut through our own floor
            let feet = listener.y - config.eye_height;
            let levels = [listener.y, feet + 0.25];
            let mut best: Option<ColumnProbe> = None;
            for y in levels {
                let point = column_center(key.0, key.1, y);
                let occlusion = evaluator.evaluate_weather(point, listener);
                stats.rays_cast += 1;
                if best.map_or(true, |b| occlusion.structural < b.occlusion.structural) {
                    best = Some(ColumnProbe { point, occlusion });
                }
            }
            best
        } else {
            self.probe_ladder(
                evaluator,
                key,
                candidate.rain_height,
                &config.height_ladder,
                listener,
                stats,
            )
        }
    }

    /// Minimum-occlusion rung of the height ladder above the rain impact
    fn probe_ladder(
        &self,
        evaluator: &OcclusionEvaluator,
        key: (i32, i32),
        rain_height: i32,
        heights: &[f32],
        listener: Vec3,
        stats: &mut ScanStats,
    ) -> Option<ColumnProbe> {
        let mut best: Option<ColumnProbe> = None;
        for &offset in heights {
            let point = column_center(key.0, key.1, rain_height as f32 + offset);
            let occlusion = evaluator.evaluate_weather(point, listener);
            stats.rays_cast += 1;
            if best.map_or(true, |b| occlusion.structural < b.occlusion.structural) {
                best = Some(ColumnProbe { point, occlusion });
            }
            if occlusion.structural <= 0.0 {
                break;
            }
        }
        best
    }

    fn probe_cave_exits(
        &self,
        evaluator: &OcclusionEvaluator,
        config: &EnclosureConfig,
        listener: Vec3,
        fresh: &mut HashMap<(i32, i32), VerifiedOpening>,
        stats: &mut ScanStats,
    ) {
        let directions = config.cave_directions.max(1);
        // Anything further out would be pruned from the column cache right away
        let reach = config
            .cave_probe_distance
            .min(config.scan_radius as f32 + config.prune_margin);

        for i in 0..directions {
            let yaw = TAU * i as f32 / directions as f32;
            for &elevation_deg in &config.cave_elevations_deg {
                let elevation = elevation_deg.to_radians();
                let direction = Vec3::new(
                    yaw.cos() * elevation.cos(),
                    elevation.sin(),
                    yaw.sin() * elevation.cos(),
                );
                stats.rays_cast += 1;

                let target = listener + direction * reach;
                let Some(exit) = first_sky_exposed_cell(evaluator, listener, target) else {
                    continue;
                };
                let key = (exit.x, exit.z);
                if fresh.contains_key(&key) {
                    break;
                }

                let point = exit.as_vec3() + Vec3::splat(0.5);
                let occlusion = evaluator.evaluate_weather(point, listener);
                stats.rays_cast += 1;
                if occlusion.structural <= config.occluded_threshold {
                    trace!(?exit, "cave exit found");
                    let probe = ColumnProbe { point, occlusion };
                    fresh.insert(key, make_opening(evaluator, key, probe, listener));
                    stats.cave_hits += 1;
                    break;
                }
            }
        }
    }

    fn smooth(&mut self, config: &EnclosureConfig, first_scan: bool) {
        if first_scan {
            self.smoothed_sky_coverage = self.sky_coverage;
            self.smoothed_occlusion_factor = self.occlusion_factor;
            return;
        }
        let rate = config.smoothing_rate.clamp(0.0, 1.0);
        self.smoothed_sky_coverage += (self.sky_coverage - self.smoothed_sky_coverage) * rate;
        self.smoothed_occlusion_factor +=
            (self.occlusion_factor - self.smoothed_occlusion_factor) * rate;
    }
}

/// Walk outward through open cells and stop at the first one under open sky
fn first_sky_exposed_cell(evaluator: &OcclusionEvaluator, from: Vec3, to: Vec3) -> Option<IVec3> {
    let world = evaluator.world();
    let mut exit = None;
    evaluator.marcher().march(from, to, true, &mut |cell| match world.cell(cell) {
        Ok(info) if !info.is_solid() => match world.rain_height(cell.x, cell.z) {
            Ok(height) if cell.y >= height => {
                exit = Some(cell);
                ControlFlow::Break(())
            }
            Ok(_) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        },
        _ => ControlFlow::Break(()),
    });
    exit
}

fn make_opening(
    evaluator: &OcclusionEvaluator,
    key: (i32, i32),
    probe: ColumnProbe,
    listener: Vec3,
) -> VerifiedOpening {
    VerifiedOpening {
        world_pos: probe.point,
        entry_pos: probe.occlusion.entry_point,
        occlusion: probe.occlusion.combined(evaluator.max_occlusion()),
        distance: probe.point.distance(listener),
        column_x: key.0,
        column_z: key.1,
    }
}

fn gaussian_weight(distance: f32, sigma: f32) -> f32 {
    (-(distance * distance) / (2.0 * sigma * sigma)).exp()
}

fn column_center(x: i32, z: i32, y: f32) -> Vec3 {
    Vec3::new(x as f32 + 0.5, y, z as f32 + 0.5)
}

pub(crate) fn horizontal_distance(a: Vec3, b: Vec3) -> f32 {
    Vec2::new(a.x - b.x, a.z - b.z).length()
}
