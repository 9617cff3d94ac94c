//! Voxel sound occlusion
//!
//! Occlusion accumulates additively across the cells a ray crosses and
//! saturates at the configured maximum. Partial geometry (fences, doors,
//! foliage) only counts when the ray actually crosses one of its collision
//! volumes, so an open door is passable.

use crate::config::AcousticsConfig;
use crate::raymarch::{segment_hits_aabb, GridMarcher};
use crate::world::{CellInfo, WorldQuery};
use glam::{IVec3, Vec3};
use std::ops::ControlFlow;
use tracing::trace;

/// Rays shorter than this are treated as degenerate
const DEGENERATE_RAY_LENGTH: f32 = 1e-4;

/// Source offsets for the eight voting rays, one per octant
const VOTING_OFFSETS: [Vec3; 8] = [
    Vec3::new(1.0, 1.0, 1.0),
    Vec3::new(1.0, 1.0, -1.0),
    Vec3::new(1.0, -1.0, 1.0),
    Vec3::new(1.0, -1.0, -1.0),
    Vec3::new(-1.0, 1.0, 1.0),
    Vec3::new(-1.0, 1.0, -1.0),
    Vec3::new(-1.0, -1.0, 1.0),
    Vec3::new(-1.0, -1.0, -1.0),
];

/// Result of the weather-aware evaluation
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeatherOcclusion {
    /// Walls, floors, roofs and liquids
    pub structural: f32,
    /// Doors, trapdoors and other things a player can open
    pub interactable: f32,
    /// Center of the air cell after the last structure-to-air transition
    pub entry_point: Option<Vec3>,
}

impl WeatherOcclusion {
    /// Both accumulators together, clamped to `max`
    pub fn combined(&self, max: f32) -> f32 {
        (self.structural + self.interactable).min(max)
    }
}

/// Evaluates occlusion between two points against a voxel world
#[derive(Clone, Copy)]
pub struct OcclusionEvaluator<'a> {
    world: &'a dyn WorldQuery,
    marcher: &'a dyn GridMarcher,
    config: &'a AcousticsConfig,
}

impl<'a> OcclusionEvaluator<'a> {
    pub fn new(
        world: &'a dyn WorldQuery,
        marcher: &'a dyn GridMarcher,
        config: &'a AcousticsConfig,
    ) -> Self {
        Self {
            world,
            marcher,
            config,
        }
    }

    pub fn world(&self) -> &'a dyn WorldQuery {
        self.world
    }

    pub fn marcher(&self) -> &'a dyn GridMarcher {
        self.marcher
    }

    pub fn config(&self) -> &'a AcousticsConfig {
        self.config
    }

    pub fn max_occlusion(&self) -> f32 {
        self.config.occlusion.max_occlusion
    }

    /// Single-ray occlusion from `from` to `to`, skipping the starting cell
    pub fn evaluate(&self, from: Vec3, to: Vec3) -> f32 {
        if !self.config.enabled || from.distance(to) < DEGENERATE_RAY_LENGTH {
            return 0.0;
        }

        let max = self.max_occlusion();
        let mut total = 0.0f32;

        self.marcher.march(from, to, true, &mut |cell| {
            let info = match self.world.cell(cell) {
                Ok(info) => info,
                Err(err) => {
                    trace!(%err, "skipping unavailable cell");
                    return ControlFlow::Continue(());
                }
            };
            total += self.cell_occlusion(cell, &info, from, to);
            if total >= max {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        total.min(max)
    }

    /// Dual-accumulator variant used by the enclosure scan
    ///
    /// Structural occlusion decides whether an opening exists at all;
    /// interactable occlusion only muffles it.
    pub fn evaluate_weather(&self, from: Vec3, to: Vec3) -> WeatherOcclusion {
        let mut result = WeatherOcclusion::default();
        if !self.config.enabled || from.distance(to) < DEGENERATE_RAY_LENGTH {
            return result;
        }

        let max = self.max_occlusion();
        let mut inside_structure = false;

        self.marcher.march(from, to, true, &mut |cell| {
            let info = match self.world.cell(cell) {
                Ok(info) => info,
                Err(err) => {
                    trace!(%err, "skipping unavailable cell");
                    return ControlFlow::Continue(());
                }
            };

            let contribution = self.cell_occlusion(cell, &info, from, to);
            if info.interactable {
                result.interactable = (result.interactable + contribution).min(max);
            } else if contribution > 0.0 {
                result.structural += contribution;
                inside_structure = true;
            } else if inside_structure {
                result.entry_point = Some(cell.as_vec3() + Vec3::splat(0.5));
                inside_structure = false;
            }

            if result.structural >= max {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        result.structural = result.structural.min(max);
        result
    }

    /// Source-to-listener occlusion with convergent multi-ray voting
    ///
    /// Only the ambiguous band between the clear and blocked trust thresholds
    /// pays for the eight extra rays. Every extra ray starts from an offset
    /// source point and converges on the listener.
    pub fn evaluate_voting(&self, source: Vec3, listener: Vec3) -> f32 {
        let cfg = &self.config.occlusion;
        let max = cfg.max_occlusion;

        let center = self.evaluate(source, listener);
        if center >= max {
            return max;
        }
        if center >= cfg.trust_blocked_threshold || center < cfg.trust_clear_threshold {
            return center;
        }

        let mut sum = center;
        let mut rays = 1usize;
        let mut votes = 0usize;
        let mut highest_vote = 0.0f32;

        for offset in VOTING_OFFSETS {
            let occlusion = self.evaluate(source + offset * cfg.variation_distance, listener);
            sum += occlusion;
            rays += 1;

            if occlusion >= cfg.vote_threshold {
                votes += 1;
                highest_vote = highest_vote.max(occlusion);
            }
            if votes >= cfg.votes_required && highest_vote >= max * cfg.vote_early_exit_fraction {
                break;
            }
        }

        trace!(center, votes, rays, "occlusion vote");

        if votes >= cfg.votes_required {
            sum / rays as f32
        } else {
            center
        }
    }

    /// Low-pass filter value for an occlusion amount
    pub fn filter_value(&self, occlusion: f32) -> f32 {
        if !self.config.enabled {
            return 1.0;
        }
        let cfg = &self.config.occlusion;
        (-occlusion.max(0.0) * cfg.absorption_coefficient)
            .exp()
            .max(cfg.min_filter)
    }

    /// Voting occlusion turned straight into a filter value
    pub fn evaluate_filter(&self, source: Vec3, listener: Vec3) -> f32 {
        self.filter_value(self.evaluate_voting(source, listener))
    }

    fn cell_occlusion(&self, cell: IVec3, info: &CellInfo, from: Vec3, to: Vec3) -> f32 {
        if info.is_air {
            return 0.0;
        }
        if info.has_solid_face {
            return info.occlusion.max(0.0);
        }
        if info.is_liquid {
            return self.config.occlusion.liquid_occlusion;
        }

        let origin = cell.as_vec3();
        let blocked = info
            .collision_volumes
            .iter()
            .any(|volume| segment_hits_aabb(from, to, &volume.translated(origin)));
        if blocked {
            info.occlusion.max(0.0)
        } else {
            0.0
        }
    }
}
