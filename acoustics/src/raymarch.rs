//! Grid traversal and ray-box intersection for sound rays
//!
//! [`GridMarcher`] is the capability the occlusion code is written against.
//! [`DdaMarcher`] is a straightforward Amanatides-Woo implementation over unit
//! cells; embedders with their own traversal can plug that in instead.

use crate::world::Aabb;
use glam::{IVec3, Vec3};
use std::ops::ControlFlow;

/// Walks the cells crossed by a segment, calling a visitor per cell
pub trait GridMarcher {
    /// March from `from` to `to`, visiting each traversed cell once and in order.
    ///
    /// When `skip_first` is set the cell containing `from` is not visited.
    /// Returns `true` when the visitor stopped the walk early.
    fn march(
        &self,
        from: Vec3,
        to: Vec3,
        skip_first: bool,
        visitor: &mut dyn FnMut(IVec3) -> ControlFlow<()>,
    ) -> bool;
}

/// Amanatides-Woo traversal over unit cells
#[derive(Debug, Clone, Copy)]
pub struct DdaMarcher {
    /// Hard cap on visited cells per ray
    pub max_steps: usize,
}

impl Default for DdaMarcher {
    fn default() -> Self {
        Self { max_steps: 512 }
    }
}

impl GridMarcher for DdaMarcher {
    fn march(
        &self,
        from: Vec3,
        to: Vec3,
        skip_first: bool,
        visitor: &mut dyn FnMut(IVec3) -> ControlFlow<()>,
    ) -> bool {
        let mut cell = from.floor().as_ivec3();
        let end = to.floor().as_ivec3();

        if !skip_first && visitor(cell).is_break() {
            return true;
        }

        let delta = to - from;
        let length = delta.length();
        if length <= f32::EPSILON || cell == end {
            return false;
        }
        let dir = delta / length;

        let mut step = IVec3::ZERO;
        let mut t_max = Vec3::splat(f32::INFINITY);
        let mut t_delta = Vec3::splat(f32::INFINITY);

        for axis in 0..3 {
            let d = dir[axis];
            if d > 1e-8 {
                step[axis] = 1;
                t_max[axis] = (cell[axis] as f32 + 1.0 - from[axis]) / d;
                t_delta[axis] = 1.0 / d;
            } else if d < -1e-8 {
                step[axis] = -1;
                t_max[axis] = (cell[axis] as f32 - from[axis]) / d;
                t_delta[axis] = -1.0 / d;
            }
        }

        for _ in 0..self.max_steps {
            let mut axis = 0usize;
            for candidate in 1..3 {
                if t_max[candidate] < t_max[axis] {
                    axis = candidate;
                }
            }

            let traversed_t = t_max[axis];
            if !traversed_t.is_finite() || traversed_t > length {
                break;
            }

            cell[axis] += step[axis];
            t_max[axis] += t_delta[axis];

            if visitor(cell).is_break() {
                return true;
            }
            if cell == end {
                break;
            }
        }

        false
    }
}

/// Ray-AABB slab test
///
/// Returns the distance to the entry point if the ray hits the box within
/// `max_distance`. `direction` must be normalized.
pub fn ray_aabb_intersection(
    origin: Vec3,
    direction: Vec3,
    aabb: &Aabb,
    max_distance: f32,
) -> Option<f32> {
    // Handle division by zero for ray direction components
    let inv = |d: f32| {
        if d.abs() < f32::EPSILON {
            f32::INFINITY
        } else {
            1.0 / d
        }
    };
    let inv_dir = Vec3::new(inv(direction.x), inv(direction.y), inv(direction.z));

    let t1 = (aabb.min - origin) * inv_dir;
    let t2 = (aabb.max - origin) * inv_dir;

    let tmin = t1.min(t2);
    let tmax = t1.max(t2);

    let tmin = tmin.x.max(tmin.y).max(tmin.z).max(0.0);
    let tmax = tmax.x.min(tmax.y).min(tmax.z).min(max_distance);

    if tmin <= tmax {
        Some(tmin)
    } else {
        None
    }
}

/// Whether the segment `from -> to` passes through `aabb`
pub fn segment_hits_aabb(from: Vec3, to: Vec3, aabb: &Aabb) -> bool {
    let delta = to - from;
    let length = delta.length();
    if length <= f32::EPSILON {
        return from.cmpge(aabb.min).all() && from.cmple(aabb.max).all();
    }
    ray_aabb_intersection(from, delta / length, aabb, length).is_some()
}
