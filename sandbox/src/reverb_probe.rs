//! Reverb tracing for a single sound, routed through the reverb cache and path resolver

use acoustics::reverb_cache::{BouncePoint, OpeningProbe};
use acoustics::{AcousticsState, OcclusionEvaluator, ReverbData};
use glam::{IVec3, Vec3};
use std::f32::consts::TAU;
use std::ops::ControlFlow;
use tracing::trace;

const NUM_RAYS: usize = 16;
const NUM_VERTICAL: usize = 3;
/// Longest distance a reverb ray travels before it counts as escaped
const MAX_RANGE: f32 = 24.0;

#[derive(Debug, Clone, Copy)]
pub struct HeardSound {
    pub apparent_position: Vec3,
    pub filter: f32,
    pub from_cache: bool,
}

/// Resolve where `sound` appears to come from and how muffled it is
pub fn hear(
    state: &mut AcousticsState,
    evaluator: &OcclusionEvaluator,
    sound: Vec3,
    listener: Vec3,
    now_ms: u64,
) -> Option<HeardSound> {
    let cached = state
        .reverb_cache
        .try_get(evaluator, sound, listener, now_ms)
        .cloned();
    let from_cache = cached.is_some();
    let data = match cached {
        Some(data) => data,
        None => {
            let data = trace_reverb(evaluator, sound, listener);
            state
                .reverb_cache
                .store_if_empty(sound, listener, data.clone(), now_ms);
            data
        }
    };

    let resolver = &mut state.resolver;
    resolver.add_path(
        sound - listener,
        sound.distance(listener),
        1.0,
        data.direct_occlusion,
    );
    for bounce in &data.bounce_points {
        let distance = bounce.distance + bounce.position.distance(listener);
        resolver.add_path(
            bounce.position - listener,
            distance,
            0.5 / (1.0 + distance * 0.1),
            bounce.occlusion,
        );
    }
    for probe in &data.opening_probes {
        resolver.add_path(
            probe.position - listener,
            probe.distance,
            0.3 / (1.0 + probe.distance * 0.1),
            probe.occlusion,
        );
    }

    let (apparent_position, filter) = resolver.resolve_filter(evaluator, sound, listener)?;
    Some(HeardSound {
        apparent_position,
        filter,
        from_cache,
    })
}

/// Cast a ring of rays from the sound and record where they bounce or escape
pub fn trace_reverb(evaluator: &OcclusionEvaluator, sound: Vec3, listener: Vec3) -> ReverbData {
    let world = evaluator.world();
    let mut bounce_points = Vec::new();
    let mut opening_probes = Vec::new();

    for v in 0..NUM_VERTICAL {
        let vertical_angle = (v as f32 / (NUM_VERTICAL - 1) as f32 - 0.5) * 0.5;
        let y_component = vertical_angle.sin();
        let horizontal_scale = vertical_angle.cos();

        for i in 0..NUM_RAYS {
            let angle = (i as f32 / NUM_RAYS as f32) * TAU;
            let dir = Vec3::new(
                angle.cos() * horizontal_scale,
                y_component,
                angle.sin() * horizontal_scale,
            )
            .normalize();
            let target = sound + dir * MAX_RANGE;

            let mut previous = sound.floor().as_ivec3();
            let mut hit: Option<(IVec3, IVec3)> = None;
            evaluator.marcher().march(sound, target, true, &mut |cell| {
                match world.cell(cell) {
                    Ok(info) if info.is_solid() => {
                        hit = Some((cell, previous));
                        return ControlFlow::Break(());
                    }
                    _ => {}
                }
                previous = cell;
                ControlFlow::Continue(())
            });

            match hit {
                Some((cell, open_cell)) => {
                    let position = open_cell.as_vec3() + Vec3::splat(0.5);
                    bounce_points.push(BouncePoint {
                        position,
                        normal: (open_cell - cell).as_vec3(),
                        distance: sound.distance(position),
                        occlusion: evaluator.evaluate(position, listener),
                    });
                }
                None => opening_probes.push(OpeningProbe {
                    position: target,
                    occlusion: evaluator.evaluate(target, listener),
                    distance: MAX_RANGE + target.distance(listener),
                }),
            }
        }
    }

    let clear_threshold = evaluator.config().occlusion.trust_clear_threshold;
    let shared_airspace_ratio = if bounce_points.is_empty() {
        0.0
    } else {
        bounce_points
            .iter()
            .filter(|b| b.occlusion < clear_threshold)
            .count() as f32
            / bounce_points.len() as f32
    };

    trace!(
        bounces = bounce_points.len(),
        escapes = opening_probes.len(),
        shared_airspace_ratio,
        "Traced reverb"
    );

    ReverbData {
        bounce_points,
        opening_probes,
        shared_airspace_ratio,
        direct_occlusion: evaluator.evaluate_voting(sound, listener),
    }
}
