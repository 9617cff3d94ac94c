//! Grouping of verified openings into a few weighted emitter positions

use crate::config::ClusterConfig;
use crate::enclosure::VerifiedOpening;
use glam::{Vec2, Vec3};

/// A group of nearby openings treated as one sound entry
#[derive(Debug, Clone, PartialEq)]
pub struct OpeningCluster {
    /// Clarity²-weighted mean of the member entry positions
    pub centroid: Vec3,
    pub member_count: usize,
    pub average_occlusion: f32,
    pub average_distance: f32,
    /// Sum of member clarity
    pub total_weight: f32,
    pub member_positions: Vec<Vec3>,
    pub member_entry_positions: Vec<Vec3>,
}

/// Seed position carried over from the previous cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterAnchor {
    pub position: Vec3,
}

impl ClusterAnchor {
    pub fn new(position: Vec3) -> Self {
        Self { position }
    }
}

/// Clarity of an opening: how much sound it lets through, never zero
pub fn clarity(occlusion: f32, min_clarity: f32) -> f32 {
    (1.0 - occlusion.clamp(0.0, 1.0)).max(min_clarity)
}

/// Cluster `openings` into at most `max_clusters` groups.
///
/// Anchors are consumed first so that clusters keep their identity from one
/// cycle to the next. Any remaining budget is filled greedily by clarity over
/// distance.
pub fn cluster_openings(
    openings: &[VerifiedOpening],
    max_clusters: usize,
    anchors: &[ClusterAnchor],
    config: &ClusterConfig,
) -> Vec<OpeningCluster> {
    if openings.is_empty() || max_clusters == 0 {
        return Vec::new();
    }

    let mut consumed = vec![false; openings.len()];
    let mut clusters = Vec::with_capacity(max_clusters.min(openings.len()));

    for anchor in anchors {
        if clusters.len() >= max_clusters {
            break;
        }
        let members = absorb(openings, &mut consumed, anchor.position, config.radius);
        if let Some(cluster) = build_cluster(openings, &members, config.min_clarity) {
            clusters.push(cluster);
        }
    }

    while clusters.len() < max_clusters {
        let seed = openings
            .iter()
            .enumerate()
            .filter(|(i, _)| !consumed[*i])
            .map(|(i, opening)| {
                let score = clarity(opening.occlusion, config.min_clarity)
                    / (1.0 + opening.distance.max(0.0));
                (i, score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let Some((seed_index, _)) = seed else {
            break;
        };

        let center = openings[seed_index].entry_or_world_pos();
        let mut members = absorb(openings, &mut consumed, center, config.radius);
        if members.is_empty() {
            // The seed is always within its own radius; guard against NaN positions
            consumed[seed_index] = true;
            members.push(seed_index);
        }
        if let Some(cluster) = build_cluster(openings, &members, config.min_clarity) {
            clusters.push(cluster);
        }
    }

    clusters.sort_by(|a, b| b.total_weight.total_cmp(&a.total_weight));
    clusters
}

fn absorb(
    openings: &[VerifiedOpening],
    consumed: &mut [bool],
    center: Vec3,
    radius: f32,
) -> Vec<usize> {
    let center = Vec2::new(center.x, center.z);
    let mut members = Vec::new();
    for (i, opening) in openings.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        let pos = opening.entry_or_world_pos();
        if Vec2::new(pos.x, pos.z).distance(center) <= radius {
            consumed[i] = true;
            members.push(i);
        }
    }
    members
}

fn build_cluster(
    openings: &[VerifiedOpening],
    members: &[usize],
    min_clarity: f32,
) -> Option<OpeningCluster> {
    if members.is_empty() {
        return None;
    }

    let mut weighted_sum = Vec3::ZERO;
    let mut weight_sq_total = 0.0f32;
    let mut total_weight = 0.0f32;
    let mut occlusion_sum = 0.0f32;
    let mut distance_sum = 0.0f32;
    let mut member_positions = Vec::with_capacity(members.len());
    let mut member_entry_positions = Vec::with_capacity(members.len());

    for &i in members {
        let opening = &openings[i];
        let entry = opening.entry_or_world_pos();
        let c = clarity(opening.occlusion, min_clarity);
        let c2 = c * c;

        weighted_sum += entry * c2;
        weight_sq_total += c2;
        total_weight += c;
        occlusion_sum += opening.occlusion;
        distance_sum += opening.distance;
        member_positions.push(opening.world_pos);
        member_entry_positions.push(entry);
    }

    let count = members.len() as f32;
    Some(OpeningCluster {
        centroid: weighted_sum / weight_sq_total,
        member_count: members.len(),
        average_occlusion: occlusion_sum / count,
        average_distance: distance_sum / count,
        total_weight,
        member_positions,
        member_entry_positions,
    })
}
