//! Blends weighted sound paths into one apparent source

use crate::config::PathConfig;
use crate::occlusion::OcclusionEvaluator;
use glam::Vec3;
use tracing::trace;

/// One way sound reaches the listener
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathEntry {
    /// Unit direction from the listener toward where this path arrives from
    pub direction: Vec3,
    /// Total length travelled along the path
    pub total_distance: f32,
    pub weight: f32,
    pub occlusion: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PathDiagnostics {
    pub path_count: usize,
    pub total_weight: f32,
    /// Length of the weight-normalized direction sum, 1 when all paths agree
    pub coherence: f32,
    pub weighted_mean_occlusion: f32,
    pub min_occlusion: f32,
    pub max_occlusion: f32,
    pub mean_path_length: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPath {
    pub apparent_position: Vec3,
    pub blended_occlusion: f32,
    pub diagnostics: PathDiagnostics,
}

/// Collects paths for a single sound evaluation
#[derive(Debug, Clone, Default)]
pub struct SoundPathResolver {
    paths: Vec<PathEntry>,
}

impl SoundPathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> &[PathEntry] {
        &self.paths
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }

    /// Add a path contribution. Zero directions and non-positive weights are ignored.
    pub fn add_path(&mut self, direction: Vec3, total_distance: f32, weight: f32, occlusion: f32) {
        let direction = direction.normalize_or_zero();
        if direction == Vec3::ZERO || !weight.is_finite() || weight <= 0.0 {
            trace!(?direction, weight, "Ignoring degenerate sound path");
            return;
        }
        self.paths.push(PathEntry {
            direction,
            total_distance: total_distance.max(0.0),
            weight,
            occlusion: occlusion.max(0.0),
        });
    }

    /// Resolve and clear the collected paths.
    ///
    /// Returns `None` when there are no paths or their directions cancel out.
    pub fn resolve(
        &mut self,
        source: Vec3,
        listener: Vec3,
        config: &PathConfig,
    ) -> Option<ResolvedPath> {
        let paths = std::mem::take(&mut self.paths);
        if paths.is_empty() {
            return None;
        }

        let total_weight: f32 = paths.iter().map(|p| p.weight).sum();
        let direction_sum: Vec3 = paths.iter().map(|p| p.direction * p.weight).sum();
        let coherence = direction_sum.length() / total_weight;
        if coherence < config.cancellation_epsilon {
            trace!(paths = paths.len(), coherence, "Sound paths cancel out");
            return None;
        }

        let apparent_direction = direction_sum / direction_sum.length();
        let apparent_position = listener + apparent_direction * source.distance(listener);

        let mut by_occlusion = paths.clone();
        by_occlusion.sort_by(|a, b| a.occlusion.total_cmp(&b.occlusion));
        let target = total_weight * config.blend_percentile.clamp(0.0, 1.0);
        let mut accumulated = 0.0f32;
        let mut blended_occlusion = by_occlusion[by_occlusion.len() - 1].occlusion;
        for path in &by_occlusion {
            accumulated += path.weight;
            if accumulated >= target {
                blended_occlusion = path.occlusion;
                break;
            }
        }

        let count = paths.len() as f32;
        let diagnostics = PathDiagnostics {
            path_count: paths.len(),
            total_weight,
            coherence,
            weighted_mean_occlusion: paths.iter().map(|p| p.occlusion * p.weight).sum::<f32>()
                / total_weight,
            min_occlusion: by_occlusion[0].occlusion,
            max_occlusion: by_occlusion[by_occlusion.len() - 1].occlusion,
            mean_path_length: paths.iter().map(|p| p.total_distance).sum::<f32>() / count,
        };

        Some(ResolvedPath {
            apparent_position,
            blended_occlusion,
            diagnostics,
        })
    }

    /// Resolve and turn the blended occlusion into a filter value
    pub fn resolve_filter(
        &mut self,
        evaluator: &OcclusionEvaluator,
        source: Vec3,
        listener: Vec3,
    ) -> Option<(Vec3, f32)> {
        let resolved = self.resolve(source, listener, &evaluator.config().paths)?;
        Some((
            resolved.apparent_position,
            evaluator.filter_value(resolved.blended_occlusion),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_path_at_listener() {
        let mut resolver = SoundPathResolver::new();
        let listener = Vec3::new(3.0, 64.0, -2.0);
        resolver.add_path(Vec3::X, 0.0, 1.0, 0.0);
        let resolved = resolver.resolve(listener, listener, &PathConfig::default()).unwrap();
        assert_eq!(resolved.apparent_position, listener);
        assert!(resolver.paths().is_empty());
    }

    #[test]
    fn test_opposite_paths_cancel() {
        let mut resolver = SoundPathResolver::new();
        resolver.add_path(Vec3::X, 5.0, 1.0, 0.0);
        resolver.add_path(-Vec3::X, 5.0, 1.0, 0.0);
        assert!(resolver
            .resolve(Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO, &PathConfig::default())
            .is_none());
        assert!(resolver.paths().is_empty());
    }

    #[test]
    fn test_apparent_direction_keeps_source_distance() {
        let mut resolver = SoundPathResolver::new();
        resolver.add_path(Vec3::new(0.0, 0.0, 2.0), 12.0, 1.0, 0.5);
        let source = Vec3::new(10.0, 0.0, 0.0);
        let resolved = resolver.resolve(source, Vec3::ZERO, &PathConfig::default()).unwrap();
        // Heard from +Z at the real source distance
        assert!((resolved.apparent_position - Vec3::new(0.0, 0.0, 10.0)).length() < 1e-4);
    }

    #[test]
    fn test_blend_uses_best_quarter_not_mean() {
        let mut resolver = SoundPathResolver::new();
        // A strong clear path and a swarm of weak through-wall paths
        resolver.add_path(Vec3::X, 8.0, 1.0, 0.0);
        for _ in 0..9 {
            resolver.add_path(Vec3::new(1.0, 0.0, 0.2), 10.0, 0.5, 3.0);
        }
        let resolved = resolver
            .resolve(Vec3::new(8.0, 0.0, 0.0), Vec3::ZERO, &PathConfig::default())
            .unwrap();
        // Total weight 5.5; the 25th percentile lands inside the weak paths
        assert_eq!(resolved.blended_occlusion, 3.0);

        let mut resolver = SoundPathResolver::new();
        resolver.add_path(Vec3::X, 8.0, 3.0, 0.0);
        for _ in 0..9 {
            resolver.add_path(Vec3::new(1.0, 0.0, 0.2), 10.0, 0.5, 3.0);
        }
        let resolved = resolver
            .resolve(Vec3::new(8.0, 0.0, 0.0), Vec3::ZERO, &PathConfig::default())
            .unwrap();
        assert_eq!(resolved.blended_occlusion, 0.0);
        assert!(resolved.diagnostics.weighted_mean_occlusion > 1.0);
        assert_eq!(resolved.diagnostics.path_count, 10);
        assert_eq!(resolved.diagnostics.max_occlusion, 3.0);
    }

    #[test]
    fn test_degenerate_paths_are_ignored() {
        let mut resolver = SoundPathResolver::new();
        resolver.add_path(Vec3::ZERO, 1.0, 1.0, 0.0);
        resolver.add_path(Vec3::Y, 1.0, 0.0, 0.0);
        resolver.add_path(Vec3::Y, 1.0, f32::NAN, 0.0);
        assert!(resolver.paths().is_empty());
        assert!(resolver.resolve(Vec3::ONE, Vec3::ZERO, &PathConfig::default()).is_none());
    }
}
