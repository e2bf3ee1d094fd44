//! Coarse-to-fine point-to-plane ICP.
//!
//! Each stage downsamples both clouds, estimates target normals, then
//! alternates nearest-neighbor correspondence search with a linearized
//! point-to-plane fit. The source is binned on the voxel grid after being
//! placed by the current estimate, so both clouds share one lattice. The
//! point-to-plane error ignores sliding along flat surfaces, which keeps
//! regularly sampled ground from pinning the estimate to the grid spacing.
//!
//! The transform with the lowest residual seen in a stage seeds the next one.
//! Once all stages ran, the result is compared against the initial guess at
//! the finest stage and the better of the two is returned, so the returned
//! residual never exceeds the residual of the guess.

use crate::alignment::rigid::fit_point_to_plane;
use crate::calibration::RigidTransform;
use crate::cloud::{estimate_normals, voxel_downsample};
use crate::config::{AlignmentConfig, IcpStage};
use glam::Vec3;
use rowscan_data::Point;
use rstar::RTree;
use rstar::primitives::PointWithData;
use tracing::{debug, trace};

type IndexedPoint = PointWithData<usize, [f32; 3]>;

/// Upper bound on the neighbors used for each target normal.
const NORMAL_NEIGHBORS: usize = 30;

/// Why a registration was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IcpError {
    #[error("{found} correspondences, need {required}")]
    InsufficientOverlap { found: usize, required: usize },
    #[error("residual {residual:.3} grew beyond {initial:.3}")]
    Diverged { residual: f64, initial: f64 },
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct IcpResult {
    /// Maps source points onto the target.
    pub transform: RigidTransform,
    /// Fraction of source points with a correspondence at the finest stage.
    pub fitness: f64,
    /// RMSE of those correspondences (millimeters, point to point).
    pub inlier_rmse: f64,
    pub correspondences: usize,
    /// Iterations run across all stages.
    pub iterations: usize,
    /// Truncated point-to-plane error of the initial guess at the finest stage.
    pub initial_residual: f64,
    /// Same measure for the returned transform.
    pub final_residual: f64,
}

/// Quality of a transform against one stage's clouds.
#[derive(Debug, Clone, Copy)]
struct Evaluation {
    fitness: f64,
    inlier_rmse: f64,
    inliers: usize,
    /// Mean over all source points of the squared point-to-plane distance,
    /// or max² for points without a correspondence.
    residual: f64,
}

/// Corresponding points, the source already placed in the target frame.
#[derive(Default)]
struct Matches {
    placed: Vec<Vec3>,
    targets: Vec<Vec3>,
    normals: Vec<Vec3>,
}

struct Stage {
    source: Vec<Vec3>,
    target: RTree<IndexedPoint>,
    normals: Vec<Vec3>,
    max_distance: f32,
}

impl Stage {
    fn new(source: &[Point], target: &[Point], params: &IcpStage, pose: &RigidTransform) -> Self {
        let placed: Vec<Point> = source
            .iter()
            .map(|p| p.with_position(pose.apply(p.position)))
            .collect();
        let back = pose.inverse();
        let source = voxel_downsample(&placed, params.voxel_size_mm)
            .into_iter()
            .map(|p| back.apply(p.position))
            .collect();

        let target = voxel_downsample(target, params.voxel_size_mm);
        let search = if params.voxel_size_mm > 0.0 {
            params.voxel_size_mm
        } else {
            params.max_correspondence_mm
        };
        let normals = estimate_normals(&target, 2.0 * search, NORMAL_NEIGHBORS);
        let target = RTree::bulk_load(
            target
                .iter()
                .enumerate()
                .map(|(i, p)| IndexedPoint::new(i, p.to_array()))
                .collect(),
        );
        Self {
            source,
            target,
            normals,
            max_distance: params.max_correspondence_mm,
        }
    }

    fn correspondences(&self, transform: &RigidTransform) -> (Matches, Evaluation) {
        let max_sq = (self.max_distance as f64).powi(2);
        let mut matches = Matches::default();
        let mut inlier_sq = 0.0;
        let mut truncated = 0.0;

        for &p in &self.source {
            let moved = transform.apply(p);
            let nearest = self.target.nearest_neighbor(&moved.to_array()).and_then(|neighbor| {
                let [x, y, z] = *neighbor.position();
                let q = Vec3::new(x, y, z);
                let distance_sq = moved.distance_squared(q) as f64;
                (distance_sq <= max_sq).then_some((q, neighbor.data, distance_sq))
            });
            match nearest {
                Some((q, index, distance_sq)) => {
                    let normal = self.normals.get(index).copied().unwrap_or(Vec3::ZERO);
                    inlier_sq += distance_sq;
                    truncated += ((moved - q).dot(normal) as f64).powi(2);
                    matches.placed.push(moved);
                    matches.targets.push(q);
                    matches.normals.push(normal);
                }
                None => truncated += max_sq,
            }
        }

        let n = self.source.len().max(1) as f64;
        let inliers = matches.placed.len();
        let evaluation = Evaluation {
            fitness: inliers as f64 / n,
            inlier_rmse: if inliers == 0 { 0.0 } else { (inlier_sq / inliers as f64).sqrt() },
            inliers,
            residual: truncated / n,
        };
        (matches, evaluation)
    }

    fn evaluate(&self, transform: &RigidTransform) -> Evaluation {
        self.correspondences(transform).1
    }
}

/// Register `source` onto `target` starting from `initial`.
pub fn register(
    source: &[Point],
    target: &[Point],
    initial: &RigidTransform,
    config: &AlignmentConfig,
) -> Result<IcpResult, IcpError> {
    let required = config.min_correspondences;
    if config.stages.is_empty() {
        return Err(IcpError::InsufficientOverlap { found: 0, required });
    }

    let mut current = *initial;
    let mut iterations = 0;
    let mut finest = None;

    for (index, params) in config.stages.iter().enumerate() {
        let stage = Stage::new(source, target, params, &current);
        let (best, used) = run_stage(&stage, current, params.max_iterations, config)?;
        current = best;
        iterations += used;
        debug!(
            "ICP stage {} ({} mm): {} iterations, {} source points",
            index,
            params.voxel_size_mm,
            used,
            stage.source.len()
        );
        finest = Some(stage);
    }
    let Some(stage) = finest else {
        return Err(IcpError::InsufficientOverlap { found: 0, required });
    };

    let initial_eval = stage.evaluate(initial);
    let mut final_eval = stage.evaluate(&current);
    if initial_eval.residual < final_eval.residual {
        debug!(
            "ICP result ({:.3}) is worse than the initial guess ({:.3}), keeping the guess",
            final_eval.residual, initial_eval.residual
        );
        current = *initial;
        final_eval = initial_eval;
    }
    if final_eval.inliers < required {
        return Err(IcpError::InsufficientOverlap {
            found: final_eval.inliers,
            required,
        });
    }

    Ok(IcpResult {
        transform: current,
        fitness: final_eval.fitness,
        inlier_rmse: final_eval.inlier_rmse,
        correspondences: final_eval.inliers,
        iterations,
        initial_residual: initial_eval.residual,
        final_residual: final_eval.residual,
    })
}

/// Iterate one stage, returning the lowest-residual transform and the
/// iteration count.
fn run_stage(
    stage: &Stage,
    start: RigidTransform,
    max_iterations: usize,
    config: &AlignmentConfig,
) -> Result<(RigidTransform, usize), IcpError> {
    let required = config.min_correspondences;
    let mut current = start;
    let (mut matches, mut eval) = stage.correspondences(&current);
    if eval.inliers < required {
        return Err(IcpError::InsufficientOverlap {
            found: eval.inliers,
            required,
        });
    }

    let stage_initial = eval.residual;
    // floor in mm² so a perfect start does not turn rounding into divergence
    let divergence_limit = config.divergence_ratio * stage_initial.max(1e-2);
    let mut best = (current, eval.residual);
    let mut used = 0;

    while used < max_iterations {
        let Some(step) = fit_point_to_plane(&matches.placed, &matches.targets, &matches.normals)
            .filter(RigidTransform::is_finite)
        else {
            return Err(IcpError::Diverged {
                residual: f64::INFINITY,
                initial: stage_initial,
            });
        };
        current = step.compose(&current);
        used += 1;

        let previous = eval;
        (matches, eval) = stage.correspondences(&current);
        trace!(
            "iteration {}: fitness {:.4}, rmse {:.3}, residual {:.3}",
            used, eval.fitness, eval.inlier_rmse, eval.residual
        );

        if eval.residual > divergence_limit {
            return Err(IcpError::Diverged {
                residual: eval.residual,
                initial: stage_initial,
            });
        }
        if eval.residual < best.1 {
            best = (current, eval.residual);
        }
        if eval.inliers < required {
            break;
        }
        if (eval.fitness - previous.fitness).abs() < config.relative_fitness
            && (eval.inlier_rmse - previous.inlier_rmse).abs() < config.relative_rmse
        {
            break;
        }
    }

    Ok((best.0, used))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    /// Undulating height field, well constrained in all six degrees of freedom.
    fn surface() -> Vec<Point> {
        let mut points = Vec::new();
        for i in 0..60 {
            for j in 0..60 {
                let x = -300.0 + i as f32 * 10.0;
                let y = -300.0 + j as f32 * 10.0;
                let z = 50.0 * (x / 80.0).sin() * (y / 60.0).cos() + 0.0005 * x * y;
                points.push(Point::new(Vec3::new(x, y, z)));
            }
        }
        points
    }

    fn truth() -> RigidTransform {
        RigidTransform::new(
            Quat::from_euler(glam::EulerRot::XYZ, 0.02, -0.015, 0.03),
            Vec3::new(15.0, -10.0, 8.0),
        )
    }

    #[test]
    fn test_recovers_small_offset() {
        let target = surface();
        let to_source = truth().inverse();
        let source: Vec<Point> = target
            .iter()
            .map(|p| p.with_position(to_source.apply(p.position)))
            .collect();

        let result = register(&source, &target, &RigidTransform::IDENTITY, &AlignmentConfig::default()).unwrap();
        assert!(
            result.transform.approx_eq(&truth(), 0.01, 5.0),
            "got {:?}",
            result.transform
        );
        assert!(result.fitness > 0.8);
        assert!(result.final_residual <= result.initial_residual);
    }

    #[test]
    fn test_exact_guess_is_kept() {
        let target = surface();
        let to_source = truth().inverse();
        let source: Vec<Point> = target
            .iter()
            .map(|p| p.with_position(to_source.apply(p.position)))
            .collect();

        let result = register(&source, &target, &truth(), &AlignmentConfig::default()).unwrap();
        assert!(result.final_residual <= result.initial_residual);
        assert!(result.transform.approx_eq(&truth(), 0.01, 5.0));
    }

    /// Flat ground with a few round bumps, seen by a view displaced by `shift`
    /// along x. Every view samples the same 16 mm grid of its own
    /// coordinates, like depth pixels of cameras at equal height.
    fn bumpy_ground(shift: f32) -> Vec<Point> {
        let bumps = [(-220.0, -150.0), (-40.0, 170.0), (130.0, -60.0), (260.0, 210.0), (30.0, -250.0)];
        let mut points = Vec::new();
        for i in 0..50 {
            for j in 0..40 {
                let x = -400.0 + i as f32 * 16.0;
                let y = -320.0 + j as f32 * 16.0;
                let z: f32 = bumps
                    .iter()
                    .map(|&(bx, by): &(f32, f32)| {
                        let d2 = (x + shift - bx).powi(2) + (y - by).powi(2);
                        60.0 * (-d2 / (2.0 * 45.0 * 45.0)).exp()
                    })
                    .sum();
                points.push(Point::new(Vec3::new(x, y, z)));
            }
        }
        points
    }

    #[test]
    fn test_recovers_offset_between_grid_sampled_views() {
        let target = bumpy_ground(0.0);
        let source = bumpy_ground(30.0);

        let result = register(&source, &target, &RigidTransform::IDENTITY, &AlignmentConfig::default()).unwrap();
        let error = (result.transform.translation - Vec3::new(30.0, 0.0, 0.0)).length();
        assert!(error < 3.0, "got {:?}", result.transform);
        assert!(result.transform.rotation_angle() < 0.01);
        assert!(result.final_residual < result.initial_residual);
    }

    #[test]
    fn test_flat_ground_keeps_guess() {
        // sliding along a featureless plane is unobservable
        let plane: Vec<Point> = bumpy_ground(0.0)
            .into_iter()
            .map(|p| p.with_position(Vec3::new(p.position.x, p.position.y, 0.0)))
            .collect();
        let guess = RigidTransform::from_translation(Vec3::new(4.0, -3.0, 0.0));

        let result = register(&plane, &plane, &guess, &AlignmentConfig::default()).unwrap();
        assert!(result.final_residual <= result.initial_residual);
        assert!(result.transform.approx_eq(&guess, 1e-3, 0.5), "got {:?}", result.transform);
    }

    #[test]
    fn test_disjoint_clouds_lack_overlap() {
        let target = surface();
        let far = RigidTransform::from_translation(Vec3::new(10_000.0, 0.0, 0.0));
        let source: Vec<Point> = target
            .iter()
            .map(|p| p.with_position(far.apply(p.position)))
            .collect();

        let err = register(&source, &target, &RigidTransform::IDENTITY, &AlignmentConfig::default()).unwrap_err();
        assert!(matches!(err, IcpError::InsufficientOverlap { found: 0, .. }));
    }

    #[test]
    fn test_empty_schedule_is_rejected() {
        let config = AlignmentConfig {
            stages: Vec::new(),
            ..AlignmentConfig::default()
        };
        assert!(register(&surface(), &surface(), &RigidTransform::IDENTITY, &config).is_err());
    }
}
