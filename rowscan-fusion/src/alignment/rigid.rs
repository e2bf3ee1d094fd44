//! Linearized point-to-plane rigid fit.

use crate::calibration::RigidTransform;
use glam::{Quat, Vec3};
use nalgebra::{Matrix6, Vector3, Vector6};

/// Small rigid motion that best moves `source[i]` onto the tangent plane
/// through `target[i]` with normal `normals[i]`, under a first-order
/// rotation model. Apply it on top of the transform that produced `source`.
///
/// Directions the pairs leave unconstrained (sliding along a flat surface)
/// stay at zero. Returns `None` for fewer than six pairs.
pub fn fit_point_to_plane(
    source: &[Vec3],
    target: &[Vec3],
    normals: &[Vec3],
) -> Option<RigidTransform> {
    let n = source.len().min(target.len()).min(normals.len());
    if n < 6 {
        return None;
    }

    let to_na = |v: &Vec3| Vector3::new(v.x as f64, v.y as f64, v.z as f64);
    let centroid = source[..n].iter().map(to_na).sum::<Vector3<f64>>() / n as f64;
    // rotation unknowns are scaled by the cloud radius so all six columns are comparable
    let radius = (source[..n]
        .iter()
        .map(|p| (to_na(p) - centroid).norm_squared())
        .sum::<f64>()
        / n as f64)
        .sqrt()
        .max(1.0);

    let mut normal_matrix = Matrix6::<f64>::zeros();
    let mut rhs = Vector6::<f64>::zeros();
    for ((s, t), normal) in source[..n].iter().zip(&target[..n]).zip(&normals[..n]) {
        let normal = to_na(normal);
        let arm = (to_na(s) - centroid).cross(&normal) / radius;
        let row = Vector6::new(arm.x, arm.y, arm.z, normal.x, normal.y, normal.z);
        normal_matrix += row * row.transpose();
        rhs += row * (to_na(t) - to_na(s)).dot(&normal);
    }
    for i in 0..6 {
        normal_matrix[(i, i)] += 1e-6 * n as f64;
    }

    let x = normal_matrix.cholesky()?.solve(&rhs);
    if !x.iter().all(|v| v.is_finite()) {
        return None;
    }

    let omega = Vec3::new(x[0] as f32, x[1] as f32, x[2] as f32) / radius as f32;
    let rotation = Quat::from_scaled_axis(omega);
    let pivot = Vec3::new(centroid.x as f32, centroid.y as f32, centroid.z as f32);
    let translation = Vec3::new(x[3] as f32, x[4] as f32, x[5] as f32);
    Some(RigidTransform::new(rotation, pivot + translation - rotation * pivot))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points on the three faces of a box corner, with their face normals.
    fn corner() -> (Vec<Vec3>, Vec<Vec3>) {
        let mut points = Vec::new();
        let mut normals = Vec::new();
        for i in 0..8 {
            for j in 0..8 {
                let (a, b) = (10.0 + i as f32 * 20.0, 10.0 + j as f32 * 20.0);
                points.extend([Vec3::new(a, b, 0.0), Vec3::new(a, 0.0, b), Vec3::new(0.0, a, b)]);
                normals.extend([Vec3::Z, Vec3::Y, Vec3::X]);
            }
        }
        (points, normals)
    }

    #[test]
    fn test_point_to_plane_recovers_small_motion() {
        let truth = RigidTransform::new(
            Quat::from_euler(glam::EulerRot::ZYX, 0.01, -0.005, 0.008),
            Vec3::new(2.0, -1.0, 3.0),
        );
        let (target, target_normals) = corner();
        let to_source = truth.inverse();
        let source: Vec<Vec3> = target.iter().map(|&p| to_source.apply(p)).collect();

        let step = fit_point_to_plane(&source, &target, &target_normals).unwrap();
        assert!(step.approx_eq(&truth, 1e-3, 0.2), "got {:?}", step);
    }

    #[test]
    fn test_point_to_plane_does_not_slide_along_a_plane() {
        let (points, normals) = corner();
        let floor: Vec<(Vec3, Vec3)> = points
            .into_iter()
            .zip(normals)
            .filter(|(_, n)| *n == Vec3::Z)
            .collect();
        let target: Vec<Vec3> = floor.iter().map(|(p, _)| *p).collect();
        let normals: Vec<Vec3> = floor.iter().map(|(_, n)| *n).collect();
        // same heights, shifted sideways: only the height offset is observable
        let source: Vec<Vec3> = target.iter().map(|p| *p + Vec3::new(7.0, -4.0, -5.0)).collect();

        let step = fit_point_to_plane(&source, &target, &normals).unwrap();
        let expected = RigidTransform::from_translation(Vec3::new(0.0, 0.0, 5.0));
        assert!(step.approx_eq(&expected, 1e-4, 0.01), "got {:?}", step);
    }
}
