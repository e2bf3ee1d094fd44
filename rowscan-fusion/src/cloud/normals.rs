//! Surface normal estimation

use glam::Vec3;
use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rowscan_data::Point;
use rstar::RTree;

/// Points always used for a normal, even beyond the search radius.
const MIN_NEIGHBORS: usize = 3;

/// Unit normal of each point: the direction of least spread among at most
/// `max_neighbors` neighbors within `radius`, the point itself included. The
/// sign is arbitrary.
///
/// The nearest three points are used even when they lie beyond `radius`;
/// only clouds with fewer than three points get zero normals.
pub fn estimate_normals(points: &[Point], radius: f32, max_neighbors: usize) -> Vec<Vec3> {
    let radius_sq = radius * radius;
    let tree: RTree<[f32; 3]> = RTree::bulk_load(points.iter().map(Point::to_array).collect());

    points
        .iter()
        .map(|point| {
            let neighbors: Vec<Vector3<f64>> = tree
                .nearest_neighbor_iter(&point.to_array())
                .take(max_neighbors.max(MIN_NEIGHBORS))
                .enumerate()
                .take_while(|(i, q)| {
                    *i < MIN_NEIGHBORS
                        || point.position.distance_squared(Vec3::new(q[0], q[1], q[2])) <= radius_sq
                })
                .map(|(_, &[x, y, z])| Vector3::new(x as f64, y as f64, z as f64))
                .collect();
            if neighbors.len() < MIN_NEIGHBORS {
                return Vec3::ZERO;
            }

            let mean = neighbors.iter().copied().sum::<Vector3<f64>>() / neighbors.len() as f64;
            let mut covariance = Matrix3::<f64>::zeros();
            for q in &neighbors {
                let d = q - mean;
                covariance += d * d.transpose();
            }
            let eigen = SymmetricEigen::new(covariance);
            let normal = eigen.eigenvectors.column(eigen.eigenvalues.imin());
            Vec3::new(normal[0] as f32, normal[1] as f32, normal[2] as f32).normalize_or_zero()
        })
        .collect()
}
