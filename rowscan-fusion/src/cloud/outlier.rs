//! Statistical outlier removal

use rowscan_data::Point;
use rstar::RTree;
use rstar::primitives::PointWithData;
use tracing::debug;

type IndexedPoint = PointWithData<usize, [f32; 3]>;

/// Mean distance from each point to its `k` nearest neighbors.
pub fn mean_neighbor_distances(points: &[Point], k: usize) -> Vec<f32> {
    let tree: RTree<IndexedPoint> = RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(i, p)| IndexedPoint::new(i, p.to_array()))
            .collect(),
    );

    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let query = point.to_array();
            let (sum, count) = tree
                .nearest_neighbor_iter(&query)
                .filter(|neighbor| neighbor.data != i)
                .take(k)
                .fold((0.0f32, 0usize), |(sum, count), neighbor| {
                    let [x, y, z] = *neighbor.position();
                    let distance = point.position.distance(glam::Vec3::new(x, y, z));
                    (sum + distance, count + 1)
                });
            if count == 0 { 0.0 } else { sum / count as f32 }
        })
        .collect()
}

/// Drop points whose mean distance to their `k` nearest neighbors exceeds the
/// global mean of that statistic by more than `std_ratio` standard deviations.
///
/// Clouds with no more than `k` points are returned unchanged.
pub fn remove_statistical_outliers(points: Vec<Point>, k: usize, std_ratio: f32) -> Vec<Point> {
    if k == 0 || points.len() <= k {
        return points;
    }

    let distances = mean_neighbor_distances(&points, k);
    let n = distances.len() as f64;
    let mean = distances.iter().map(|&d| d as f64).sum::<f64>() / n;
    let variance = distances.iter().map(|&d| (d as f64 - mean).powi(2)).sum::<f64>() / n;
    let threshold = mean + std_ratio as f64 * variance.sqrt();

    let before = points.len();
    let kept: Vec<Point> = points
        .into_iter()
        .zip(distances)
        .filter(|(_, d)| (*d as f64) <= threshold)
        .map(|(p, _)| p)
        .collect();
    debug!(
        "Outlier filter kept {}/{} points (threshold {:.2} mm)",
        kept.len(),
        before,
        threshold
    );
    kept
}
