//! Voxel-grid downsampling

use glam::Vec3;
use rowscan_data::Point;
use std::collections::{BTreeMap, BTreeSet};

/// Integer cell coordinates of a voxel.
pub type VoxelKey = (i64, i64, i64);

pub fn voxel_key(position: Vec3, voxel_size: f32) -> VoxelKey {
    let cell = (position / voxel_size).floor();
    (cell.x as i64, cell.y as i64, cell.z as i64)
}

/// Occupied voxels of `points`.
pub fn voxel_keys(points: &[Point], voxel_size: f32) -> BTreeSet<VoxelKey> {
    points.iter().map(|p| voxel_key(p.position, voxel_size)).collect()
}

#[derive(Default)]
struct Accumulator {
    position: glam::DVec3,
    count: u32,
    color: [u32; 3],
    colored: u32,
}

/// Replace all points sharing a voxel by their centroid.
///
/// The centroid's color is the mean of the colored points in the voxel, if any.
/// Output order is deterministic (sorted by voxel). A non-positive size
/// returns the input unchanged.
pub fn voxel_downsample(points: &[Point], voxel_size: f32) -> Vec<Point> {
    if !(voxel_size > 0.0) {
        return points.to_vec();
    }

    let mut grid: BTreeMap<VoxelKey, Accumulator> = BTreeMap::new();
    for point in points {
        let cell = grid.entry(voxel_key(point.position, voxel_size)).or_default();
        cell.position += point.position.as_dvec3();
        cell.count += 1;
        if let Some([r, g, b]) = point.color {
            cell.color[0] += r as u32;
            cell.color[1] += g as u32;
            cell.color[2] += b as u32;
            cell.colored += 1;
        }
    }

    grid.into_values()
        .map(|cell| {
            let position = (cell.position / cell.count as f64).as_vec3();
            if cell.colored == 0 {
                return Point::new(position);
            }
            let mean = |sum: u32| ((sum as f32 / cell.colored as f32).round()) as u8;
            Point::colored(
                position,
                [mean(cell.color[0]), mean(cell.color[1]), mean(cell.color[2])],
            )
        })
        .collect()
}
