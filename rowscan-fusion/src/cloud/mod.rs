//! Point cloud construction and filtering

pub mod builder;
pub mod normals;
pub mod outlier;
pub mod voxel;

pub use builder::CloudBuilder;
pub use normals::estimate_normals;
pub use outlier::{mean_neighbor_distances, remove_statistical_outliers};
pub use voxel::{VoxelKey, voxel_downsample, voxel_key, voxel_keys};
