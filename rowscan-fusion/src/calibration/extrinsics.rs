//! Per-camera extrinsics and their on-disk record format.

use crate::calibration::RigidTransform;
use crate::ingest::CameraId;
use chrono::{DateTime, Utc};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Current on-disk record layout.
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// How well an alignment explained the data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentQuality {
    /// Fraction of source points with a correspondence.
    pub fitness: f64,
    /// RMSE of inlier correspondences (millimeters).
    pub inlier_rmse: f64,
}

/// Camera-to-shared-frame transform with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraExtrinsics {
    pub camera_id: CameraId,
    pub transform: RigidTransform,
    /// Increases with every update for this camera, including across resets.
    pub version: u64,
    pub computed_at: DateTime<Utc>,
    pub quality: Option<AlignmentQuality>,
}

/// Serialized form of [`CameraExtrinsics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtrinsicsRecord {
    pub format_version: u32,
    pub camera_id: CameraId,
    /// Unit quaternion `[x, y, z, w]`.
    pub rotation: [f32; 4],
    /// Millimeters.
    pub translation: [f32; 3],
    pub version: u64,
    pub computed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<AlignmentQuality>,
}

impl From<&CameraExtrinsics> for ExtrinsicsRecord {
    fn from(extrinsics: &CameraExtrinsics) -> Self {
        Self {
            format_version: RECORD_FORMAT_VERSION,
            camera_id: extrinsics.camera_id.clone(),
            rotation: extrinsics.transform.rotation.to_array(),
            translation: extrinsics.transform.translation.to_array(),
            version: extrinsics.version,
            computed_at: extrinsics.computed_at,
            quality: extrinsics.quality,
        }
    }
}

impl ExtrinsicsRecord {
    /// Check the record and convert it, describing the first problem found.
    pub fn into_extrinsics(self) -> Result<CameraExtrinsics, String> {
        if self.format_version != RECORD_FORMAT_VERSION {
            return Err(format!("unsupported format version {}", self.format_version));
        }
        if self.camera_id.as_str().is_empty() {
            return Err("empty camera id".to_string());
        }
        let rotation = Quat::from_array(self.rotation);
        let translation = Vec3::from_array(self.translation);
        if !rotation.is_finite() || !translation.is_finite() {
            return Err("non-finite transform".to_string());
        }
        if (rotation.length() - 1.0).abs() > 1e-3 {
            return Err(format!("rotation is not a unit quaternion (norm {})", rotation.length()));
        }
        Ok(CameraExtrinsics {
            camera_id: self.camera_id,
            transform: RigidTransform::new(rotation, translation),
            version: self.version,
            computed_at: self.computed_at,
            quality: self.quality,
        })
    }
}
