//! Merging synchronized clouds into the shared frame.

use crate::calibration::CalibrationSnapshot;
use crate::cloud::{CloudBuilder, remove_statistical_outliers, voxel_downsample};
use crate::config::FusionFilterConfig;
use crate::error::FusionError;
use crate::export::CaptureSession;
use crate::ingest::{CameraId, PointCloud, ReferenceFrame, SyncedFrameSet};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Where a fused cloud came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Set once the cloud is exported.
    pub session: Option<CaptureSession>,
    /// Set once the cloud is exported.
    pub sequence_number: Option<u64>,
    pub contributing_camera_ids: Vec<CameraId>,
    /// Cameras present in the set but without calibration.
    pub excluded_camera_ids: Vec<CameraId>,
    /// Cameras left out of the set because they stopped delivering frames.
    pub unavailable_camera_ids: Vec<CameraId>,
    pub reference_timestamp: f64,
    /// Extrinsics version used for each contributing camera.
    pub calibration_versions: BTreeMap<CameraId, u64>,
    pub timestamp: DateTime<Utc>,
    pub point_count: usize,
}

/// A fused cloud in the shared frame plus everything needed to export it.
#[derive(Debug, Clone)]
pub struct FusedCloud {
    pub cloud: PointCloud,
    pub provenance: Provenance,
    /// Each contributing camera's cloud in the shared frame, before filtering.
    pub camera_clouds: BTreeMap<CameraId, PointCloud>,
    /// Color frames of the contributing cameras.
    pub color_frames: BTreeMap<CameraId, RgbImage>,
}

impl FusedCloud {
    pub fn len(&self) -> usize {
        self.cloud.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cloud.is_empty()
    }
}

/// Applies calibration to a synchronized set and bounds density and noise.
#[derive(Debug, Clone)]
pub struct FusionEngine {
    builder: CloudBuilder,
    filter: FusionFilterConfig,
}

impl FusionEngine {
    pub fn new(builder: CloudBuilder, filter: FusionFilterConfig) -> Self {
        Self { builder, filter }
    }

    pub fn filter(&self) -> &FusionFilterConfig {
        &self.filter
    }

    /// Fuse every calibrated camera of `set`.
    ///
    /// Uncalibrated cameras are left out and listed in the provenance; only a
    /// set without any calibrated camera is an error. The result depends only
    /// on the set, the snapshot and the filter settings.
    pub fn fuse(
        &self,
        set: &SyncedFrameSet,
        calibration: &CalibrationSnapshot,
    ) -> Result<FusedCloud, FusionError> {
        let mut contributing = Vec::new();
        let mut excluded = Vec::new();
        let mut versions = BTreeMap::new();
        let mut camera_clouds = BTreeMap::new();
        let mut color_frames = BTreeMap::new();
        let mut merged = Vec::new();

        for (camera, sample) in &set.frames {
            let Some(extrinsics) = calibration.get(camera) else {
                warn!("Camera {} is not calibrated, excluded from fusion", camera);
                excluded.push(camera.clone());
                continue;
            };
            let shared = self
                .builder
                .build(sample)
                .transformed(&extrinsics.transform, ReferenceFrame::Shared);
            merged.extend_from_slice(&shared.points);
            contributing.push(camera.clone());
            versions.insert(camera.clone(), extrinsics.version);
            if let Some(color) = &sample.color {
                color_frames.insert(camera.clone(), color.clone());
            }
            camera_clouds.insert(camera.clone(), shared);
        }

        if contributing.is_empty() {
            return Err(FusionError::CalibrationMissing);
        }

        let merged_len = merged.len();
        let downsampled = voxel_downsample(&merged, self.filter.voxel_size_mm);
        let points = if self.filter.remove_outliers {
            remove_statistical_outliers(
                downsampled,
                self.filter.outlier_neighbors,
                self.filter.outlier_std_ratio,
            )
        } else {
            downsampled
        };
        debug!(
            "Fused {} cameras: {} merged points, {} after filtering",
            contributing.len(),
            merged_len,
            points.len()
        );

        let provenance = Provenance {
            session: None,
            sequence_number: None,
            contributing_camera_ids: contributing,
            excluded_camera_ids: excluded,
            unavailable_camera_ids: set.unavailable.clone(),
            reference_timestamp: set.reference_timestamp,
            calibration_versions: versions,
            timestamp: Utc::now(),
            point_count: points.len(),
        };

        Ok(FusedCloud {
            cloud: PointCloud::with_timestamp(points, ReferenceFrame::Shared, set.reference_timestamp),
            provenance,
            camera_clouds,
            color_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationStore, RigidTransform};
    use crate::cloud::voxel_keys;
    use crate::config::CloudConfig;
    use crate::ingest::{DepthImage, FrameSample, Intrinsics};
    use glam::Vec3;
    use image::Luma;

    fn frame(camera: &str) -> FrameSample {
        let depth = DepthImage::from_fn(80, 60, |u, v| {
            Luma([(1200.0 + 3.0 * u as f32 + 2.0 * v as f32) as u16])
        });
        FrameSample::new(
            CameraId::from(camera),
            2.0,
            depth,
            Intrinsics::new(70.0, 70.0, 39.5, 29.5, 80, 60),
        )
    }

    fn set(cameras: &[&str]) -> SyncedFrameSet {
        SyncedFrameSet {
            reference_timestamp: 2.0,
            frames: cameras
                .iter()
                .map(|id| (CameraId::from(*id), frame(id)))
                .collect(),
            unavailable: vec![CameraId::from("z")],
        }
    }

    fn engine(voxel_size_mm: f32) -> FusionEngine {
        FusionEngine::new(
            CloudBuilder::new(CloudConfig::default()),
            FusionFilterConfig {
                voxel_size_mm,
                ..FusionFilterConfig::default()
            },
        )
    }

    #[test]
    fn test_uncalibrated_camera_is_excluded() {
        let store = CalibrationStore::in_memory();
        store.put(&CameraId::from("a"), RigidTransform::IDENTITY, None);
        store.put(
            &CameraId::from("b"),
            RigidTransform::from_translation(Vec3::new(100.0, 0.0, 0.0)),
            None,
        );

        let fused = engine(5.0).fuse(&set(&["a", "b", "c"]), &store.snapshot()).unwrap();
        let p = &fused.provenance;
        assert_eq!(p.contributing_camera_ids, vec![CameraId::from("a"), CameraId::from("b")]);
        assert_eq!(p.excluded_camera_ids, vec![CameraId::from("c")]);
        assert_eq!(p.unavailable_camera_ids, vec![CameraId::from("z")]);
        assert_eq!(p.calibration_versions[&CameraId::from("b")], 1);
        assert_eq!(fused.cloud.frame, ReferenceFrame::Shared);
        assert!(!fused.is_empty());
        assert_eq!(fused.camera_clouds.len(), 2);
    }

    #[test]
    fn test_no_calibrated_camera_fails() {
        let store = CalibrationStore::in_memory();
        let err = engine(5.0).fuse(&set(&["a", "b"]), &store.snapshot()).unwrap_err();
        assert!(matches!(err, FusionError::CalibrationMissing));
    }

    #[test]
    fn test_fuse_is_idempotent() {
        let store = CalibrationStore::in_memory();
        store.put(&CameraId::from("a"), RigidTransform::IDENTITY, None);
        store.put(
            &CameraId::from("b"),
            RigidTransform::from_translation(Vec3::new(7.0, 3.0, 0.0)),
            None,
        );
        let snapshot = store.snapshot();
        let input = set(&["a", "b"]);
        let engine = engine(5.0);

        let first = engine.fuse(&input, &snapshot).unwrap();
        let second = engine.fuse(&input, &snapshot).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(voxel_keys(&first.cloud.points, 5.0), voxel_keys(&second.cloud.points, 5.0));
    }

    #[test]
    fn test_overlap_density_is_bounded_by_voxels() {
        let store = CalibrationStore::in_memory();
        for camera in ["a", "b", "c"] {
            store.put(&CameraId::from(camera), RigidTransform::IDENTITY, None);
        }

        let engine = FusionEngine::new(
            CloudBuilder::new(CloudConfig::default()),
            FusionFilterConfig {
                voxel_size_mm: 5.0,
                remove_outliers: false,
                ..FusionFilterConfig::default()
            },
        );
        let fused = engine.fuse(&set(&["a", "b", "c"]), &store.snapshot()).unwrap();
        let single = engine.fuse(&set(&["a"]), &store.snapshot()).unwrap();

        let bounds = fused.cloud.bounds().unwrap();
        assert!((fused.len() as u64) <= bounds.cell_capacity(5.0));
        // three identical views occupy the same voxels as one
        assert_eq!(fused.len(), single.len());
    }
}
