//! Point cloud containers

use crate::calibration::RigidTransform;
use crate::ingest::CameraId;
use rowscan_data::{Bounds, Point};

/// Coordinate frame a cloud is expressed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceFrame {
    /// The optical frame of one camera (x right, y down, z forward).
    Camera(CameraId),
    /// The shared frame defined by calibration.
    Shared,
}

/// A point cloud tagged with its frame of reference.
#[derive(Debug, Clone)]
pub struct PointCloud {
    pub points: Vec<Point>,
    pub frame: ReferenceFrame,
    /// Capture time of the frame(s) the cloud was built from.
    pub timestamp: Option<f64>,
}

impl PointCloud {
    pub fn new(points: Vec<Point>, frame: ReferenceFrame) -> Self {
        Self {
            points,
            frame,
            timestamp: None,
        }
    }

    pub fn with_timestamp(points: Vec<Point>, frame: ReferenceFrame, timestamp: f64) -> Self {
        Self {
            points,
            frame,
            timestamp: Some(timestamp),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.points)
    }

    /// Apply `transform` to every point, producing a cloud in `frame`.
    pub fn transformed(&self, transform: &RigidTransform, frame: ReferenceFrame) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| p.with_position(transform.apply(p.position)))
                .collect(),
            frame,
            timestamp: self.timestamp,
        }
    }
}
