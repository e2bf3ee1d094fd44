//! Camera calibration
//!
//! Extrinsics map each camera's optical frame into the shared frame defined by
//! the reference camera. The store keeps them in memory and on disk.

pub mod extrinsics;
pub mod store;
pub mod transform;

pub use extrinsics::{AlignmentQuality, CameraExtrinsics, ExtrinsicsRecord, RECORD_FORMAT_VERSION};
pub use store::{CalibrationSnapshot, CalibrationStore, LoadReport};
pub use transform::RigidTransform;
