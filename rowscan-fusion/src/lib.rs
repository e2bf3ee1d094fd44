//! Rowscan Fusion Crate
//!
//! Turns the RGB-D streams of several independently clocked cameras into one
//! calibrated point cloud of the scanned crop row.
//!
//! ## Modules
//!
//! - [`ingest`]: frame samples, the `FrameSource` trait, producer threads and the
//!   synchronization queue
//! - [`cloud`]: depth deprojection, voxel-grid downsampling, outlier rejection
//! - [`calibration`]: per-camera extrinsics and their persistent store
//! - [`alignment`]: ICP registration of cameras against a reference camera
//! - [`fusion`]: merging synchronized clouds into the shared frame
//! - [`export`]: writing fused clouds and provenance to disk
//! - [`service`]: the trigger surface used by the control layer

pub mod alignment;
pub mod calibration;
pub mod cancel;
pub mod cloud;
pub mod config;
pub mod error;
pub mod export;
pub mod fusion;
pub mod ingest;
pub mod service;

pub use alignment::{AlignmentEngine, AlignmentSession, AlignmentStatus, AlignmentSummary};
pub use calibration::{CalibrationStore, CameraExtrinsics, RigidTransform};
pub use cancel::CancelToken;
pub use config::FusionConfig;
pub use error::{ConfigError, FusionError};
pub use export::{CaptureSession, ExportHandle, Exporter};
pub use fusion::{FusedCloud, FusionEngine, Provenance};
pub use ingest::{
    CameraId, DepthImage, FrameSample, FrameSource, Intrinsics, StreamError, SyncQueue,
    SyncedFrameSet,
};
pub use service::{FusionService, FusionStatus};
