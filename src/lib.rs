//! Rowscan - multi-camera RGB-D capture fusion for crop row scanning.
//!
//! This facade re-exports the workspace crates:
//!
//! - [`data`]: points and PLY files
//! - [`fusion`]: synchronization, calibration, alignment, fusion and export
//! - [`capture`]: synthetic and recorded frame sources

pub use rowscan_capture as capture;
pub use rowscan_data as data;
pub use rowscan_fusion as fusion;

pub use rowscan_capture::{FrameClock, open_sources};
pub use rowscan_fusion::{CameraId, CaptureSession, FusionConfig, FusionError, FusionService};
