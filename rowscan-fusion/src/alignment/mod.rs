//! Camera-to-camera registration
//!
//! - [`rigid`]: linearized point-to-plane rigid fit
//! - [`icp`]: coarse-to-fine point-to-plane iterative closest point
//! - [`engine`]: the alignment state machine driving ICP over synchronized sets

pub mod engine;
pub mod icp;
pub mod rigid;

pub use engine::{AlignmentEngine, AlignmentSession, AlignmentStatus, AlignmentSummary, CameraAlignment};
pub use icp::{IcpError, IcpResult, register};
pub use rigid::fit_point_to_plane;
