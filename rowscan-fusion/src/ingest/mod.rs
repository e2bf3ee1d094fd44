//! Frame ingestion
//!
//! - Camera frame types and the `FrameSource` trait
//! - Point cloud containers
//! - Producer threads, one per camera
//! - Cross-camera synchronization

pub mod camera;
pub mod point_cloud;
pub mod producer;
pub mod sync_queue;

pub use camera::{CameraId, DepthImage, FrameSample, FrameSource, Intrinsics, StreamError};
pub use point_cloud::{PointCloud, ReferenceFrame};
pub use producer::{ProducerHandle, spawn_producer};
pub use sync_queue::{PushOutcome, SyncQueue, SyncedFrameSet};
