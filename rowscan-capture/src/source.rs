//! Common capture source types and traits.

use image::RgbImage;
use rowscan_fusion::ingest::{CameraId, DepthImage, FrameSample, FrameSource, Intrinsics, StreamError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur during capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to capture frame: {0}")]
    CaptureFailed(String),

    #[error("Stream ended")]
    StreamEnded,

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid intrinsics file: {0}")]
    Intrinsics(#[from] serde_json::Error),
}

impl From<CaptureError> for StreamError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::StreamEnded => StreamError::StreamEnded,
            CaptureError::Io(e) => StreamError::Io(e),
            CaptureError::Image(e) => StreamError::ImageDecode(e),
            other => StreamError::InvalidData(other.to_string()),
        }
    }
}

/// Raw RGB-D frame from a capture source.
#[derive(Debug, Clone)]
pub struct RgbdFrame {
    pub depth: DepthImage,
    pub color: Option<RgbImage>,
    /// Seconds on the host clock shared by all sources.
    pub timestamp: f64,
    pub frame_number: u64,
}

impl RgbdFrame {
    pub fn new(depth: DepthImage, color: Option<RgbImage>, timestamp: f64, frame_number: u64) -> Self {
        Self {
            depth,
            color,
            timestamp,
            frame_number,
        }
    }

    /// Get depth dimensions (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        self.depth.dimensions()
    }
}

/// Trait for devices or recordings producing RGB-D frames.
///
/// This is a lower-level trait than `FrameSource`: it knows nothing about
/// camera identity. Wrap it in [`IdentifiedSource`] to feed the fusion core.
pub trait DepthSource: Send {
    /// Get the next frame from the source.
    fn next_frame(&mut self) -> Result<Option<RgbdFrame>, CaptureError>;

    /// Intrinsics of the depth stream.
    fn intrinsics(&self) -> Intrinsics;

    /// Get the frame rate, if known.
    fn frame_rate(&self) -> Option<f32>;

    /// Check if the source is still active.
    fn is_active(&self) -> bool;

    /// Stop capturing.
    fn stop(&mut self);
}

/// Timestamps frames on a clock shared by every source of one run.
///
/// In real-time mode `frame_time` sleeps until the frame is due and stamps it
/// with the elapsed host time; otherwise frames are stamped at exact multiples
/// of the frame period without waiting.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    epoch: Instant,
    realtime: bool,
}

impl FrameClock {
    pub fn realtime() -> Self {
        Self {
            epoch: Instant::now(),
            realtime: true,
        }
    }

    pub fn simulated() -> Self {
        Self {
            epoch: Instant::now(),
            realtime: false,
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    /// Timestamp of frame `n` of a stream running at `fps`.
    pub fn frame_time(&self, n: u64, fps: f32) -> f64 {
        let due = n as f64 / fps.max(f32::EPSILON) as f64;
        if !self.realtime {
            return due;
        }
        let due_at = self.epoch + Duration::from_secs_f64(due);
        let now = Instant::now();
        if due_at > now {
            std::thread::sleep(due_at - now);
        }
        self.epoch.elapsed().as_secs_f64()
    }
}

/// A depth source bound to a camera id (implements `FrameSource`).
pub struct IdentifiedSource<S: DepthSource> {
    camera_id: CameraId,
    source: S,
    last_timestamp: Option<f64>,
}

impl<S: DepthSource> IdentifiedSource<S> {
    pub fn new(camera_id: CameraId, source: S) -> Self {
        Self {
            camera_id,
            source,
            last_timestamp: None,
        }
    }

    /// Get the underlying source.
    pub fn inner(&self) -> &S {
        &self.source
    }

    /// Get the underlying source mutably.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: DepthSource> FrameSource for IdentifiedSource<S> {
    fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    fn intrinsics(&self) -> Intrinsics {
        self.source.intrinsics()
    }

    fn next_frame(&mut self) -> Result<Option<FrameSample>, StreamError> {
        let Some(frame) = self.source.next_frame()? else {
            return Ok(None);
        };
        if self.last_timestamp.is_some_and(|last| frame.timestamp <= last) {
            return Err(StreamError::InvalidData(format!(
                "frame {} of {} does not advance the timestamp",
                frame.frame_number, self.camera_id
            )));
        }
        self.last_timestamp = Some(frame.timestamp);

        let sample = FrameSample::new(
            self.camera_id.clone(),
            frame.timestamp,
            frame.depth,
            self.source.intrinsics(),
        );
        Ok(Some(match frame.color {
            Some(color) => sample.with_color(color),
            None => sample,
        }))
    }

    fn frame_rate(&self) -> Option<f32> {
        self.source.frame_rate()
    }

    fn is_active(&self) -> bool {
        self.source.is_active()
    }
}
