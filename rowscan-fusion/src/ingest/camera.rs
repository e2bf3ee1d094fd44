//! Camera frame types and the frame source interface

use glam::Vec3;
use image::{ImageBuffer, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Depth map in raw sensor units (millimeters unless configured otherwise).
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Identifies one physical camera, e.g. by its network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A form of the id that is safe to embed in a file name.
    ///
    /// Bytes outside `[A-Za-z0-9._-]` are percent-encoded, so distinct ids
    /// never share a stem.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => stem.push(byte as char),
                _ => stem.push_str(&format!("%{:02X}", byte)),
            }
        }
        stem
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CameraId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CameraId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Pinhole intrinsics of a depth camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Resolution the parameters refer to.
    pub width: u32,
    pub height: u32,
    /// Brown-Conrady coefficients (k1, k2, p1, p2, k3) as reported by the
    /// device. Depth frames arrive already rectified, so deprojection ignores them.
    #[serde(default)]
    pub distortion: [f32; 5],
}

impl Intrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            distortion: [0.0; 5],
        }
    }

    /// Pinhole deprojection of pixel `(u, v)` at depth `depth`.
    pub fn deproject(&self, u: f32, v: f32, depth: f32) -> Vec3 {
        Vec3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Whether the parameters can be used for deprojection.
    pub fn is_valid(&self) -> bool {
        self.fx.is_finite() && self.fy.is_finite() && self.fx != 0.0 && self.fy != 0.0
    }
}

/// One paired depth + color capture from a single camera.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub camera_id: CameraId,
    /// Capture time in seconds on the host's monotonic clock.
    pub timestamp: f64,
    pub depth: DepthImage,
    /// Color image; may differ in resolution from the depth map.
    pub color: Option<RgbImage>,
    pub intrinsics: Intrinsics,
}

impl FrameSample {
    /// Create a depth-only sample.
    pub fn new(camera_id: CameraId, timestamp: f64, depth: DepthImage, intrinsics: Intrinsics) -> Self {
        Self {
            camera_id,
            timestamp,
            depth,
            color: None,
            intrinsics,
        }
    }

    /// Attach a color image.
    pub fn with_color(mut self, color: RgbImage) -> Self {
        self.color = Some(color);
        self
    }

    /// Depth map dimensions (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        self.depth.dimensions()
    }
}

/// A camera producing timestamped RGB-D frames.
///
/// Implementations are driven from a dedicated producer thread, so they only
/// need to be `Send`.
pub trait FrameSource: Send {
    fn camera_id(&self) -> &CameraId;

    /// Fixed intrinsics of the depth stream.
    fn intrinsics(&self) -> Intrinsics;

    /// Block until the next frame is available.
    /// Returns None when the stream ends.
    fn next_frame(&mut self) -> Result<Option<FrameSample>, StreamError>;

    /// Frame rate (frames per second), if known
    fn frame_rate(&self) -> Option<f32> {
        None
    }

    /// Check if the stream is still active
    fn is_active(&self) -> bool;
}

/// Errors that can occur during stream processing
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image decoding error: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("Stream ended unexpectedly")]
    StreamEnded,
    #[error("Invalid frame data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deproject_principal_ray() {
        let intrinsics = Intrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let p = intrinsics.deproject(320.0, 240.0, 1500.0);
        assert_eq!(p, Vec3::new(0.0, 0.0, 1500.0));
    }

    #[test]
    fn test_deproject_off_axis() {
        let intrinsics = Intrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let p = intrinsics.deproject(420.0, 240.0, 2000.0);
        assert!((p - Vec3::new(400.0, 0.0, 2000.0)).length() < 1e-3);
    }

    #[test]
    fn test_camera_id_file_stem() {
        assert_eq!(CameraId::from("10.95.76.11").file_stem(), "10.95.76.11");
        assert_eq!(CameraId::from("usb/cam 0").file_stem(), "usb%2Fcam%200");
        assert_eq!(CameraId::from("a_b").file_stem(), "a_b");
        assert_ne!(CameraId::from("a/b").file_stem(), CameraId::from("a_b").file_stem());
        assert_ne!(CameraId::from("a%2Fb").file_stem(), CameraId::from("a/b").file_stem());
    }

    #[test]
    fn test_intrinsics_validity() {
        assert!(Intrinsics::new(500.0, 500.0, 0.0, 0.0, 1, 1).is_valid());
        assert!(!Intrinsics::new(0.0, 500.0, 0.0, 0.0, 1, 1).is_valid());
    }
}
