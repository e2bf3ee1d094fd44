//! Synthetic RGB-D camera rendering a crop bed by ray casting.
//!
//! The scene is a flat soil plane at `z = 0` with rows of plants modelled as
//! partially buried spheres. Coordinates are millimeters with `+z` up.

use crate::source::{CaptureError, DepthSource, FrameClock, RgbdFrame};
use glam::{Mat3, Vec3};
use image::{Luma, Rgb, RgbImage};
use rowscan_fusion::calibration::RigidTransform;
use rowscan_fusion::ingest::{DepthImage, Intrinsics};
use tracing::{debug, info};

const SOIL: [u8; 3] = [104, 78, 52];
const SOIL_DARK: [u8; 3] = [88, 64, 42];

/// A plant, approximated as a sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mound {
    pub center: Vec3,
    pub radius: f32,
}

impl Mound {
    /// Nearest positive ray parameter where `origin + t * dir` hits the sphere.
    fn intersect(&self, origin: Vec3, dir: Vec3) -> Option<f32> {
        let oc = origin - self.center;
        let a = dir.length_squared();
        let b = 2.0 * dir.dot(oc);
        let c = oc.length_squared() - self.radius * self.radius;
        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return None;
        }
        let sqrt = disc.sqrt();
        let near = (-b - sqrt) / (2.0 * a);
        let far = (-b + sqrt) / (2.0 * a);
        if near > 0.0 {
            Some(near)
        } else if far > 0.0 {
            Some(far)
        } else {
            None
        }
    }
}

/// Static geometry seen by synthetic cameras.
#[derive(Debug, Clone, Default)]
pub struct SyntheticScene {
    pub mounds: Vec<Mound>,
}

impl SyntheticScene {
    /// Five plant rows along `y`, with irregular spacing and sizes so that
    /// the geometry has no exact translational symmetry.
    pub fn crop_bed() -> Self {
        let mut mounds = Vec::new();
        let mut i = 0u32;
        for row in -2..=2 {
            let x = row as f32 * 300.0;
            let mut y = -950.0;
            while y < 950.0 {
                let jitter = hash01(i) - 0.5;
                let radius = 50.0 + 50.0 * hash01(i.wrapping_add(7919));
                mounds.push(Mound {
                    center: Vec3::new(x + 60.0 * jitter, y, radius * 0.4),
                    radius,
                });
                y += 170.0 + 90.0 * hash01(i.wrapping_add(104_729));
                i += 1;
            }
        }
        Self { mounds }
    }

    /// First hit along the ray and its color.
    pub fn cast(&self, origin: Vec3, dir: Vec3) -> Option<(f32, [u8; 3])> {
        let mut best: Option<(f32, [u8; 3])> = None;

        if dir.z < 0.0 && origin.z > 0.0 {
            let t = -origin.z / dir.z;
            let hit = origin + dir * t;
            let checker = ((hit.x / 50.0).floor() + (hit.y / 50.0).floor()) as i64;
            let color = if checker.rem_euclid(2) == 0 { SOIL } else { SOIL_DARK };
            best = Some((t, color));
        }

        for mound in &self.mounds {
            let Some(t) = mound.intersect(origin, dir) else {
                continue;
            };
            if best.is_some_and(|(b, _)| b <= t) {
                continue;
            }
            let hit = origin + dir * t;
            let shade = (hit.z / (mound.center.z + mound.radius)).clamp(0.0, 1.0);
            let color = [40, (110.0 + 110.0 * shade) as u8, 48];
            best = Some((t, color));
        }

        best
    }
}

/// Deterministic value in `[0, 1)` for an index.
fn hash01(i: u32) -> f32 {
    let mut x = i.wrapping_mul(0x9E37_79B9) ^ 0x85EB_CA6B;
    x ^= x >> 16;
    x = x.wrapping_mul(0x7FEB_352D);
    x ^= x >> 15;
    (x >> 8) as f32 / (1u32 << 24) as f32
}

/// Camera-to-scene pose of a camera at `position` looking at `target`.
///
/// The optical frame has `x` right, `y` down and `z` along the view direction.
pub fn look_at(position: Vec3, target: Vec3) -> RigidTransform {
    let forward = (target - position).normalize_or(Vec3::NEG_Z);
    let up_hint = if forward.cross(Vec3::Z).length_squared() < 1e-6 {
        Vec3::Y
    } else {
        Vec3::Z
    };
    let right = forward.cross(up_hint).normalize();
    let down = forward.cross(right);
    RigidTransform::from_rotation_matrix(Mat3::from_cols(right, down, forward), position)
}

/// A depth camera with a fixed pose in a [`SyntheticScene`].
///
/// The scene is static, so the frame is rendered once and repeated with fresh
/// timestamps.
pub struct SyntheticCamera {
    intrinsics: Intrinsics,
    pose: RigidTransform,
    depth: DepthImage,
    color: RgbImage,
    fps: f32,
    clock: FrameClock,
    frame_count: u64,
    max_frames: Option<u64>,
    active: bool,
}

impl SyntheticCamera {
    pub fn new(
        scene: &SyntheticScene,
        position: Vec3,
        target: Vec3,
        intrinsics: Intrinsics,
        fps: f32,
        clock: FrameClock,
    ) -> Result<Self, CaptureError> {
        if !intrinsics.is_valid() || intrinsics.width == 0 || intrinsics.height == 0 {
            return Err(CaptureError::OpenFailed(format!(
                "invalid synthetic intrinsics {:?}",
                intrinsics
            )));
        }
        if !(fps > 0.0) {
            return Err(CaptureError::OpenFailed(format!("invalid frame rate {}", fps)));
        }
        if position.distance(target) < f32::EPSILON {
            return Err(CaptureError::OpenFailed(
                "camera position and target coincide".to_string(),
            ));
        }

        let pose = look_at(position, target);
        let (depth, color) = render(scene, &pose, &intrinsics);
        let valid = depth.pixels().filter(|p| p.0[0] > 0).count();
        info!(
            "Synthetic camera at {:?} rendered {}x{} ({} valid depth pixels)",
            position, intrinsics.width, intrinsics.height, valid
        );

        Ok(Self {
            intrinsics,
            pose,
            depth,
            color,
            fps,
            clock,
            frame_count: 0,
            max_frames: None,
            active: true,
        })
    }

    /// Square-pixel intrinsics centred on the image.
    pub fn pinhole(width: u32, height: u32, focal_px: f32) -> Intrinsics {
        Intrinsics::new(
            focal_px,
            focal_px,
            (width as f32 - 1.0) / 2.0,
            (height as f32 - 1.0) / 2.0,
            width,
            height,
        )
    }

    /// End the stream after `max_frames` frames.
    pub fn with_max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    /// Camera-to-scene pose.
    pub fn pose(&self) -> RigidTransform {
        self.pose
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl DepthSource for SyntheticCamera {
    fn next_frame(&mut self) -> Result<Option<RgbdFrame>, CaptureError> {
        if !self.active {
            return Ok(None);
        }
        if self.max_frames.is_some_and(|max| self.frame_count >= max) {
            debug!("Synthetic camera finished after {} frames", self.frame_count);
            self.active = false;
            return Ok(None);
        }

        // frame 0 would stamp every camera at exactly t = 0
        let n = self.frame_count + 1;
        let timestamp = self.clock.frame_time(n, self.fps);
        self.frame_count = n;

        Ok(Some(RgbdFrame::new(
            self.depth.clone(),
            Some(self.color.clone()),
            timestamp,
            n,
        )))
    }

    fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn frame_rate(&self) -> Option<f32> {
        Some(self.fps)
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) {
        self.active = false;
    }
}

fn render(scene: &SyntheticScene, pose: &RigidTransform, intrinsics: &Intrinsics) -> (DepthImage, RgbImage) {
    let rotation = pose.rotation_matrix();
    let origin = pose.translation;
    let mut depth = DepthImage::new(intrinsics.width, intrinsics.height);
    let mut color = RgbImage::new(intrinsics.width, intrinsics.height);

    for v in 0..intrinsics.height {
        for u in 0..intrinsics.width {
            // z = 1 in the camera frame, so the ray parameter is the depth
            let ray = Vec3::new(
                (u as f32 - intrinsics.cx) / intrinsics.fx,
                (v as f32 - intrinsics.cy) / intrinsics.fy,
                1.0,
            );
            let Some((t, rgb)) = scene.cast(origin, rotation * ray) else {
                continue;
            };
            let mm = t.round();
            if mm >= 1.0 && mm <= u16::MAX as f32 {
                depth.put_pixel(u, v, Luma([mm as u16]));
                color.put_pixel(u, v, Rgb(rgb));
            }
        }
    }

    (depth, color)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overhead(position: Vec3, target: Vec3) -> SyntheticCamera {
        SyntheticCamera::new(
            &SyntheticScene::crop_bed(),
            position,
            target,
            SyntheticCamera::pinhole(64, 48, 48.0),
            30.0,
            FrameClock::simulated(),
        )
        .unwrap()
    }

    #[test]
    fn test_look_at_straight_down() {
        let pose = look_at(Vec3::new(0.0, 0.0, 1000.0), Vec3::ZERO);
        let forward = pose.rotation_matrix() * Vec3::Z;
        assert!((forward - Vec3::NEG_Z).length() < 1e-5);
        let right = pose.rotation_matrix() * Vec3::X;
        assert!((right - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn test_look_at_horizontal_keeps_down_down() {
        let pose = look_at(Vec3::new(0.0, 0.0, 500.0), Vec3::new(1000.0, 0.0, 500.0));
        let down = pose.rotation_matrix() * Vec3::Y;
        assert!((down - Vec3::NEG_Z).length() < 1e-5);
    }

    #[test]
    fn test_center_pixel_sees_soil_or_plant() {
        let mut camera = overhead(Vec3::new(0.0, 0.0, 1000.0), Vec3::ZERO);
        let frame = camera.next_frame().unwrap().unwrap();
        let center = frame.depth.get_pixel(32, 24).0[0];
        // above the tallest plant, at most the camera height
        assert!(center > 850 && center <= 1001, "depth {}", center);
    }

    #[test]
    fn test_rendered_points_lie_on_scene_surfaces() {
        let mut camera = overhead(Vec3::new(100.0, -50.0, 900.0), Vec3::new(100.0, -50.0, 0.0));
        let pose = camera.pose();
        let intrinsics = camera.intrinsics();
        let frame = camera.next_frame().unwrap().unwrap();

        for (u, v, d) in frame.depth.enumerate_pixels() {
            let depth = d.0[0];
            if depth == 0 {
                continue;
            }
            let p = pose.apply(intrinsics.deproject(u as f32, v as f32, depth as f32));
            // every visible point is on or above the soil
            assert!(p.z > -2.0, "point below soil: {:?}", p);
        }
    }

    #[test]
    fn test_max_frames_and_timestamps() {
        let mut camera = overhead(Vec3::new(0.0, 0.0, 1000.0), Vec3::ZERO).with_max_frames(3);
        let times: Vec<f64> = std::iter::from_fn(|| camera.next_frame().unwrap())
            .map(|f| f.timestamp)
            .collect();
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[1] > w[0]));
        assert!(!camera.is_active());
    }

    #[test]
    fn test_invalid_camera_is_rejected() {
        let result = SyntheticCamera::new(
            &SyntheticScene::crop_bed(),
            Vec3::ZERO,
            Vec3::ZERO,
            SyntheticCamera::pinhole(8, 8, 8.0),
            30.0,
            FrameClock::simulated(),
        );
        assert!(matches!(result, Err(CaptureError::OpenFailed(_))));
    }
}
