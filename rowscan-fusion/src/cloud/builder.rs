//! Depth deprojection

use crate::config::CloudConfig;
use crate::ingest::{FrameSample, PointCloud, ReferenceFrame};
use image::RgbImage;
use rowscan_data::Point;
use tracing::{trace, warn};

/// Turns depth frames into camera-frame point clouds.
#[derive(Debug, Clone)]
pub struct CloudBuilder {
    config: CloudConfig,
}

impl CloudBuilder {
    pub fn new(config: CloudConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Deproject every valid depth pixel of `sample`.
    ///
    /// Pixels at or below the minimum depth (including zero, the sensor's
    /// "no data" value) or beyond the maximum depth are skipped. Points are
    /// colored from the color image when one is attached, resampled by nearest
    /// neighbor if its resolution differs from the depth map.
    pub fn build(&self, sample: &FrameSample) -> PointCloud {
        let intrinsics = &sample.intrinsics;
        let frame = ReferenceFrame::Camera(sample.camera_id.clone());
        if !intrinsics.is_valid() {
            warn!("Camera {} has unusable intrinsics", sample.camera_id);
            return PointCloud::with_timestamp(Vec::new(), frame, sample.timestamp);
        }

        let (width, height) = sample.dimensions();
        let color = sample.color.as_ref().map(|image| ColorLookup::new(image, width, height));
        let mut points = Vec::with_capacity((width * height) as usize / 2);

        for (u, v, pixel) in sample.depth.enumerate_pixels() {
            let depth = pixel.0[0] as f32 * self.config.depth_scale_mm;
            if depth <= self.config.min_depth_mm || depth > self.config.max_depth_mm {
                continue;
            }
            let position = intrinsics.deproject(u as f32, v as f32, depth);
            points.push(match &color {
                Some(lookup) => Point::colored(position, lookup.sample(u, v)),
                None => Point::new(position),
            });
        }

        trace!(
            "Built {} points from {}x{} frame of {}",
            points.len(),
            width,
            height,
            sample.camera_id
        );
        PointCloud::with_timestamp(points, frame, sample.timestamp)
    }
}

struct ColorLookup<'a> {
    image: &'a RgbImage,
    scale_x: f32,
    scale_y: f32,
}

impl<'a> ColorLookup<'a> {
    fn new(image: &'a RgbImage, depth_width: u32, depth_height: u32) -> Self {
        Self {
            image,
            scale_x: image.width() as f32 / depth_width.max(1) as f32,
            scale_y: image.height() as f32 / depth_height.max(1) as f32,
        }
    }

    fn sample(&self, u: u32, v: u32) -> [u8; 3] {
        let x = (((u as f32 + 0.5) * self.scale_x) as u32).min(self.image.width().saturating_sub(1));
        let y = (((v as f32 + 0.5) * self.scale_y) as u32).min(self.image.height().saturating_sub(1));
        self.image.get_pixel(x, y).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{CameraId, DepthImage, Intrinsics};
    use glam::Vec3;
    use image::{Luma, Rgb};

    fn sample_with_depth(depth: DepthImage) -> FrameSample {
        let (w, h) = depth.dimensions();
        FrameSample::new(
            CameraId::from("cam"),
            0.5,
            depth,
            Intrinsics::new(100.0, 100.0, (w as f32 - 1.0) / 2.0, (h as f32 - 1.0) / 2.0, w, h),
        )
    }

    #[test]
    fn test_zero_depth_produces_no_points() {
        let builder = CloudBuilder::new(CloudConfig::default());
        let cloud = builder.build(&sample_with_depth(DepthImage::new(4, 3)));
        assert!(cloud.is_empty());
        assert_eq!(cloud.timestamp, Some(0.5));
    }

    #[test]
    fn test_depth_range_is_enforced() {
        let builder = CloudBuilder::new(CloudConfig {
            min_depth_mm: 100.0,
            max_depth_mm: 2000.0,
            depth_scale_mm: 1.0,
        });
        let mut depth = DepthImage::new(3, 1);
        depth.put_pixel(0, 0, Luma([100]));
        depth.put_pixel(1, 0, Luma([1500]));
        depth.put_pixel(2, 0, Luma([2500]));

        let cloud = builder.build(&sample_with_depth(depth));
        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud.points[0].position.z, 1500.0);
    }

    #[test]
    fn test_principal_point_lies_on_optical_axis() {
        let builder = CloudBuilder::new(CloudConfig::default());
        let mut depth = DepthImage::new(3, 3);
        depth.put_pixel(1, 1, Luma([1000]));

        let cloud = builder.build(&sample_with_depth(depth));
        assert_eq!(cloud.points[0].position, Vec3::new(0.0, 0.0, 1000.0));
        assert_eq!(cloud.frame, ReferenceFrame::Camera(CameraId::from("cam")));
    }

    #[test]
    fn test_depth_scale_converts_units() {
        let builder = CloudBuilder::new(CloudConfig {
            depth_scale_mm: 0.25,
            ..CloudConfig::default()
        });
        let mut depth = DepthImage::new(1, 1);
        depth.put_pixel(0, 0, Luma([4000]));
        let cloud = builder.build(&sample_with_depth(depth));
        assert_eq!(cloud.points[0].position.z, 1000.0);
    }

    #[test]
    fn test_color_is_resampled_to_depth_resolution() {
        let builder = CloudBuilder::new(CloudConfig::default());
        let mut depth = DepthImage::new(2, 1);
        depth.put_pixel(0, 0, Luma([800]));
        depth.put_pixel(1, 0, Luma([800]));
        // color at twice the depth resolution: left half red, right half blue
        let color = RgbImage::from_fn(4, 2, |x, _| if x < 2 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) });

        let cloud = builder.build(&sample_with_depth(depth).with_color(color));
        assert_eq!(cloud.points[0].color, Some([255, 0, 0]));
        assert_eq!(cloud.points[1].color, Some([0, 0, 255]));
    }
}
