//! Rowscan Capture - RGB-D frame sources
//!
//! This crate provides implementations of the `FrameSource` trait from
//! rowscan-fusion:
//!
//! - Synthetic cameras ray casting a crop bed from a fixed pose
//! - Playback of recorded depth/color PNG sequences
//!
//! Vendor camera SDKs plug in the same way: implement [`DepthSource`] for the
//! device and wrap it in an [`IdentifiedSource`].
//!
//! ## Example
//!
//! ```ignore
//! use rowscan_capture::{FrameClock, open_sources};
//! use rowscan_fusion::{FusionConfig, FusionService};
//!
//! let config = FusionConfig::from_path("rowscan.json")?;
//! let service = FusionService::new(config.clone())?;
//! for source in open_sources(&config, FrameClock::realtime())? {
//!     service.attach_source(source)?;
//! }
//! ```

mod playback;
mod source;
mod synthetic;

pub use playback::{PlaybackSource, save_recording};
pub use source::{CaptureError, DepthSource, FrameClock, IdentifiedSource, RgbdFrame};
pub use synthetic::{Mound, SyntheticCamera, SyntheticScene, look_at};

use glam::Vec3;
use rowscan_fusion::FusionConfig;
use rowscan_fusion::config::{CameraSourceConfig, SourceKind};
use rowscan_fusion::ingest::FrameSource;
use tracing::info;

/// Open the source described by one camera entry.
pub fn open_source(
    config: &CameraSourceConfig,
    clock: FrameClock,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match &config.source {
        SourceKind::Synthetic {
            position,
            target,
            width,
            height,
            focal_px,
            fps,
        } => {
            let camera = SyntheticCamera::new(
                &SyntheticScene::crop_bed(),
                Vec3::from_array(*position),
                Vec3::from_array(*target),
                SyntheticCamera::pinhole(*width, *height, *focal_px),
                *fps,
                clock,
            )?;
            Ok(Box::new(IdentifiedSource::new(config.id.clone(), camera)))
        }
        SourceKind::Playback {
            directory,
            fps,
            looping,
        } => {
            let playback = PlaybackSource::open(directory, *fps, *looping, clock)?;
            Ok(Box::new(IdentifiedSource::new(config.id.clone(), playback)))
        }
    }
}

/// Open every camera that is not marked as ignored, sharing one clock.
pub fn open_sources(
    config: &FusionConfig,
    clock: FrameClock,
) -> Result<Vec<Box<dyn FrameSource>>, CaptureError> {
    let sources = config
        .active_cameras()
        .map(|camera| open_source(camera, clock))
        .collect::<Result<Vec<_>, _>>()?;
    info!("Opened {} camera sources", sources.len());
    Ok(sources)
}
