//! Replay of recorded RGB-D frames from a directory.
//!
//! A recording holds `intrinsics.json`, 16-bit depth PNGs named
//! `depth_<n>.png` and optional 8-bit color PNGs named `color_<n>.png`.
//! Frames are replayed in file name order.

use crate::source::{CaptureError, DepthSource, FrameClock, RgbdFrame};
use image::RgbImage;
use rowscan_fusion::ingest::{DepthImage, Intrinsics};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INTRINSICS_FILE: &str = "intrinsics.json";
const DEPTH_PREFIX: &str = "depth_";
const COLOR_PREFIX: &str = "color_";

#[derive(Debug, Clone)]
struct RecordedFrame {
    depth: PathBuf,
    color: Option<PathBuf>,
}

/// Plays back a recording at a fixed frame rate.
pub struct PlaybackSource {
    directory: PathBuf,
    intrinsics: Intrinsics,
    frames: Vec<RecordedFrame>,
    fps: f32,
    looping: bool,
    clock: FrameClock,
    cursor: usize,
    frame_count: u64,
    active: bool,
}

impl PlaybackSource {
    pub fn open(
        directory: impl AsRef<Path>,
        fps: f32,
        looping: bool,
        clock: FrameClock,
    ) -> Result<Self, CaptureError> {
        let directory = directory.as_ref().to_path_buf();
        if !directory.is_dir() {
            return Err(CaptureError::DeviceNotFound(directory.display().to_string()));
        }
        if !(fps > 0.0) {
            return Err(CaptureError::OpenFailed(format!("invalid frame rate {}", fps)));
        }

        let intrinsics: Intrinsics =
            serde_json::from_slice(&fs::read(directory.join(INTRINSICS_FILE))?)?;
        if !intrinsics.is_valid() {
            return Err(CaptureError::UnsupportedFormat(format!(
                "unusable intrinsics in {}",
                directory.display()
            )));
        }

        let mut depth_files: Vec<(String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&directory)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(suffix) = name.strip_prefix(DEPTH_PREFIX).and_then(|s| s.strip_suffix(".png")) {
                depth_files.push((suffix.to_string(), path.clone()));
            }
        }
        depth_files.sort();

        if depth_files.is_empty() {
            return Err(CaptureError::OpenFailed(format!(
                "no depth frames in {}",
                directory.display()
            )));
        }

        let frames: Vec<RecordedFrame> = depth_files
            .into_iter()
            .map(|(suffix, depth)| {
                let color = directory.join(format!("{}{}.png", COLOR_PREFIX, suffix));
                RecordedFrame {
                    depth,
                    color: color.is_file().then_some(color),
                }
            })
            .collect();

        info!(
            "Opened recording {} ({} frames at {} fps{})",
            directory.display(),
            frames.len(),
            fps,
            if looping { ", looping" } else { "" }
        );

        Ok(Self {
            directory,
            intrinsics,
            frames,
            fps,
            looping,
            clock,
            cursor: 0,
            frame_count: 0,
            active: true,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Number of recorded frames (one loop).
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn load(&self, frame: &RecordedFrame) -> Result<(DepthImage, Option<RgbImage>), CaptureError> {
        let depth = image::open(&frame.depth)?.into_luma16();
        if depth.dimensions() != (self.intrinsics.width, self.intrinsics.height) {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} is {:?}, intrinsics are {}x{}",
                frame.depth.display(),
                depth.dimensions(),
                self.intrinsics.width,
                self.intrinsics.height
            )));
        }
        let color = match &frame.color {
            Some(path) => Some(image::open(path)?.into_rgb8()),
            None => None,
        };
        Ok((depth, color))
    }
}

impl DepthSource for PlaybackSource {
    fn next_frame(&mut self) -> Result<Option<RgbdFrame>, CaptureError> {
        if !self.active {
            return Ok(None);
        }
        if self.cursor >= self.frames.len() {
            if !self.looping {
                debug!("Recording {} finished", self.directory.display());
                self.active = false;
                return Ok(None);
            }
            self.cursor = 0;
        }

        let (depth, color) = self.load(&self.frames[self.cursor])?;
        self.cursor += 1;
        let n = self.frame_count + 1;
        let timestamp = self.clock.frame_time(n, self.fps);
        self.frame_count = n;

        Ok(Some(RgbdFrame::new(depth, color, timestamp, n)))
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

/// Write frames as a recording that [`PlaybackSource`] can replay.
pub fn save_recording(
    directory: impl AsRef<Path>,
    intrinsics: &Intrinsics,
    frames: &[RgbdFrame],
) -> Result<(), CaptureError> {
    let directory = directory.as_ref();
    fs::create_dir_all(directory)?;
    fs::write(
        directory.join(INTRINSICS_FILE),
        serde_json::to_vec_pretty(intrinsics)?,
    )?;
    for (i, frame) in frames.iter().enumerate() {
        frame
            .depth
            .save(directory.join(format!("{}{:06}.png", DEPTH_PREFIX, i)))?;
        if let Some(color) = &frame.color {
            color.save(directory.join(format!("{}{:06}.png", COLOR_PREFIX, i)))?;
        }
    }
    info!("Saved {} frames to {}", frames.len(), directory.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use tempfile::TempDir;

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(10.0, 10.0, 2.0, 1.5, 4, 3)
    }

    fn frame(depth_mm: u16, with_color: bool) -> RgbdFrame {
        RgbdFrame::new(
            DepthImage::from_pixel(4, 3, Luma([depth_mm])),
            with_color.then(|| RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]))),
            0.0,
            0,
        )
    }

    #[test]
    fn test_replays_in_order() {
        let dir = TempDir::new().unwrap();
        save_recording(dir.path(), &intrinsics(), &[frame(1000, true), frame(1200, false)]).unwrap();

        let mut source = PlaybackSource::open(dir.path(), 10.0, false, FrameClock::simulated()).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.intrinsics(), intrinsics());

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.depth.get_pixel(0, 0).0[0], 1000);
        assert!(first.color.is_some());

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.depth.get_pixel(3, 2).0[0], 1200);
        assert!(second.color.is_none());
        assert!(second.timestamp > first.timestamp);

        assert!(source.next_frame().unwrap().is_none());
        assert!(!source.is_active());
    }

    #[test]
    fn test_looping_keeps_timestamps_increasing() {
        let dir = TempDir::new().unwrap();
        save_recording(dir.path(), &intrinsics(), &[frame(900, false)]).unwrap();

        let mut source = PlaybackSource::open(dir.path(), 30.0, true, FrameClock::simulated()).unwrap();
        let times: Vec<f64> = (0..4)
            .map(|_| source.next_frame().unwrap().unwrap().timestamp)
            .collect();
        assert!(times.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_missing_directory() {
        let result = PlaybackSource::open("/nonexistent/recording", 30.0, false, FrameClock::simulated());
        assert!(matches!(result, Err(CaptureError::DeviceNotFound(_))));
    }

    #[test]
    fn test_empty_recording_is_rejected() {
        let dir = TempDir::new().unwrap();
        save_recording(dir.path(), &intrinsics(), &[]).unwrap();
        let result = PlaybackSource::open(dir.path(), 30.0, false, FrameClock::simulated());
        assert!(matches!(result, Err(CaptureError::OpenFailed(_))));
    }

    #[test]
    fn test_resolution_mismatch_is_reported() {
        let dir = TempDir::new().unwrap();
        let wrong = Intrinsics::new(10.0, 10.0, 2.0, 1.5, 8, 8);
        save_recording(dir.path(), &wrong, &[frame(1000, false)]).unwrap();

        let mut source = PlaybackSource::open(dir.path(), 30.0, false, FrameClock::simulated()).unwrap();
        assert!(matches!(
            source.next_frame(),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }
}
