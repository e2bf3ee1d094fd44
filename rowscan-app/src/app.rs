//! Application state and command handlers with builder pattern.

use rowscan_capture::{FrameClock, open_sources};
use rowscan_fusion::{CameraId, CaptureSession, FusionConfig, FusionService};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Logging configuration.
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Builds an [`App`] from a config file and command line overrides.
pub struct AppBuilder {
    config: FusionConfig,
    logging: LoggingConfig,
    capture: bool,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: FusionConfig::default(),
            logging: LoggingConfig::default(),
            capture: true,
        }
    }

    pub fn with_config(mut self, config: FusionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    pub fn with_calibration_dir(mut self, directory: PathBuf) -> Self {
        self.config.calibration.directory = Some(directory);
        self
    }

    pub fn with_export_dir(mut self, directory: PathBuf) -> Self {
        self.config.export.directory = directory;
        self
    }

    /// Whether to start the configured cameras. Commands that only touch
    /// calibration run without them.
    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn build(self) -> Result<App, Box<dyn Error>> {
        self.init_logging();

        let sources = if self.capture {
            open_sources(&self.config, FrameClock::realtime())?
        } else {
            Vec::new()
        };
        let service = FusionService::new(self.config)?;
        for source in sources {
            service.attach_source(source)?;
        }
        Ok(App { service })
    }

    fn init_logging(&self) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.logging.level)),
            )
            .with_target(false)
            .init();
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running fusion service plus its capture threads.
pub struct App {
    service: FusionService,
}

impl App {
    /// Give the cameras time to fill the synchronization buffers.
    fn warm_up(&self, warmup: Duration) {
        if !warmup.is_zero() {
            info!("Warming up cameras for {:?}", warmup);
            std::thread::sleep(warmup);
        }
    }

    pub fn align(&self, warmup: Duration) -> Result<(), Box<dyn Error>> {
        self.warm_up(warmup);
        let summary = self.service.align_cameras()?;
        println!(
            "alignment {} against reference {}",
            summary.session_id, summary.reference_camera
        );
        for aligned in summary.registered() {
            let quality = aligned.quality();
            println!(
                "  {:<16} aligned  fitness {:.3}  rmse {:.2} mm  translation {:?}",
                aligned.camera_id.as_str(),
                quality.as_ref().map_or(0.0, |q| q.fitness),
                quality.as_ref().map_or(0.0, |q| q.inlier_rmse),
                aligned.transform.translation.to_array()
            );
        }
        for (camera, error) in &summary.failed {
            println!("  {:<16} failed   {}", camera.as_str(), error);
        }
        Ok(())
    }

    pub fn export(
        &self,
        line: String,
        row: u32,
        count: u32,
        warmup: Duration,
    ) -> Result<(), Box<dyn Error>> {
        self.warm_up(warmup);
        let session = CaptureSession::new(line, row);
        for _ in 0..count {
            let handle = self.service.export_current_fusion(&session)?;
            println!(
                "capture {} -> {}",
                handle.sequence_number,
                handle.directory.display()
            );
        }
        Ok(())
    }

    pub fn reset(&self, camera: Option<String>) -> Result<(), Box<dyn Error>> {
        let camera = camera.map(CameraId::from);
        let reset = self.service.reset_calibration(camera.as_ref())?;
        match camera {
            Some(camera) if reset == 0 => println!("camera {} was not calibrated", camera),
            Some(camera) => println!("calibration of {} reset", camera),
            None => println!("calibration reset for {} cameras", reset),
        }
        Ok(())
    }

    pub fn status(&self) -> Result<(), Box<dyn Error>> {
        let status = self.service.fusion_status();
        let calibration = self.service.calibration().snapshot();

        println!("calibrated cameras: {}", status.calibrated_camera_ids.len());
        for extrinsics in calibration.iter() {
            println!(
                "  {:<16} v{}  computed {}  translation {:?}",
                extrinsics.camera_id.as_str(),
                extrinsics.version,
                extrinsics.computed_at.to_rfc3339(),
                extrinsics.transform.translation.to_array()
            );
        }
        for camera in &self.service.config().cameras {
            if !calibration.is_calibrated(&camera.id) {
                let note = if camera.ignored { " (ignored)" } else { "" };
                println!("  {:<16} uncalibrated{}", camera.id.as_str(), note);
            }
        }
        if let Some(session) = status.alignment {
            println!("last alignment: {} {:?}", session.id, session.status);
        }
        Ok(())
    }
}
