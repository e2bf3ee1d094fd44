//! Align and fuse three synthetic cameras looking down at a crop bed.
//!
//! Run with: cargo run --example synthetic_fusion [output-dir]

use rowscan::fusion::config::{CameraSourceConfig, SourceKind};
use rowscan::{CameraId, CaptureSession, FrameClock, FusionConfig, FusionService, open_sources};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

fn camera(id: &str, position: [f32; 3], target: [f32; 3]) -> CameraSourceConfig {
    CameraSourceConfig {
        id: CameraId::from(id),
        ignored: false,
        source: SourceKind::Synthetic {
            position,
            target,
            width: 160,
            height: 120,
            focal_px: 120.0,
            fps: 30.0,
        },
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let output = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("rowscan-demo"));

    let mut config = FusionConfig::default();
    config.calibration.directory = Some(output.join("calibration"));
    config.export.directory = output.join("pointclouds");
    config.alignment.reference_camera = Some(CameraId::from("10.95.76.11"));
    config.cameras = vec![
        camera("10.95.76.11", [0.0, 0.0, 1200.0], [0.0, 0.0, 0.0]),
        camera("10.95.76.12", [25.0, 10.0, 1200.0], [25.0, 10.0, 0.0]),
        camera("10.95.76.13", [-20.0, -15.0, 1190.0], [-20.0, -15.0, 0.0]),
    ];

    let sources = open_sources(&config, FrameClock::realtime())?;
    let service = FusionService::new(config)?;
    for source in sources {
        service.attach_source(source)?;
    }
    std::thread::sleep(Duration::from_millis(300));

    let summary = service.align_cameras()?;
    for aligned in summary.registered() {
        info!(
            "{} -> translation {:?}",
            aligned.camera_id, aligned.transform.translation
        );
    }

    let session = CaptureSession::new("demo_line", 1);
    let handle = service.export_current_fusion(&session)?;
    info!(
        "Capture {} written to {}",
        handle.sequence_number,
        handle.directory.display()
    );

    service.shutdown();
    Ok(())
}
