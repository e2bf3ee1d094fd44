//! Rowscan Application
//!
//! Operator command line for a multi-camera capture rig:
//! - Align cameras against the reference camera
//! - Export fused clouds for a crop line and row
//! - Reset calibration
//! - Show calibration status

mod app;

use app::AppBuilder;
use clap::{Parser, Subcommand};
use rowscan_fusion::FusionConfig;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

/// Rowscan - Multi-camera RGB-D capture fusion
#[derive(Parser, Debug)]
#[command(name = "rowscan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the calibration directory
    #[arg(long)]
    calibration_dir: Option<PathBuf>,

    /// Override the export directory
    #[arg(long)]
    export_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register every camera against the reference camera
    Align {
        /// Milliseconds to let cameras stream before aligning
        #[arg(long, default_value_t = 500)]
        warmup_ms: u64,
    },
    /// Fuse and export synchronized captures
    Export {
        /// Crop line name
        #[arg(long)]
        line: String,
        /// Row number within the line
        #[arg(long)]
        row: u32,
        /// Number of captures to export
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        #[arg(long, default_value_t = 500)]
        warmup_ms: u64,
    },
    /// Reset calibration of one camera, or of every camera
    Reset {
        #[arg(long)]
        camera: Option<String>,
    },
    /// Show calibration status
    Status,
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => FusionConfig::from_path(path)?,
        None => FusionConfig::default(),
    };

    let capture = matches!(args.command, Command::Align { .. } | Command::Export { .. });
    let mut builder = AppBuilder::new()
        .with_config(config)
        .with_log_level(args.log_level)
        .with_capture(capture);
    if let Some(directory) = args.calibration_dir {
        builder = builder.with_calibration_dir(directory);
    }
    if let Some(directory) = args.export_dir {
        builder = builder.with_export_dir(directory);
    }
    let app = builder.build()?;

    match args.command {
        Command::Align { warmup_ms } => app.align(Duration::from_millis(warmup_ms)),
        Command::Export {
            line,
            row,
            count,
            warmup_ms,
        } => app.export(line, row, count, Duration::from_millis(warmup_ms)),
        Command::Reset { camera } => app.reset(camera),
        Command::Status => app.status(),
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}
