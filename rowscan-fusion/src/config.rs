//! Configuration for the fusion subsystem.
//!
//! Every section implements `Default` and is marked `#[serde(default)]`, so a
//! config file only needs to name the values it changes.

use crate::error::ConfigError;
use crate::ingest::CameraId;
use rowscan_data::PlyEncoding;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub sync: SyncConfig,
    pub cloud: CloudConfig,
    pub alignment: AlignmentConfig,
    pub filter: FusionFilterConfig,
    pub calibration: CalibrationConfig,
    pub export: ExportConfig,
    pub cameras: Vec<CameraSourceConfig>,
}

impl FusionConfig {
    /// Load a JSON config file.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!("Loaded config with {} cameras", config.cameras.len());
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.capacity == 0 {
            return Err(ConfigError::invalid("sync.capacity", "must be at least 1"));
        }
        if !(self.sync.tolerance_ms > 0.0) {
            return Err(ConfigError::invalid("sync.tolerance_ms", "must be positive"));
        }
        if !(self.cloud.max_depth_mm > self.cloud.min_depth_mm) {
            return Err(ConfigError::invalid(
                "cloud.max_depth_mm",
                "must be greater than cloud.min_depth_mm",
            ));
        }
        if !(self.cloud.depth_scale_mm > 0.0) {
            return Err(ConfigError::invalid("cloud.depth_scale_mm", "must be positive"));
        }
        if self.alignment.stages.is_empty() {
            return Err(ConfigError::invalid("alignment.stages", "at least one stage is required"));
        }
        for stage in &self.alignment.stages {
            if !(stage.max_correspondence_mm > 0.0) || stage.voxel_size_mm < 0.0 {
                return Err(ConfigError::invalid(
                    "alignment.stages",
                    "correspondence distance must be positive and voxel size non-negative",
                ));
            }
        }
        if self.alignment.min_correspondences < 3 {
            return Err(ConfigError::invalid(
                "alignment.min_correspondences",
                "a rigid fit needs at least 3 correspondences",
            ));
        }
        if self.alignment.collect_sets == 0 {
            return Err(ConfigError::invalid("alignment.collect_sets", "must be at least 1"));
        }
        if self.filter.voxel_size_mm < 0.0 {
            return Err(ConfigError::invalid("filter.voxel_size_mm", "must not be negative"));
        }
        if self.filter.remove_outliers && self.filter.outlier_neighbors == 0 {
            return Err(ConfigError::invalid("filter.outlier_neighbors", "must be at least 1"));
        }
        let mut ids: Vec<&CameraId> = self.cameras.iter().map(|c| &c.id).collect();
        ids.sort();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::invalid("cameras", "camera ids must be unique"));
        }
        Ok(())
    }

    /// Cameras that should actually be started.
    pub fn active_cameras(&self) -> impl Iterator<Item = &CameraSourceConfig> {
        self.cameras.iter().filter(|c| !c.ignored)
    }
}

/// Synchronization queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Ring buffer capacity per camera.
    pub capacity: usize,
    /// Maximum timestamp spread within one synchronized set.
    pub tolerance_ms: f64,
    /// A camera silent for longer than this is left out of synchronized sets.
    pub grace_period_ms: u64,
    /// How long fusion waits for a synchronized set before giving up.
    pub timeout_ms: u64,
    /// Sleep between polls while waiting.
    pub poll_interval_ms: u64,
    /// Camera whose newest frame anchors each set. Defaults to the alignment
    /// reference camera, then to the newest buffered frame of any camera.
    pub reference_camera: Option<CameraId>,
}

impl SyncConfig {
    pub fn tolerance_secs(&self) -> f64 {
        self.tolerance_ms / 1000.0
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            tolerance_ms: 50.0,
            grace_period_ms: 1000,
            timeout_ms: 2000,
            poll_interval_ms: 5,
            reference_camera: None,
        }
    }
}

/// Depth deprojection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Depth values at or below this distance are treated as invalid.
    pub min_depth_mm: f32,
    /// Depth values beyond this distance are treated as invalid.
    pub max_depth_mm: f32,
    /// Millimeters per raw depth unit.
    pub depth_scale_mm: f32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            min_depth_mm: 0.0,
            max_depth_mm: 6000.0,
            depth_scale_mm: 1.0,
        }
    }
}

/// One resolution level of the coarse-to-fine ICP schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IcpStage {
    /// Both clouds are voxel-downsampled to this size before the stage runs
    /// (0 disables downsampling).
    pub voxel_size_mm: f32,
    /// Correspondences farther apart than this are ignored.
    pub max_correspondence_mm: f32,
    pub max_iterations: usize,
}

/// Alignment engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Camera that defines the shared frame. Defaults to the first camera in
    /// id order among the collected sets.
    pub reference_camera: Option<CameraId>,
    /// Number of synchronized sets accumulated before computing.
    pub collect_sets: usize,
    /// Deadline for collecting those sets.
    pub collect_timeout_ms: u64,
    pub stages: Vec<IcpStage>,
    /// Fewer correspondences than this fail the alignment.
    pub min_correspondences: usize,
    /// Stage convergence: relative change in fitness below this...
    pub relative_fitness: f64,
    /// ...and relative change in RMSE below this.
    pub relative_rmse: f64,
    /// A residual this many times the initial one counts as divergence.
    pub divergence_ratio: f64,
}

impl AlignmentConfig {
    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.collect_timeout_ms)
    }
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            reference_camera: None,
            collect_sets: 3,
            collect_timeout_ms: 5000,
            stages: vec![
                IcpStage {
                    voxel_size_mm: 40.0,
                    max_correspondence_mm: 40.0,
                    max_iterations: 50,
                },
                IcpStage {
                    voxel_size_mm: 20.0,
                    max_correspondence_mm: 20.0,
                    max_iterations: 30,
                },
                IcpStage {
                    voxel_size_mm: 10.0,
                    max_correspondence_mm: 10.0,
                    max_iterations: 14,
                },
            ],
            min_correspondences: 30,
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            divergence_ratio: 4.0,
        }
    }
}

/// Post-merge density and noise filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionFilterConfig {
    /// Voxel-grid cell size; 0 disables downsampling.
    pub voxel_size_mm: f32,
    pub remove_outliers: bool,
    /// Neighbors considered per point by the outlier filter.
    pub outlier_neighbors: usize,
    /// Points whose mean neighbor distance exceeds mean + ratio * stddev are dropped.
    pub outlier_std_ratio: f32,
}

impl Default for FusionFilterConfig {
    fn default() -> Self {
        Self {
            voxel_size_mm: 5.0,
            remove_outliers: true,
            outlier_neighbors: 20,
            outlier_std_ratio: 2.0,
        }
    }
}

/// Calibration persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Directory holding one JSON record per camera. `None` keeps calibration
    /// in memory only.
    pub directory: Option<PathBuf>,
    /// Keep superseded records (in memory and under `history/`).
    pub keep_history: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            directory: Some(PathBuf::from("data/calibration")),
            keep_history: false,
        }
    }
}

/// Export layout and options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Root of the `<line>/row_<row>/capture_<n>` tree.
    pub directory: PathBuf,
    pub encoding: PlyEncoding,
    /// Also write each contributing camera's cloud.
    pub camera_clouds: bool,
    /// Also write each contributing camera's color frame as PNG.
    pub color_frames: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/pointclouds"),
            encoding: PlyEncoding::BinaryLittleEndian,
            camera_clouds: true,
            color_frames: true,
        }
    }
}

/// How to open one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSourceConfig {
    pub id: CameraId,
    /// Configured but never started.
    #[serde(default)]
    pub ignored: bool,
    #[serde(flatten)]
    pub source: SourceKind,
}

/// Frame source backends available without vendor SDKs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Renders a synthetic crop bed from a fixed pose.
    Synthetic {
        /// Camera position in the scene (millimeters).
        position: [f32; 3],
        /// Point the camera looks at.
        target: [f32; 3],
        #[serde(default = "default_synthetic_width")]
        width: u32,
        #[serde(default = "default_synthetic_height")]
        height: u32,
        #[serde(default = "default_synthetic_focal")]
        focal_px: f32,
        #[serde(default = "default_fps")]
        fps: f32,
    },
    /// Replays recorded depth/color PNGs from a directory.
    Playback {
        directory: PathBuf,
        #[serde(default = "default_fps")]
        fps: f32,
        #[serde(default)]
        looping: bool,
    },
}

fn default_synthetic_width() -> u32 {
    160
}

fn default_synthetic_height() -> u32 {
    120
}

fn default_synthetic_focal() -> f32 {
    120.0
}

fn default_fps() -> f32 {
    30.0
}
