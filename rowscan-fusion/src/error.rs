//! Error types for the fusion core.

use crate::ingest::CameraId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures reported to the control layer.
///
/// Degradable conditions (a camera without recent frames, a camera without
/// calibration) normally never surface as errors; they are recorded in the
/// provenance of the fused cloud instead.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("Camera {0} unavailable: no recent frames")]
    CameraUnavailable(CameraId),

    #[error("No synchronized frame set formed within {0:?}")]
    SyncTimeout(Duration),

    #[error("Insufficient overlap for camera {camera}: {found} correspondences, need {required}")]
    InsufficientOverlap {
        camera: CameraId,
        found: usize,
        required: usize,
    },

    #[error("Alignment of camera {camera} diverged: residual {residual:.3} mm² (initial {initial:.3} mm²)")]
    AlignmentDiverged {
        camera: CameraId,
        residual: f64,
        initial: f64,
    },

    #[error("Alignment cancelled")]
    AlignmentCancelled,

    #[error("No calibrated camera in the synchronized set")]
    CalibrationMissing,

    #[error("Corrupt calibration record {path}: {reason}")]
    CorruptCalibrationRecord { path: PathBuf, reason: String },

    #[error("Failed to write {path}: {reason}")]
    StorageWriteFailure { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FusionError {
    /// Whether the caller may simply try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FusionError::CameraUnavailable(_)
                | FusionError::SyncTimeout(_)
                | FusionError::InsufficientOverlap { .. }
                | FusionError::AlignmentDiverged { .. }
                | FusionError::AlignmentCancelled
                | FusionError::StorageWriteFailure { .. }
        )
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        FusionError::StorageWriteFailure {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
