//! Writing fused clouds to disk.
//!
//! Layout, rooted at the configured export directory:
//!
//! ```text
//! <line>/row_<row>/capture_<n>/
//!     fused.ply             fused cloud, provenance in header comments
//!     metadata.json         provenance plus the list of written files
//!     camera-<id>.ply       per-camera cloud in the shared frame (optional)
//!     rgb-camera-<id>.png   per-camera color frame (optional)
//! ```
//!
//! Capture directories are created exclusively and never written to again.

use crate::config::ExportConfig;
use crate::error::FusionError;
use crate::fusion::{FusedCloud, Provenance};
use crate::ingest::CameraId;
use parking_lot::Mutex;
use rowscan_data::{PlyEncoding, PlyWriter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Version of the on-disk capture layout.
pub const LAYOUT_VERSION: u32 = 1;

pub const FUSED_FILE: &str = "fused.ply";
pub const METADATA_FILE: &str = "metadata.json";

/// Operator-supplied context of an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub session_id: Uuid,
    /// Crop line name, used as a directory name.
    pub line: String,
    pub row: u32,
}

impl CaptureSession {
    pub fn new(line: impl Into<String>, row: u32) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            line: line.into(),
            row,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let line = self.line.as_str();
        if line.is_empty() || line == "." || line == ".." {
            return Err(format!("invalid line name {:?}", line));
        }
        if line.contains(['/', '\\', '\0']) {
            return Err(format!("line name {:?} contains a path separator", line));
        }
        Ok(())
    }
}

/// Where an export landed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportHandle {
    pub directory: PathBuf,
    pub fused_path: PathBuf,
    pub metadata_path: PathBuf,
    pub sequence_number: u64,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub layout_version: u32,
    pub encoding: PlyEncoding,
    pub provenance: Provenance,
    pub fused_file: String,
    #[serde(default)]
    pub camera_files: BTreeMap<CameraId, String>,
    #[serde(default)]
    pub color_files: BTreeMap<CameraId, String>,
}

/// Assigns sequence numbers and writes capture directories.
pub struct Exporter {
    config: ExportConfig,
    /// Last sequence number handed out per (line, row).
    sequences: Mutex<BTreeMap<(String, u32), u64>>,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            config,
            sequences: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.directory
    }

    /// Directory holding all captures of one row.
    pub fn row_directory(&self, session: &CaptureSession) -> PathBuf {
        self.config
            .directory
            .join(&session.line)
            .join(format!("row_{}", session.row))
    }

    /// Write `fused` under the next sequence number of the session's row.
    ///
    /// On failure the partially written capture directory is removed and the
    /// sequence number is not consumed, so the same cloud can be exported again.
    #[tracing::instrument(skip_all, fields(line = %session.line, row = session.row))]
    pub fn export(
        &self,
        fused: &FusedCloud,
        session: &CaptureSession,
    ) -> Result<ExportHandle, FusionError> {
        let row_dir = self.row_directory(session);
        session
            .validate()
            .map_err(|reason| FusionError::storage(&row_dir, reason))?;

        let key = (session.line.clone(), session.row);
        let mut sequences = self.sequences.lock();
        fs::create_dir_all(&row_dir).map_err(|e| FusionError::storage(&row_dir, e))?;
        let on_disk = highest_capture(&row_dir).map_err(|e| FusionError::storage(&row_dir, e))?;
        let sequence_number = sequences.get(&key).copied().unwrap_or(0).max(on_disk) + 1;

        let directory = row_dir.join(format!("capture_{}", sequence_number));
        fs::create_dir(&directory).map_err(|e| FusionError::storage(&directory, e))?;

        match self.write_capture(fused, session, sequence_number, &directory) {
            Ok(handle) => {
                sequences.insert(key, sequence_number);
                info!(
                    "Exported {} points to {}",
                    fused.len(),
                    handle.directory.display()
                );
                Ok(handle)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&directory) {
                    warn!(
                        "Could not remove incomplete capture {}: {}",
                        directory.display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    fn write_capture(
        &self,
        fused: &FusedCloud,
        session: &CaptureSession,
        sequence_number: u64,
        directory: &Path,
    ) -> Result<ExportHandle, FusionError> {
        let mut provenance = fused.provenance.clone();
        provenance.session = Some(session.clone());
        provenance.sequence_number = Some(sequence_number);

        let fused_path = directory.join(FUSED_FILE);
        self.writer(&provenance)
            .write_new_file(&fused_path, &fused.cloud.points)
            .map_err(|e| FusionError::storage(&fused_path, e))?;

        let mut camera_files = BTreeMap::new();
        if self.config.camera_clouds {
            for (camera, cloud) in &fused.camera_clouds {
                let name = format!("camera-{}.ply", camera.file_stem());
                let path = directory.join(&name);
                PlyWriter::new(self.config.encoding)
                    .with_comment(format!("camera {}", camera))
                    .with_comment(format!("sequence {}", sequence_number))
                    .write_new_file(&path, &cloud.points)
                    .map_err(|e| FusionError::storage(&path, e))?;
                camera_files.insert(camera.clone(), name);
            }
        }

        let mut color_files = BTreeMap::new();
        if self.config.color_frames {
            for (camera, image) in &fused.color_frames {
                let name = format!("rgb-camera-{}.png", camera.file_stem());
                let path = directory.join(&name);
                image
                    .save_with_format(&path, image::ImageFormat::Png)
                    .map_err(|e| FusionError::storage(&path, e))?;
                color_files.insert(camera.clone(), name);
            }
        }

        let metadata = ExportMetadata {
            layout_version: LAYOUT_VERSION,
            encoding: self.config.encoding,
            provenance,
            fused_file: FUSED_FILE.to_string(),
            camera_files,
            color_files,
        };
        let metadata_path = directory.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| FusionError::storage(&metadata_path, e))?;
        fs::write(&metadata_path, json).map_err(|e| FusionError::storage(&metadata_path, e))?;

        Ok(ExportHandle {
            directory: directory.to_path_buf(),
            fused_path,
            metadata_path,
            sequence_number,
        })
    }

    fn writer(&self, provenance: &Provenance) -> PlyWriter {
        let cameras: Vec<&str> = provenance
            .contributing_camera_ids
            .iter()
            .map(CameraId::as_str)
            .collect();
        let mut writer = PlyWriter::new(self.config.encoding)
            .with_comment(format!("rowscan layout {}", LAYOUT_VERSION))
            .with_comment(format!("timestamp {}", provenance.timestamp.to_rfc3339()))
            .with_comment(format!("cameras {}", cameras.join(",")));
        if let Some(session) = &provenance.session {
            writer = writer
                .with_comment(format!("session {}", session.session_id))
                .with_comment(format!("line {}", session.line))
                .with_comment(format!("row {}", session.row));
        }
        if let Some(sequence) = provenance.sequence_number {
            writer = writer.with_comment(format!("sequence {}", sequence));
        }
        writer
    }
}

/// Highest `capture_<n>` number in `row_dir`, 0 if none.
fn highest_capture(row_dir: &Path) -> std::io::Result<u64> {
    let mut highest = 0;
    for entry in fs::read_dir(row_dir)? {
        let name = entry?.file_name();
        let number = name
            .to_str()
            .and_then(|name| name.strip_prefix("capture_"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(n) = number {
            highest = highest.max(n);
        }
    }
    Ok(highest)
}
