//! Persistent calibration store.
//!
//! Readers take an `Arc` of the current snapshot and never block writers for
//! longer than a pointer swap; writers clone the snapshot when a reader still
//! holds it. Every camera's version counter is monotonic for the lifetime of
//! the store, so a reset followed by a new alignment never reuses a version.

use crate::calibration::{
    AlignmentQuality, CameraExtrinsics, ExtrinsicsRecord, RigidTransform,
};
use crate::config::CalibrationConfig;
use crate::error::FusionError;
use crate::ingest::CameraId;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECORD_PREFIX: &str = "extrinsics_";
const HISTORY_DIR: &str = "history";

/// Immutable view of all calibration state at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSnapshot {
    active: BTreeMap<CameraId, CameraExtrinsics>,
    history: BTreeMap<CameraId, Vec<CameraExtrinsics>>,
    versions: BTreeMap<CameraId, u64>,
}

impl CalibrationSnapshot {
    pub fn get(&self, camera: &CameraId) -> Option<&CameraExtrinsics> {
        self.active.get(camera)
    }

    pub fn is_calibrated(&self, camera: &CameraId) -> bool {
        self.active.contains_key(camera)
    }

    pub fn calibrated_cameras(&self) -> Vec<CameraId> {
        self.active.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CameraExtrinsics> {
        self.active.values()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Superseded records for `camera`, oldest first.
    pub fn history(&self, camera: &CameraId) -> &[CameraExtrinsics] {
        self.history.get(camera).map_or(&[], Vec::as_slice)
    }

    /// Highest version ever issued for `camera`.
    pub fn latest_version(&self, camera: &CameraId) -> u64 {
        self.versions.get(camera).copied().unwrap_or(0)
    }

    fn next_version(&mut self, camera: &CameraId) -> u64 {
        let version = self.versions.entry(camera.clone()).or_insert(0);
        *version += 1;
        *version
    }

    fn supersede(&mut self, camera: &CameraId, keep_history: bool) -> Option<CameraExtrinsics> {
        let previous = self.active.remove(camera)?;
        if keep_history {
            self.history
                .entry(camera.clone())
                .or_default()
                .push(previous.clone());
        }
        Some(previous)
    }
}

/// Outcome of [`CalibrationStore::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<CameraId>,
    /// Records that could not be used; their cameras stay uncalibrated.
    pub rejected: Vec<FusionError>,
}

/// Camera extrinsics shared between alignment, fusion and the control layer.
pub struct CalibrationStore {
    directory: Option<PathBuf>,
    keep_history: bool,
    snapshot: RwLock<Arc<CalibrationSnapshot>>,
}

impl CalibrationStore {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            keep_history: config.keep_history,
            snapshot: RwLock::new(Arc::new(CalibrationSnapshot::default())),
        }
    }

    /// A store without a backing directory.
    pub fn in_memory() -> Self {
        Self::new(&CalibrationConfig {
            directory: None,
            keep_history: false,
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Current state; cheap to take and consistent across cameras.
    pub fn snapshot(&self) -> Arc<CalibrationSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn get(&self, camera: &CameraId) -> Option<CameraExtrinsics> {
        self.snapshot.read().get(camera).cloned()
    }

    pub fn is_calibrated(&self, camera: &CameraId) -> bool {
        self.snapshot.read().is_calibrated(camera)
    }

    pub fn calibrated_cameras(&self) -> Vec<CameraId> {
        self.snapshot.read().calibrated_cameras()
    }

    /// Replace `camera`'s extrinsics, returning the stored record.
    pub fn put(
        &self,
        camera: &CameraId,
        transform: RigidTransform,
        quality: Option<AlignmentQuality>,
    ) -> CameraExtrinsics {
        let mut stored = self.put_all(vec![(camera.clone(), transform, quality)]);
        // put_all returns exactly one record per input
        stored.remove(0)
    }

    /// Replace several cameras' extrinsics in one step, so readers see either
    /// all or none of them.
    pub fn put_all(
        &self,
        updates: Vec<(CameraId, RigidTransform, Option<AlignmentQuality>)>,
    ) -> Vec<CameraExtrinsics> {
        let computed_at = Utc::now();
        let mut guard = self.snapshot.write();
        let snapshot = Arc::make_mut(&mut guard);
        updates
            .into_iter()
            .map(|(camera, transform, quality)| {
                snapshot.supersede(&camera, self.keep_history);
                let extrinsics = CameraExtrinsics {
                    version: snapshot.next_version(&camera),
                    camera_id: camera.clone(),
                    transform,
                    computed_at,
                    quality,
                };
                info!("Camera {} calibrated (version {})", camera, extrinsics.version);
                snapshot.active.insert(camera, extrinsics.clone());
                extrinsics
            })
            .collect()
    }

    /// Return `camera` to the uncalibrated state. Returns whether it was calibrated.
    pub fn reset(&self, camera: &CameraId) -> bool {
        let mut guard = self.snapshot.write();
        if !guard.is_calibrated(camera) {
            return false;
        }
        let snapshot = Arc::make_mut(&mut guard);
        snapshot.supersede(camera, self.keep_history);
        info!("Calibration for {} reset", camera);
        true
    }

    /// Return every camera to the uncalibrated state.
    pub fn reset_all(&self) -> usize {
        let mut guard = self.snapshot.write();
        let cameras = guard.calibrated_cameras();
        if cameras.is_empty() {
            return 0;
        }
        let snapshot = Arc::make_mut(&mut guard);
        for camera in &cameras {
            snapshot.supersede(camera, self.keep_history);
        }
        info!("Calibration reset for {} cameras", cameras.len());
        cameras.len()
    }

    /// Replace the in-memory state with the records in the backing directory.
    ///
    /// A missing directory loads nothing. Unreadable or invalid records are
    /// reported and skipped; their cameras stay uncalibrated.
    pub fn load_all(&self) -> Result<LoadReport, FusionError> {
        let mut report = LoadReport::default();
        let Some(directory) = &self.directory else {
            return Ok(report);
        };
        if !directory.is_dir() {
            debug!("No calibration directory at {}", directory.display());
            return Ok(report);
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(directory)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| is_record_file(path))
            .collect();
        paths.sort();

        let mut loaded = BTreeMap::new();
        for path in paths {
            match read_record(&path) {
                Ok(extrinsics) => {
                    if loaded.contains_key(&extrinsics.camera_id) {
                        warn!(
                            "Duplicate calibration for {} in {}, ignoring",
                            extrinsics.camera_id,
                            path.display()
                        );
                        continue;
                    }
                    loaded.insert(extrinsics.camera_id.clone(), extrinsics);
                }
                Err(reason) => {
                    warn!("Ignoring calibration record {}: {}", path.display(), reason);
                    report
                        .rejected
                        .push(FusionError::CorruptCalibrationRecord { path, reason });
                }
            }
        }

        let mut guard = self.snapshot.write();
        let snapshot = Arc::make_mut(&mut guard);
        snapshot.active.clear();
        for (camera, extrinsics) in loaded {
            let version = snapshot.versions.entry(camera.clone()).or_insert(0);
            *version = (*version).max(extrinsics.version);
            report.loaded.push(camera.clone());
            snapshot.active.insert(camera, extrinsics);
        }
        info!(
            "Loaded calibration for {} cameras ({} rejected)",
            report.loaded.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    /// Write the current state to the backing directory.
    ///
    /// Each record is written to a temporary file and renamed into place;
    /// records of cameras that are no longer calibrated are removed.
    pub fn save_all(&self) -> Result<(), FusionError> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        fs::create_dir_all(directory).map_err(|e| FusionError::storage(directory, e))?;

        for extrinsics in snapshot.iter() {
            write_record(&directory.join(record_file_name(&extrinsics.camera_id)), extrinsics)?;
        }

        let keep: Vec<PathBuf> = snapshot
            .iter()
            .map(|e| directory.join(record_file_name(&e.camera_id)))
            .collect();
        let entries = fs::read_dir(directory).map_err(|e| FusionError::storage(directory, e))?;
        for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
            if is_record_file(&path) && !keep.contains(&path) {
                fs::remove_file(&path).map_err(|e| FusionError::storage(&path, e))?;
                debug!("Removed stale calibration record {}", path.display());
            }
        }

        if self.keep_history {
            let history_dir = directory.join(HISTORY_DIR);
            for records in snapshot.history.values() {
                for extrinsics in records {
                    let path = history_dir.join(format!(
                        "{}{}_v{}.json",
                        RECORD_PREFIX,
                        extrinsics.camera_id.file_stem(),
                        extrinsics.version
                    ));
                    if !path.exists() {
                        fs::create_dir_all(&history_dir)
                            .map_err(|e| FusionError::storage(&history_dir, e))?;
                        write_record(&path, extrinsics)?;
                    }
                }
            }
        }

        debug!("Saved calibration for {} cameras", snapshot.len());
        Ok(())
    }
}

fn record_file_name(camera: &CameraId) -> String {
    format!("{}{}.json", RECORD_PREFIX, camera.file_stem())
}

fn is_record_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(RECORD_PREFIX))
}

fn read_record(path: &Path) -> Result<CameraExtrinsics, String> {
    let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let record: ExtrinsicsRecord = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    record.into_extrinsics()
}

fn write_record(path: &Path, extrinsics: &CameraExtrinsics) -> Result<(), FusionError> {
    let json = serde_json::to_string_pretty(&ExtrinsicsRecord::from(extrinsics))
        .map_err(|e| FusionError::storage(path, e))?;
    let tmp = path.with_extension("json.tmp");
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        FusionError::storage(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};
    use tempfile::TempDir;

    fn store_in(dir: &Path, keep_history: bool) -> CalibrationStore {
        CalibrationStore::new(&CalibrationConfig {
            directory: Some(dir.to_path_buf()),
            keep_history,
        })
    }

    fn shift(x: f32) -> RigidTransform {
        RigidTransform::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_get_unknown_camera_is_none() {
        let store = CalibrationStore::in_memory();
        assert!(store.get(&CameraId::from("a")).is_none());
        assert!(!store.is_calibrated(&CameraId::from("a")));
    }

    #[test]
    fn test_versions_increase_across_reset() {
        let store = CalibrationStore::in_memory();
        let camera = CameraId::from("a");

        assert_eq!(store.put(&camera, shift(1.0), None).version, 1);
        assert_eq!(store.put(&camera, shift(2.0), None).version, 2);
        assert!(store.reset(&camera));
        assert!(store.get(&camera).is_none());
        assert_eq!(store.put(&camera, shift(3.0), None).version, 3);
    }

    #[test]
    fn test_reset_uncalibrated_camera_is_noop() {
        let store = CalibrationStore::in_memory();
        assert!(!store.reset(&CameraId::from("a")));
        assert_eq!(store.reset_all(), 0);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_writes() {
        let store = CalibrationStore::in_memory();
        let camera = CameraId::from("a");
        store.put(&camera, shift(1.0), None);

        let before = store.snapshot();
        store.put(&camera, shift(2.0), None);
        store.put(&CameraId::from("b"), shift(5.0), None);

        assert_eq!(before.len(), 1);
        assert_eq!(before.get(&camera).unwrap().transform, shift(1.0));
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_history_keeps_superseded_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), true);
        let camera = CameraId::from("a");
        store.put(&camera, shift(1.0), None);
        store.put(&camera, shift(2.0), None);
        store.reset(&camera);

        let snapshot = store.snapshot();
        let versions: Vec<u64> = snapshot.history(&camera).iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);

        store.save_all().unwrap();
        assert!(dir.path().join("history/extrinsics_a_v1.json").is_file());
        assert!(dir.path().join("history/extrinsics_a_v2.json").is_file());
    }

    #[test]
    fn test_save_and_load_restore_state() {
        let dir = TempDir::new().unwrap();
        let camera = CameraId::from("10.95.76.10");
        let transform = RigidTransform::new(Quat::from_rotation_z(0.25), Vec3::new(10.0, -5.0, 2.5));
        let quality = AlignmentQuality {
            fitness: 0.9,
            inlier_rmse: 2.5,
        };

        let store = store_in(dir.path(), false);
        store.put(&camera, transform, Some(quality));
        store.save_all().unwrap();

        let reloaded = store_in(dir.path(), false);
        let report = reloaded.load_all().unwrap();
        assert_eq!(report.loaded, vec![camera.clone()]);
        assert!(report.rejected.is_empty());

        let extrinsics = reloaded.get(&camera).unwrap();
        assert!(extrinsics.transform.approx_eq(&transform, 1e-3, 1e-4));
        assert_eq!(extrinsics.version, 1);
        assert_eq!(extrinsics.quality, Some(quality));
        assert_eq!(reloaded.put(&camera, transform, None).version, 2);
    }

    #[test]
    fn test_similar_ids_keep_separate_records() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), false);
        let slash = CameraId::from("a/b");
        let underscore = CameraId::from("a_b");
        store.put(&slash, shift(1.0), None);
        store.put(&underscore, shift(2.0), None);
        store.save_all().unwrap();

        let reloaded = store_in(dir.path(), false);
        let mut loaded = reloaded.load_all().unwrap().loaded;
        loaded.sort();
        assert_eq!(loaded, vec![slash.clone(), underscore.clone()]);
        assert_eq!(reloaded.get(&slash).unwrap().transform, shift(1.0));
        assert_eq!(reloaded.get(&underscore).unwrap().transform, shift(2.0));
    }

    #[test]
    fn test_save_removes_reset_cameras() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), false);
        store.put(&CameraId::from("a"), shift(1.0), None);
        store.put(&CameraId::from("b"), shift(2.0), None);
        store.save_all().unwrap();
        assert!(dir.path().join("extrinsics_a.json").is_file());

        store.reset(&CameraId::from("a"));
        store.save_all().unwrap();
        assert!(!dir.path().join("extrinsics_a.json").exists());
        assert!(dir.path().join("extrinsics_b.json").is_file());
    }

    #[test]
    fn test_corrupt_record_leaves_camera_uncalibrated() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), false);
        store.put(&CameraId::from("good"), shift(1.0), None);
        store.save_all().unwrap();
        fs::write(dir.path().join("extrinsics_bad.json"), "{ not json").unwrap();

        let reloaded = store_in(dir.path(), false);
        let report = reloaded.load_all().unwrap();
        assert_eq!(report.loaded, vec![CameraId::from("good")]);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(
            report.rejected[0],
            FusionError::CorruptCalibrationRecord { .. }
        ));
        assert_eq!(reloaded.calibrated_cameras(), vec![CameraId::from("good")]);
    }

    #[test]
    fn test_missing_directory_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir.path().join("absent"), false);
        let report = store.load_all().unwrap();
        assert!(report.loaded.is_empty());
    }

    #[test]
    fn test_put_all_is_atomic_for_readers() {
        let store = CalibrationStore::in_memory();
        let stored = store.put_all(vec![
            (CameraId::from("a"), shift(1.0), None),
            (CameraId::from("b"), shift(2.0), None),
        ]);
        assert_eq!(stored.len(), 2);
        let snapshot = store.snapshot();
        assert!(snapshot.is_calibrated(&CameraId::from("a")));
        assert!(snapshot.is_calibrated(&CameraId::from("b")));
    }
}
