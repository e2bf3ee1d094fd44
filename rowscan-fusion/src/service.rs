//! Trigger surface for the control layer.
//!
//! `FusionService` owns the synchronization queue, the calibration store and
//! the capture threads. Every trigger runs synchronously on the caller's
//! thread; only frame capture runs in the background.

use crate::alignment::{AlignmentEngine, AlignmentSession, AlignmentSummary};
use crate::calibration::CalibrationStore;
use crate::cancel::CancelToken;
use crate::cloud::CloudBuilder;
use crate::config::FusionConfig;
use crate::error::FusionError;
use crate::export::{CaptureSession, ExportHandle, Exporter};
use crate::fusion::{FusedCloud, FusionEngine, Provenance};
use crate::ingest::{CameraId, FrameSource, ProducerHandle, SyncQueue, SyncedFrameSet, spawn_producer};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot reported by [`FusionService::fusion_status`].
#[derive(Debug, Clone)]
pub struct FusionStatus {
    pub calibrated_camera_ids: Vec<CameraId>,
    pub last_fusion_provenance: Option<Provenance>,
    /// Cameras known to the synchronization queue.
    pub cameras: Vec<CameraId>,
    /// Frames evicted from full camera buffers since startup.
    pub degraded_frames: u64,
    /// Current or most recent alignment run.
    pub alignment: Option<AlignmentSession>,
}

pub struct FusionService {
    config: FusionConfig,
    queue: Arc<SyncQueue>,
    store: CalibrationStore,
    alignment: AlignmentEngine,
    fusion: FusionEngine,
    exporter: Exporter,
    producers: Mutex<Vec<ProducerHandle>>,
    last_provenance: Mutex<Option<Provenance>>,
    /// Serializes alignment runs.
    align_lock: Mutex<()>,
    /// Cancel token of the running alignment, if any.
    running_alignment: Mutex<Option<CancelToken>>,
    /// Held while calibration is committed or reset.
    commit_lock: Mutex<()>,
}

impl FusionService {
    /// Build the service and load persisted calibration.
    ///
    /// Corrupt calibration records are logged and leave their camera
    /// uncalibrated; they do not prevent startup.
    pub fn new(config: FusionConfig) -> Result<Self, FusionError> {
        config.validate()?;

        let mut sync = config.sync.clone();
        if sync.reference_camera.is_none() {
            sync.reference_camera = config.alignment.reference_camera.clone();
        }
        let queue = Arc::new(SyncQueue::from_config(&sync));

        let store = CalibrationStore::new(&config.calibration);
        let report = store.load_all()?;
        for rejected in &report.rejected {
            warn!("{}", rejected);
        }

        let builder = CloudBuilder::new(config.cloud.clone());
        let alignment = AlignmentEngine::new(config.alignment.clone(), builder.clone());
        let fusion = FusionEngine::new(builder, config.filter.clone());
        let exporter = Exporter::new(config.export.clone());

        Ok(Self {
            config: FusionConfig { sync, ..config },
            queue,
            store,
            alignment,
            fusion,
            exporter,
            producers: Mutex::new(Vec::new()),
            last_provenance: Mutex::new(None),
            align_lock: Mutex::new(()),
            running_alignment: Mutex::new(None),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.store
    }

    /// Start a capture thread for `source`. Sources configured as ignored are
    /// dropped without starting.
    pub fn attach_source(&self, source: Box<dyn FrameSource>) -> Result<(), FusionError> {
        let camera = source.camera_id().clone();
        if self
            .config
            .cameras
            .iter()
            .any(|c| c.id == camera && c.ignored)
        {
            info!("Camera {} is ignored by configuration", camera);
            return Ok(());
        }
        let handle = spawn_producer(source, Arc::clone(&self.queue))?;
        self.producers.lock().push(handle);
        Ok(())
    }

    /// Align all cameras currently delivering frames and persist the result.
    ///
    /// Cameras whose registration fails keep their previous calibration and
    /// are listed in the summary; the call fails only when no camera could be
    /// registered. A reset issued while this runs cancels it.
    pub fn align_cameras(&self) -> Result<AlignmentSummary, FusionError> {
        let _running = self.align_lock.lock();
        let cancel = CancelToken::new();
        *self.running_alignment.lock() = Some(cancel.clone());

        let result = self.alignment.run(
            &self.queue,
            &self.config.sync,
            &self.store.snapshot(),
            &cancel,
        );
        let committed = result.and_then(|summary| self.commit_alignment(summary, &cancel));
        *self.running_alignment.lock() = None;
        committed
    }

    /// Align from sets the caller already collected.
    pub fn align_with_sets(&self, sets: &[SyncedFrameSet]) -> Result<AlignmentSummary, FusionError> {
        let _running = self.align_lock.lock();
        let cancel = CancelToken::new();
        *self.running_alignment.lock() = Some(cancel.clone());

        let result = self.alignment.compute(sets, &self.store.snapshot(), &cancel);
        let committed = result.and_then(|summary| self.commit_alignment(summary, &cancel));
        *self.running_alignment.lock() = None;
        committed
    }

    fn commit_alignment(
        &self,
        summary: AlignmentSummary,
        cancel: &CancelToken,
    ) -> Result<AlignmentSummary, FusionError> {
        let _commit = self.commit_lock.lock();
        if cancel.is_cancelled() {
            warn!("Alignment cancelled before commit, calibration unchanged");
            self.alignment.clear_session();
            return Err(FusionError::AlignmentCancelled);
        }

        let snapshot = self.store.snapshot();
        let updates: Vec<_> = summary
            .aligned
            .iter()
            .filter(|a| a.icp.is_some() || !snapshot.is_calibrated(&a.camera_id))
            .map(|a| (a.camera_id.clone(), a.transform, a.quality()))
            .collect();
        self.store.put_all(updates);
        self.store.save_all()?;

        info!(
            "Alignment committed: {} cameras registered against {}, {} failed",
            summary.registered().count(),
            summary.reference_camera,
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Reset one camera, or every camera when `camera` is `None`, and persist.
    /// Returns how many cameras were calibrated before the reset.
    pub fn reset_calibration(&self, camera: Option<&CameraId>) -> Result<usize, FusionError> {
        if let Some(cancel) = self.running_alignment.lock().as_ref() {
            info!("Reset requested, cancelling running alignment");
            cancel.cancel();
        }

        let _commit = self.commit_lock.lock();
        let reset = match camera {
            Some(camera) => usize::from(self.store.reset(camera)),
            None => self.store.reset_all(),
        };
        self.store.save_all()?;
        self.alignment.clear_session();
        Ok(reset)
    }

    /// Fuse the next synchronized set without exporting it.
    pub fn current_fusion(&self) -> Result<FusedCloud, FusionError> {
        let sync = &self.config.sync;
        let set = self
            .queue
            .wait_synced_set(sync.tolerance_secs(), sync.timeout(), sync.poll_interval(), None)?;
        self.fuse_set(&set)
    }

    /// Fuse a given set against the current calibration.
    pub fn fuse_set(&self, set: &SyncedFrameSet) -> Result<FusedCloud, FusionError> {
        let fused = self.fusion.fuse(set, &self.store.snapshot())?;
        *self.last_provenance.lock() = Some(fused.provenance.clone());
        Ok(fused)
    }

    /// Fuse the next synchronized set and export it.
    pub fn export_current_fusion(&self, session: &CaptureSession) -> Result<ExportHandle, FusionError> {
        let fused = self.current_fusion()?;
        self.export(&fused, session)
    }

    /// Export an already fused cloud, e.g. to retry after a storage failure.
    pub fn export(&self, fused: &FusedCloud, session: &CaptureSession) -> Result<ExportHandle, FusionError> {
        let handle = self.exporter.export(fused, session)?;
        let mut provenance = fused.provenance.clone();
        provenance.session = Some(session.clone());
        provenance.sequence_number = Some(handle.sequence_number);
        *self.last_provenance.lock() = Some(provenance);
        Ok(handle)
    }

    pub fn fusion_status(&self) -> FusionStatus {
        FusionStatus {
            calibrated_camera_ids: self.store.calibrated_cameras(),
            last_fusion_provenance: self.last_provenance.lock().clone(),
            cameras: self.queue.cameras(),
            degraded_frames: self.queue.total_evicted(),
            alignment: self.alignment.session(),
        }
    }

    /// Stop every capture thread and wait for them to exit.
    pub fn shutdown(&self) {
        let producers: Vec<ProducerHandle> = self.producers.lock().drain(..).collect();
        for producer in &producers {
            producer.stop();
        }
        for producer in producers {
            producer.join();
        }
        info!("Fusion service stopped");
    }
}

impl Drop for FusionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
