//! Alignment state machine
//!
//! `Idle -> Collecting -> Computing -> Converged | Failed`. Collecting pulls a
//! few synchronized sets from the queue; computing registers every camera
//! against the reference camera. The engine never touches the calibration
//! store itself: it returns an [`AlignmentSummary`] that the caller commits.

use crate::alignment::icp::{IcpError, IcpResult, register};
use crate::calibration::{AlignmentQuality, CalibrationSnapshot, RigidTransform};
use crate::cancel::CancelToken;
use crate::cloud::CloudBuilder;
use crate::config::{AlignmentConfig, SyncConfig};
use crate::error::FusionError;
use crate::ingest::{CameraId, SyncQueue, SyncedFrameSet};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rowscan_data::Point;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentStatus {
    Idle,
    Collecting,
    Computing,
    Converged,
    Failed,
}

impl AlignmentStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, AlignmentStatus::Collecting | AlignmentStatus::Computing)
    }
}

/// Observable progress of the current (or most recent) alignment run.
#[derive(Debug, Clone)]
pub struct AlignmentSession {
    pub id: Uuid,
    pub status: AlignmentStatus,
    pub started_at: DateTime<Utc>,
    pub reference_camera: Option<CameraId>,
    pub target_cameras: Vec<CameraId>,
    pub sets_collected: usize,
    /// Correspondences of the most recently registered camera.
    pub correspondences: usize,
    /// ICP iterations run so far, across cameras.
    pub iterations: usize,
    /// Final residual of the most recently registered camera.
    pub residual: Option<f64>,
    pub error: Option<String>,
}

impl AlignmentSession {
    fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: AlignmentStatus::Collecting,
            started_at: Utc::now(),
            reference_camera: None,
            target_cameras: Vec::new(),
            sets_collected: 0,
            correspondences: 0,
            iterations: 0,
            residual: None,
            error: None,
        }
    }
}

/// Alignment outcome for one camera.
#[derive(Debug, Clone)]
pub struct CameraAlignment {
    pub camera_id: CameraId,
    /// Camera frame to shared frame.
    pub transform: RigidTransform,
    /// `None` for the reference camera.
    pub icp: Option<IcpResult>,
}

impl CameraAlignment {
    pub fn quality(&self) -> Option<AlignmentQuality> {
        self.icp.as_ref().map(|icp| AlignmentQuality {
            fitness: icp.fitness,
            inlier_rmse: icp.inlier_rmse,
        })
    }
}

/// Everything a finished alignment run produced.
#[derive(Debug)]
pub struct AlignmentSummary {
    pub session_id: Uuid,
    pub reference_camera: CameraId,
    /// Cameras with a new transform, reference camera first.
    pub aligned: Vec<CameraAlignment>,
    /// Cameras whose registration failed; their calibration must stay as it was.
    pub failed: Vec<(CameraId, FusionError)>,
}

impl AlignmentSummary {
    /// Aligned cameras other than the reference.
    pub fn registered(&self) -> impl Iterator<Item = &CameraAlignment> {
        self.aligned.iter().filter(|a| a.icp.is_some())
    }
}

/// Registers cameras against a reference camera.
pub struct AlignmentEngine {
    config: AlignmentConfig,
    builder: CloudBuilder,
    session: Mutex<Option<AlignmentSession>>,
}

impl AlignmentEngine {
    pub fn new(config: AlignmentConfig, builder: CloudBuilder) -> Self {
        Self {
            config,
            builder,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn status(&self) -> AlignmentStatus {
        self.session
            .lock()
            .as_ref()
            .map_or(AlignmentStatus::Idle, |s| s.status)
    }

    /// Snapshot of the current or most recent run.
    pub fn session(&self) -> Option<AlignmentSession> {
        self.session.lock().clone()
    }

    /// Forget the most recent run. A running session is left alone; it is
    /// discarded when its run observes the cancellation.
    pub fn clear_session(&self) {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.status.is_running()) {
            *session = None;
        }
    }

    fn update(&self, f: impl FnOnce(&mut AlignmentSession)) {
        if let Some(session) = self.session.lock().as_mut() {
            f(session);
        }
    }

    fn fail(&self, error: FusionError) -> FusionError {
        if matches!(error, FusionError::AlignmentCancelled) {
            info!("Alignment cancelled, session discarded");
            *self.session.lock() = None;
            return error;
        }
        warn!("Alignment failed: {}", error);
        self.update(|s| {
            s.status = AlignmentStatus::Failed;
            s.error = Some(error.to_string());
        });
        error
    }

    /// Collect synchronized sets, then compute alignments from them.
    pub fn run(
        &self,
        queue: &SyncQueue,
        sync: &SyncConfig,
        calibration: &CalibrationSnapshot,
        cancel: &CancelToken,
    ) -> Result<AlignmentSummary, FusionError> {
        let sets = self.collect(queue, sync, cancel)?;
        self.compute(&sets, calibration, cancel)
    }

    /// Wait for `collect_sets` synchronized sets holding at least two cameras.
    pub fn collect(
        &self,
        queue: &SyncQueue,
        sync: &SyncConfig,
        cancel: &CancelToken,
    ) -> Result<Vec<SyncedFrameSet>, FusionError> {
        *self.session.lock() = Some(AlignmentSession::start());
        info!("Collecting {} synchronized sets for alignment", self.config.collect_sets);

        let timeout = self.config.collect_timeout();
        let deadline = Instant::now() + timeout;
        let mut sets = Vec::with_capacity(self.config.collect_sets);
        while sets.len() < self.config.collect_sets {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.fail(FusionError::SyncTimeout(timeout)));
            }
            let set = match queue.wait_synced_set(
                sync.tolerance_secs(),
                remaining,
                sync.poll_interval(),
                Some(cancel),
            ) {
                Ok(set) => set,
                Err(FusionError::SyncTimeout(_)) => {
                    return Err(self.fail(FusionError::SyncTimeout(timeout)));
                }
                Err(e) => return Err(self.fail(e)),
            };
            if set.len() < 2 {
                debug!("Skipping synchronized set with {} camera(s)", set.len());
                continue;
            }
            sets.push(set);
            let collected = sets.len();
            self.update(|s| s.sets_collected = collected);
        }
        Ok(sets)
    }

    /// Register every camera in `sets` against the reference camera.
    ///
    /// The reference camera keeps its current extrinsics (identity if it has
    /// none). Other cameras start from their prior extrinsics when present.
    pub fn compute(
        &self,
        sets: &[SyncedFrameSet],
        calibration: &CalibrationSnapshot,
        cancel: &CancelToken,
    ) -> Result<AlignmentSummary, FusionError> {
        {
            let mut guard = self.session.lock();
            if guard.as_ref().is_some_and(|s| s.status != AlignmentStatus::Collecting) {
                // not preceded by collect(): this is a fresh run
                *guard = None;
            }
            let session = guard.get_or_insert_with(AlignmentSession::start);
            session.status = AlignmentStatus::Computing;
            session.sets_collected = sets.len();
        }

        let clouds = self.accumulate(sets);
        let reference = match (&self.config.reference_camera, clouds.keys().next()) {
            (Some(reference), _) if clouds.contains_key(reference) => reference.clone(),
            (Some(reference), _) => {
                return Err(self.fail(FusionError::CameraUnavailable(reference.clone())));
            }
            (None, Some(first)) => first.clone(),
            (None, None) => {
                return Err(self.fail(FusionError::SyncTimeout(self.config.collect_timeout())));
            }
        };
        let targets: Vec<CameraId> = clouds.keys().filter(|id| **id != reference).cloned().collect();
        self.update(|s| {
            s.reference_camera = Some(reference.clone());
            s.target_cameras = targets.clone();
        });

        let reference_pose = calibration
            .get(&reference)
            .map_or(RigidTransform::IDENTITY, |e| e.transform);
        let reference_cloud = clouds.get(&reference).map_or(&[][..], Vec::as_slice);

        let mut aligned = vec![CameraAlignment {
            camera_id: reference.clone(),
            transform: reference_pose,
            icp: None,
        }];
        let mut failed = Vec::new();

        for camera in &targets {
            if cancel.is_cancelled() {
                return Err(self.fail(FusionError::AlignmentCancelled));
            }
            let source = clouds.get(camera).map_or(&[][..], Vec::as_slice);
            let guess = calibration
                .get(camera)
                .map_or(RigidTransform::IDENTITY, |prior| {
                    reference_pose.inverse().compose(&prior.transform)
                });

            debug!(
                "Registering {} ({} points) against {} ({} points)",
                camera,
                source.len(),
                reference,
                reference_cloud.len()
            );
            match register(source, reference_cloud, &guess, &self.config) {
                Ok(icp) => {
                    info!(
                        "Camera {} aligned: fitness {:.3}, rmse {:.2} mm, {} iterations",
                        camera, icp.fitness, icp.inlier_rmse, icp.iterations
                    );
                    self.update(|s| {
                        s.correspondences = icp.correspondences;
                        s.iterations += icp.iterations;
                        s.residual = Some(icp.final_residual);
                    });
                    aligned.push(CameraAlignment {
                        camera_id: camera.clone(),
                        transform: reference_pose.compose(&icp.transform),
                        icp: Some(icp),
                    });
                }
                Err(e) => {
                    let error = icp_failure(camera, e);
                    warn!("{}", error);
                    failed.push((camera.clone(), error));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(self.fail(FusionError::AlignmentCancelled));
        }

        // with nothing registered the run has failed outright
        if aligned.len() == 1 && !failed.is_empty() {
            let (_, error) = failed.remove(0);
            return Err(self.fail(error));
        }

        let session_id = self.session.lock().as_ref().map_or_else(Uuid::new_v4, |s| s.id);
        self.update(|s| s.status = AlignmentStatus::Converged);
        Ok(AlignmentSummary {
            session_id,
            reference_camera: reference,
            aligned,
            failed,
        })
    }

    /// Camera-space points per camera, accumulated over all sets.
    fn accumulate(&self, sets: &[SyncedFrameSet]) -> BTreeMap<CameraId, Vec<Point>> {
        let mut clouds: BTreeMap<CameraId, Vec<Point>> = BTreeMap::new();
        for set in sets {
            for (camera, sample) in &set.frames {
                let cloud = self.builder.build(sample);
                clouds.entry(camera.clone()).or_default().extend(cloud.points);
            }
        }
        clouds
    }
}

fn icp_failure(camera: &CameraId, error: IcpError) -> FusionError {
    match error {
        IcpError::InsufficientOverlap { found, required } => FusionError::InsufficientOverlap {
            camera: camera.clone(),
            found,
            required,
        },
        IcpError::Diverged { residual, initial } => FusionError::AlignmentDiverged {
            camera: camera.clone(),
            residual,
            initial,
        },
    }
}
