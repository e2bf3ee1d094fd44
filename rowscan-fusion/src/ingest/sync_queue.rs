//! Cross-camera frame synchronization.
//!
//! Each camera owns a bounded ring buffer with its own lock, so producers never
//! contend with each other. `poll_synced_set` briefly locks every buffer, picks
//! a reference timestamp and takes at most one sample per camera that lies
//! within the tolerance window.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::error::FusionError;
use crate::ingest::{CameraId, FrameSample};
use ordered_float::OrderedFloat;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Frames from several cameras captured within the tolerance window.
#[derive(Debug, Clone)]
pub struct SyncedFrameSet {
    /// Timestamp every included sample was matched against.
    pub reference_timestamp: f64,
    pub frames: BTreeMap<CameraId, FrameSample>,
    /// Known cameras left out because they have been silent for longer than
    /// the grace period.
    pub unavailable: Vec<CameraId>,
}

impl SyncedFrameSet {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = &CameraId> {
        self.frames.keys()
    }

    pub fn contains(&self, camera: &CameraId) -> bool {
        self.frames.contains_key(camera)
    }

    /// Largest timestamp difference between any two included samples.
    pub fn max_spread(&self) -> f64 {
        let mut timestamps = self.frames.values().map(|s| s.timestamp);
        let Some(first) = timestamps.next() else {
            return 0.0;
        };
        let (lo, hi) = timestamps.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
        hi - lo
    }
}

/// What happened to a pushed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest buffered sample.
    EvictedOldest,
    /// Dropped because its timestamp does not advance the camera's stream.
    Rejected,
}

struct BufferState {
    samples: VecDeque<FrameSample>,
    last_push: Instant,
    last_timestamp: Option<f64>,
}

struct CameraBuffer {
    state: Mutex<BufferState>,
    evicted: AtomicU64,
}

impl CameraBuffer {
    fn new(capacity: usize, now: Instant) -> Self {
        Self {
            state: Mutex::new(BufferState {
                samples: VecDeque::with_capacity(capacity),
                last_push: now,
                last_timestamp: None,
            }),
            evicted: AtomicU64::new(0),
        }
    }
}

/// Per-camera ring buffers plus the synchronization policy.
pub struct SyncQueue {
    capacity: usize,
    grace_period: Option<Duration>,
    reference_camera: Option<CameraId>,
    buffers: RwLock<BTreeMap<CameraId, Arc<CameraBuffer>>>,
}

impl SyncQueue {
    /// Create a queue holding up to `capacity` samples per camera.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            grace_period: None,
            reference_camera: None,
            buffers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        let queue = Self::new(config.capacity).with_grace_period(config.grace_period());
        match &config.reference_camera {
            Some(reference) => queue.with_reference_camera(reference.clone()),
            None => queue,
        }
    }

    /// Leave cameras out of synchronized sets once they have not pushed for `grace`.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Anchor synchronized sets on this camera's newest sample.
    pub fn with_reference_camera(mut self, camera: CameraId) -> Self {
        self.reference_camera = Some(camera);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn buffer(&self, camera: &CameraId, now: Instant) -> Arc<CameraBuffer> {
        if let Some(buffer) = self.buffers.read().get(camera) {
            return Arc::clone(buffer);
        }
        let mut buffers = self.buffers.write();
        Arc::clone(
            buffers
                .entry(camera.clone())
                .or_insert_with(|| Arc::new(CameraBuffer::new(self.capacity, now))),
        )
    }

    /// Make a camera known before its first frame arrives, so it is reported as
    /// unavailable if it never delivers.
    pub fn register_camera(&self, camera: &CameraId) {
        self.buffer(camera, Instant::now());
    }

    /// Enqueue a sample into its camera's ring buffer. Never blocks on other cameras.
    pub fn push(&self, sample: FrameSample) -> PushOutcome {
        self.push_at(sample, Instant::now())
    }

    /// `push` with an explicit arrival time.
    pub fn push_at(&self, sample: FrameSample, now: Instant) -> PushOutcome {
        let buffer = self.buffer(&sample.camera_id, now);
        let mut state = buffer.state.lock();

        if let Some(last) = state.last_timestamp {
            if sample.timestamp <= last {
                debug!(
                    "Rejected frame from {} at {:.4}s (last {:.4}s)",
                    sample.camera_id, sample.timestamp, last
                );
                return PushOutcome::Rejected;
            }
        }

        state.last_push = now;
        state.last_timestamp = Some(sample.timestamp);

        let mut outcome = PushOutcome::Queued;
        if state.samples.len() >= self.capacity {
            state.samples.pop_front();
            let evicted = buffer.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            if evicted.is_power_of_two() {
                warn!(
                    "Camera {} buffer full, {} frames evicted so far",
                    sample.camera_id, evicted
                );
            }
            outcome = PushOutcome::EvictedOldest;
        }
        trace!("Queued frame from {} at {:.4}s", sample.camera_id, sample.timestamp);
        state.samples.push_back(sample);
        outcome
    }

    /// Take the next synchronized set, or `None` if no live camera has a sample.
    ///
    /// `tolerance` is in seconds and bounds both the distance of every sample
    /// to the reference timestamp and the spread across the set.
    pub fn poll_synced_set(&self, tolerance: f64) -> Option<SyncedFrameSet> {
        self.poll_at(tolerance, Instant::now())
    }

    /// `poll_synced_set` evaluated at an explicit time.
    pub fn poll_at(&self, tolerance: f64, now: Instant) -> Option<SyncedFrameSet> {
        let buffers: Vec<(CameraId, Arc<CameraBuffer>)> = self
            .buffers
            .read()
            .iter()
            .map(|(id, buffer)| (id.clone(), Arc::clone(buffer)))
            .collect();

        // Lock in id order; pushes only ever hold a single buffer lock.
        let mut states: Vec<_> = buffers
            .iter()
            .map(|(id, buffer)| (id, buffer.state.lock()))
            .collect();

        let mut unavailable = Vec::new();
        let mut live = vec![true; states.len()];
        if let Some(grace) = self.grace_period {
            for (i, (id, state)) in states.iter().enumerate() {
                if now.saturating_duration_since(state.last_push) > grace {
                    live[i] = false;
                    unavailable.push((*id).clone());
                }
            }
        }

        let newest = |i: usize| -> Option<f64> {
            if !live[i] {
                return None;
            }
            states[i].1.samples.back().map(|s| s.timestamp)
        };

        let reference_timestamp = self
            .reference_camera
            .as_ref()
            .and_then(|reference| states.iter().position(|(id, _)| *id == reference))
            .and_then(newest)
            .or_else(|| {
                (0..states.len())
                    .filter_map(newest)
                    .max_by_key(|t| OrderedFloat(*t))
            })?;

        // Closest sample per camera; equidistant samples resolve to the earlier one.
        let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
        for (i, (_, state)) in states.iter().enumerate() {
            if !live[i] {
                continue;
            }
            let best = state
                .samples
                .iter()
                .enumerate()
                .map(|(idx, s)| (idx, s.timestamp, (s.timestamp - reference_timestamp).abs()))
                .filter(|(_, _, distance)| *distance <= tolerance)
                .min_by_key(|(_, t, distance)| (OrderedFloat(*distance), OrderedFloat(*t)));
            if let Some((idx, t, _)) = best {
                candidates.push((i, idx, t));
            }
        }

        // Admit closest-first while the set's spread stays within tolerance.
        candidates.sort_by_key(|&(i, _, t)| {
            (
                OrderedFloat((t - reference_timestamp).abs()),
                OrderedFloat(t),
                i,
            )
        });
        let mut accepted = Vec::with_capacity(candidates.len());
        let mut span: Option<(f64, f64)> = None;
        for (i, idx, t) in candidates {
            let (lo, hi) = span.map_or((t, t), |(lo, hi)| (lo.min(t), hi.max(t)));
            if hi - lo <= tolerance {
                span = Some((lo, hi));
                accepted.push((i, idx));
            }
        }

        let mut frames = BTreeMap::new();
        for (i, idx) in accepted {
            let state = &mut states[i].1;
            state.samples.drain(..idx);
            if let Some(sample) = state.samples.pop_front() {
                frames.insert(sample.camera_id.clone(), sample);
            }
        }

        // Nothing older than the window can match a later reference.
        let horizon = reference_timestamp - tolerance;
        for (_, state) in states.iter_mut() {
            while state.samples.front().is_some_and(|s| s.timestamp < horizon) {
                state.samples.pop_front();
            }
        }

        debug!(
            "Synced set at {:.4}s: {} cameras, {} unavailable",
            reference_timestamp,
            frames.len(),
            unavailable.len()
        );

        Some(SyncedFrameSet {
            reference_timestamp,
            frames,
            unavailable,
        })
    }

    /// Poll until a synchronized set forms, the timeout expires or `cancel` fires.
    pub fn wait_synced_set(
        &self,
        tolerance: f64,
        timeout: Duration,
        poll_interval: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<SyncedFrameSet, FusionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(FusionError::AlignmentCancelled);
            }
            if let Some(set) = self.poll_synced_set(tolerance) {
                return Ok(set);
            }
            if Instant::now() >= deadline {
                return Err(FusionError::SyncTimeout(timeout));
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Cameras that have pushed or been registered, in id order.
    pub fn cameras(&self) -> Vec<CameraId> {
        self.buffers.read().keys().cloned().collect()
    }

    /// Samples currently buffered for `camera`.
    pub fn buffered(&self, camera: &CameraId) -> usize {
        self.buffers
            .read()
            .get(camera)
            .map_or(0, |b| b.state.lock().samples.len())
    }

    /// Samples evicted from `camera`'s full buffer so far.
    pub fn evicted(&self, camera: &CameraId) -> u64 {
        self.buffers
            .read()
            .get(camera)
            .map_or(0, |b| b.evicted.load(Ordering::Relaxed))
    }

    /// Samples evicted across all cameras (degraded-sync counter).
    pub fn total_evicted(&self) -> u64 {
        self.buffers
            .read()
            .values()
            .map(|b| b.evicted.load(Ordering::Relaxed))
            .sum()
    }

    /// Drop every buffered sample, keeping camera registrations.
    pub fn clear(&self) {
        for buffer in self.buffers.read().values() {
            buffer.state.lock().samples.clear();
        }
    }
}
