//! One capture thread per camera, feeding the synchronization queue.

use crate::ingest::{CameraId, FrameSource, PushOutcome, StreamError, SyncQueue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consecutive read errors tolerated before a producer gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Handle to a running capture thread.
pub struct ProducerHandle {
    camera_id: CameraId,
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    /// Frames delivered to the queue so far.
    pub fn frames_pushed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Ask the thread to stop after its current frame.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop and wait for the thread to exit.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture thread for {} panicked", self.camera_id);
            }
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start a thread that reads `source` until it ends or is stopped, pushing
/// every frame into `queue`.
pub fn spawn_producer(
    mut source: Box<dyn FrameSource>,
    queue: Arc<SyncQueue>,
) -> std::io::Result<ProducerHandle> {
    let camera_id = source.camera_id().clone();
    let stop = Arc::new(AtomicBool::new(false));
    let frames = Arc::new(AtomicU64::new(0));
    queue.register_camera(&camera_id);

    let thread = {
        let camera_id = camera_id.clone();
        let stop = Arc::clone(&stop);
        let frames = Arc::clone(&frames);
        std::thread::Builder::new()
            .name(format!("capture-{}", camera_id))
            .spawn(move || {
                info!("Capture started for {}", camera_id);
                let mut consecutive_errors = 0;
                while !stop.load(Ordering::Acquire) {
                    match source.next_frame() {
                        Ok(Some(sample)) => {
                            consecutive_errors = 0;
                            if sample.camera_id != camera_id {
                                warn!(
                                    "Source {} produced a frame tagged {}, dropping",
                                    camera_id, sample.camera_id
                                );
                                continue;
                            }
                            if queue.push(sample) != PushOutcome::Rejected {
                                frames.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Ok(None) | Err(StreamError::StreamEnded) => {
                            debug!("Stream for {} ended", camera_id);
                            break;
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            warn!(
                                "Frame read failed for {} ({}/{}): {}",
                                camera_id, consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                            );
                            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                error!("Giving up on camera {}", camera_id);
                                break;
                            }
                            std::thread::sleep(ERROR_BACKOFF);
                        }
                    }
                }
                info!(
                    "Capture stopped for {} after {} frames",
                    camera_id,
                    frames.load(Ordering::Relaxed)
                );
            })?
    };

    Ok(ProducerHandle {
        camera_id,
        stop,
        frames,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{DepthImage, FrameSample, Intrinsics};

    struct CountingSource {
        id: CameraId,
        remaining: u32,
        next_timestamp: f64,
        fail_first: u32,
    }

    impl CountingSource {
        fn new(id: &str, frames: u32) -> Self {
            Self {
                id: CameraId::from(id),
                remaining: frames,
                next_timestamp: 0.0,
                fail_first: 0,
            }
        }
    }

    impl FrameSource for CountingSource {
        fn camera_id(&self) -> &CameraId {
            &self.id
        }

        fn intrinsics(&self) -> Intrinsics {
            Intrinsics::new(1.0, 1.0, 0.5, 0.5, 1, 1)
        }

        fn next_frame(&mut self) -> Result<Option<FrameSample>, StreamError> {
            if self.fail_first > 0 {
                self.fail_first -= 1;
                return Err(StreamError::InvalidData("sensor hiccup".into()));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.next_timestamp += 0.033;
            Ok(Some(FrameSample::new(
                self.id.clone(),
                self.next_timestamp,
                DepthImage::new(1, 1),
                self.intrinsics(),
            )))
        }

        fn is_active(&self) -> bool {
            self.remaining > 0
        }
    }

    #[test]
    fn test_producer_drains_finite_source() {
        let queue = Arc::new(SyncQueue::new(16));
        let handle = spawn_producer(Box::new(CountingSource::new("a", 5)), Arc::clone(&queue)).unwrap();
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.frames_pushed(), 5);
        handle.join();
        assert_eq!(queue.buffered(&CameraId::from("a")), 5);
    }

    #[test]
    fn test_producer_recovers_from_transient_errors() {
        let queue = Arc::new(SyncQueue::new(16));
        let mut source = CountingSource::new("a", 3);
        source.fail_first = 2;
        let handle = spawn_producer(Box::new(source), Arc::clone(&queue)).unwrap();
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.frames_pushed(), 3);
    }

    #[test]
    fn test_stop_ends_endless_source() {
        let queue = Arc::new(SyncQueue::new(4));
        let handle =
            spawn_producer(Box::new(CountingSource::new("a", u32::MAX)), Arc::clone(&queue)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        handle.join();
        assert_eq!(queue.buffered(&CameraId::from("a")), 4);
        assert!(queue.evicted(&CameraId::from("a")) > 0);
    }
}
