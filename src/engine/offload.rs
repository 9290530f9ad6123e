//! Bounded CPU worker pool for transform execution.
//!
//! `submit` never runs the transform on the calling task: work goes to a
//! blocking worker thread so the transform stage's control loop stays free
//! to pull the next frame while earlier ones execute.  A semaphore caps
//! concurrent workers; once all permits are out, further submissions wait
//! for one to free up — this is what converts channel backpressure into
//! bounded memory and CPU.
//!
//! The pool makes no ordering promise.  Completions may arrive out of
//! input order; re-serialization is the transform stage's job.
//!
//! Failure containment: a transform error — or a panic inside `apply` —
//! becomes [`Outcome::Failed`] on that one frame.  The frame survives, the
//! pool keeps accepting work, nothing is dropped silently.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};
use tokio::task;
use tracing::warn;

use crate::core::traits::Transform;
use crate::core::types::{Frame, Outcome};
use crate::error::{PipelineError, Result};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Bounded pool running [`Transform::apply`] off the stage control loop.
pub struct Offloader {
    transform: Arc<dyn Transform>,
    permits: Arc<Semaphore>,
    workers: usize,
}

/// Completion handle for one submitted frame.
pub struct WorkHandle {
    index: u64,
    rx: oneshot::Receiver<(Frame, Outcome)>,
}

impl WorkHandle {
    /// Arrival index of the submitted frame.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Wait for this unit of work to complete without consuming the handle.
    ///
    /// Cancel-safe: dropping the future leaves the completion in place for
    /// a later `wait` or `join`.  Once it resolves the handle is spent.
    pub async fn wait(&mut self) -> Result<(Frame, Outcome)> {
        (&mut self.rx).await.map_err(|_| {
            PipelineError::Transform(format!("worker for frame {} vanished", self.index))
        })
    }

    /// Wait for this unit of work to complete.
    pub async fn join(mut self) -> Result<(Frame, Outcome)> {
        self.wait().await
    }
}

impl Offloader {
    /// Create a pool sharing `transform` across at most `workers` threads.
    pub fn new(transform: Arc<dyn Transform>, workers: usize) -> Self {
        assert!(workers >= 1, "offloader needs at least one worker");
        Self {
            transform,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Concurrency limit this pool was built with.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Schedule the transform for `frame` on a worker thread.
    ///
    /// Suspends while all workers are busy.  The returned handle resolves
    /// when that one unit completes, in whatever order the pool gets to it.
    pub async fn submit(&self, frame: Frame) -> Result<WorkHandle> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::ChannelClosed)?;

        let index = frame.index;
        let transform = self.transform.clone();
        let (tx, rx) = oneshot::channel();

        task::spawn_blocking(move || {
            let _permit = permit;
            let outcome = match catch_unwind(AssertUnwindSafe(|| transform.apply(&frame))) {
                Ok(Ok(detections)) if detections.is_empty() => Outcome::Empty,
                Ok(Ok(detections)) => Outcome::Detections(detections),
                Ok(Err(e)) => {
                    warn!(frame = frame.index, %e, "Transform failed");
                    Outcome::Failed {
                        reason: e.to_string(),
                    }
                }
                Err(panic) => {
                    let reason = panic_message(&panic);
                    warn!(frame = frame.index, reason, "Transform panicked");
                    Outcome::Failed {
                        reason: format!("panic recovered: {reason}"),
                    }
                }
            };
            // Receiver may already be gone on teardown; the work itself is
            // done either way.
            let _ = tx.send((frame, outcome));
        });

        Ok(WorkHandle { index, rx })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Detection;
    use crate::error::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frame(index: u64) -> Frame {
        Frame {
            index,
            pts_us: index as i64,
            width: 2,
            height: 2,
            data: vec![0; 4],
        }
    }

    /// Tracks the number of concurrently running `apply` calls.
    struct GaugedTransform {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Transform for GaugedTransform {
        fn apply(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            let now = self.running.fetch_add(1, Ordering::AcqRel) + 1;
            self.peak.fetch_max(now, Ordering::AcqRel);
            std::thread::sleep(Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::AcqRel);
            Ok(Vec::new())
        }
    }

    struct FailOnEven;

    impl Transform for FailOnEven {
        fn apply(&self, frame: &Frame) -> Result<Vec<Detection>> {
            if frame.index % 2 == 0 {
                Err(PipelineError::Transform("even frame rejected".into()))
            } else {
                Ok(vec![Detection {
                    label: "odd".into(),
                    score: 1.0,
                }])
            }
        }
    }

    struct PanicOnFirst;

    impl Transform for PanicOnFirst {
        fn apply(&self, frame: &Frame) -> Result<Vec<Detection>> {
            if frame.index == 0 {
                panic!("worker blew up");
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_worker_bound() {
        let transform = Arc::new(GaugedTransform {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = Offloader::new(transform.clone(), 2);

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(pool.submit(frame(i)).await.unwrap());
        }
        for handle in handles {
            handle.join().await.unwrap();
        }
        assert!(transform.peak.load(Ordering::Acquire) <= 2);
    }

    #[tokio::test]
    async fn failure_is_captured_and_pool_continues() {
        let pool = Offloader::new(Arc::new(FailOnEven), 2);

        let (f0, o0) = pool.submit(frame(0)).await.unwrap().join().await.unwrap();
        assert_eq!(f0.index, 0);
        assert!(o0.is_failed());

        let (f1, o1) = pool.submit(frame(1)).await.unwrap().join().await.unwrap();
        assert_eq!(f1.index, 1);
        assert!(matches!(o1, Outcome::Detections(_)));
    }

    #[tokio::test]
    async fn panic_is_recovered_as_failed_outcome() {
        let pool = Offloader::new(Arc::new(PanicOnFirst), 2);

        let (f0, o0) = pool.submit(frame(0)).await.unwrap().join().await.unwrap();
        assert_eq!(f0.index, 0, "frame must survive a worker panic");
        match o0 {
            Outcome::Failed { reason } => assert!(reason.contains("panic recovered")),
            other => panic!("expected failure marker, got {other:?}"),
        }

        // The pool keeps accepting submissions afterwards.
        let (_, o1) = pool.submit(frame(1)).await.unwrap().join().await.unwrap();
        assert_eq!(o1, Outcome::Empty);
    }
}
