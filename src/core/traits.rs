//! Collaborator traits consumed by the pipeline core.
//!
//! These are the narrow seams behind which decoding, detection algorithms,
//! and rendering live.  The core never touches a concrete source, transform,
//! or sink type.

use crate::core::types::{DetectedFrame, Detection, Frame};
use crate::error::Result;

/// External frame producer (file reader, capture device, test generator).
///
/// `read_next` may block on I/O; the source stage runs it on a dedicated
/// blocking thread and checks the stop signal between reads, so a single
/// read is the bound on stop latency.
pub trait FrameSource: Send + 'static {
    /// Acquire the underlying resource.  Called once, before the first read.
    fn open(&mut self) -> Result<()>;

    /// Read the next frame, or `None` at end-of-source.
    fn read_next(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying resource.  Idempotent; called on every exit
    /// path, including failure.
    fn close(&mut self);
}

/// CPU-bound frame transform, shared across offloader workers.
///
/// Pure with respect to pipeline state: `apply` must not depend on the
/// order or concurrency in which frames are handed to it.  An error is
/// captured per item and never crashes a worker permanently.
pub trait Transform: Send + Sync + 'static {
    /// Apply the transform to one frame.  An empty vec means "nothing to
    /// report" and is forwarded as [`Outcome::Empty`](crate::Outcome::Empty).
    fn apply(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// External result consumer (display, recorder, test collector).
pub trait FrameSink: Send + 'static {
    /// Hand one pair to the consumer.  May block briefly; implementations
    /// should return promptly so a stop request is not delayed by one slow
    /// render.  Returning [`ConsumerGone`](crate::PipelineError::ConsumerGone)
    /// stops the whole pipeline; any other error is logged and the run
    /// continues.
    fn consume(&mut self, pair: DetectedFrame) -> Result<()>;

    /// Release the consumer resource.  Idempotent.
    fn close(&mut self);
}

// Lets callers select a sink at runtime without making the pipeline generic
// over trait objects.
impl FrameSink for Box<dyn FrameSink> {
    fn consume(&mut self, pair: DetectedFrame) -> Result<()> {
        (**self).consume(pair)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Optional per-pair observer, invoked off the transform path.
///
/// Strictly best-effort: failures are logged and swallowed, and a slow
/// callback can drop notifications but can never stall the worker pool.
pub trait DetectionCallback: Send + Sync + 'static {
    fn notify(&self, pair: &DetectedFrame) -> Result<()>;
}
