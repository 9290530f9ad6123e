//! Frame and outcome types moved between stages.
//!
//! Ownership transfers with the value: once a stage pushes a `Frame` into a
//! channel it holds no reference to it.  The transform stage is the only
//! component that keeps a frame alive next to its outcome, inside the
//! [`DetectedFrame`](DetectedFrame) pair it forwards.

/// One unit of pipeline work — a decoded grayscale frame.
///
/// `index` is the arrival order assigned by the source and is the frame's
/// identity for end-to-end ordering checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Arrival order, 0-based, assigned by the source.
    pub index: u64,
    /// Presentation timestamp in microseconds.
    ///
    /// Source-specific time bases are converted at the read boundary so
    /// downstream stages operate on one stable unit.
    pub pts_us: i64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// 8-bit grayscale plane, `width * height` bytes, row-major.
    pub data: Vec<u8>,
}

/// A single detection record produced by a transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Detection kind, e.g. `"edge_map"`.
    pub label: String,
    /// Transform-defined confidence or magnitude in `[0, 1]`.
    pub score: f32,
}

/// Transform output paired with its frame.
///
/// `Failed` is the per-item failure marker: a transform error never aborts
/// the run, the affected pair carries the reason instead of detections so
/// the sink can decide how to render it.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// One or more detections.
    Detections(Vec<Detection>),
    /// The transform ran and had nothing to report.
    Empty,
    /// The transform failed on this frame.
    Failed { reason: String },
}

impl Outcome {
    /// Return `true` if this outcome is the per-item failure marker.
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// The (frame, outcome) pair flowing from the transform stage to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFrame {
    pub frame: Frame,
    pub outcome: Outcome,
}

/// Channel payload: a regular item or the end-of-stream marker.
///
/// The marker is a dedicated tag, distinct from every valid item including
/// an empty or failed outcome — never an ambiguous sentinel value.  At most
/// one marker is enqueued per channel per run, and it is always the last
/// value read.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    Item(T),
    EndOfStream,
}

impl<T> Message<T> {
    /// Return `true` if this message is the end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Message::EndOfStream)
    }
}
