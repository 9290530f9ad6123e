//! Framepipe — bounded three-stage frame-processing pipeline.
//!
//! # Architecture
//!
//! Three concurrent stages connected by bounded channels, with a bounded
//! worker pool inside the transform stage:
//!
//! ```text
//! ┌──────────┐  ch(4)   ┌───────────┐  ch(4)   ┌──────────┐
//! │  Source  │─────────►│ Transform │─────────►│   Sink   │
//! │(blocking)│          │  (async)  │          │(blocking)│
//! └──────────┘          └─────┬─────┘          └──────────┘
//!                             │ submit / join (in order)
//!                       ┌─────▼─────┐
//!                       │ Offloader │  N blocking workers
//!                       └───────────┘
//! ```
//!
//! # Backpressure
//!
//! All channels are bounded.  When downstream cannot keep up, upstream
//! `put` suspends — no dropped frames, no spin loops.  The sink drives
//! throughput (pull model), and a slow sink throttles the source.
//!
//! # Shutdown protocol
//!
//! 1. **Normal EOS**: the source exhausts its input → enqueues one
//!    `EndOfStream` marker → every stage relays its own marker downstream.
//! 2. **Cancellation**: `CancellationToken::cancel()` → every stage checks
//!    the token at each suspension point → drains and relays the marker.
//! 3. **Error**: a stage returns `Err` → the token is cancelled →
//!    cooperative unwind.  The `JoinSet` barrier collects the first error.
//!
//! Worker pools are drained, never abandoned: in-flight transforms run to
//! completion and their results are forwarded in input order.
//!
//! # Module layout
//!
//! - [`core`] — frame/outcome types and the collaborator traits
//! - [`engine`] — bounded channel, work offloader, pipeline orchestration
//! - [`io`] — file and synthetic sources/sinks
//! - [`transforms`] — built-in transforms (edge map, mock)
//! - [`error`] — typed error hierarchy

pub mod core;
pub mod engine;
pub mod error;
pub mod io;
pub mod transforms;

pub use crate::core::traits::{DetectionCallback, FrameSink, FrameSource, Transform};
pub use crate::core::types::{DetectedFrame, Detection, Frame, Message, Outcome};
pub use engine::pipeline::{Pipeline, PipelineConfig, PipelineMetrics, RunReport};
pub use error::{PipelineError, Result};
