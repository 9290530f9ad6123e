//! Typed error hierarchy for the pipeline.
//!
//! Uses `thiserror` for library-grade errors.  Each variant maps to a stable
//! integer code via [`PipelineError::error_code`] for structured telemetry
//! without string parsing; the CLI exits with that code.

/// All errors originating from the framepipe engine.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // ── Source ────────────────────────────────────────────────────────
    #[error("Source open error: {0}")]
    Open(String),

    #[error("Source read error: {message}")]
    Read { message: String, fatal: bool },

    // ── Transform ─────────────────────────────────────────────────────
    #[error("Transform error: {0}")]
    Transform(String),

    // ── Sink ──────────────────────────────────────────────────────────
    #[error("Consume error: {0}")]
    Consume(String),

    #[error("Consumer gone: {0}")]
    ConsumerGone(String),

    // ── Pipeline coordination ─────────────────────────────────────────
    #[error("Operation cancelled by stop signal")]
    Cancelled,

    #[error("Pipeline channel closed unexpectedly")]
    ChannelClosed,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl PipelineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: source
    /// - 2xx: transform
    /// - 3xx: sink
    /// - 4xx: pipeline coordination
    /// - 6xx: invariants
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Open(_) => 100,
            Self::Read { .. } => 101,
            Self::Transform(_) => 200,
            Self::Consume(_) => 300,
            Self::ConsumerGone(_) => 301,
            Self::Cancelled => 400,
            Self::ChannelClosed => 401,
            Self::InvariantViolation(_) => 600,
        }
    }

    /// Whether this error must terminate the run.
    ///
    /// Non-fatal errors are handled at the stage boundary nearest their
    /// origin: the stage logs, drains, and the run completes normally.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Open(_) | Self::ConsumerGone(_) | Self::InvariantViolation(_) => true,
            Self::Read { fatal, .. } => *fatal,
            Self::Transform(_) | Self::Consume(_) | Self::Cancelled | Self::ChannelClosed => false,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, PipelineError>;
