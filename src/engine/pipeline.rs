//! Pipeline orchestration — source → transform → sink.
//!
//! # Architecture
//!
//! Three concurrent stages connected by bounded channels:
//!
//! ```text
//! ┌──────────┐  ch(raw)  ┌───────────┐ ch(detected) ┌──────────┐
//! │  Source  │──────────►│ Transform │─────────────►│   Sink   │
//! │(blocking)│           │  (async)  │              │(blocking)│
//! └──────────┘           └───────────┘              └──────────┘
//! ```
//!
//! # Backpressure
//!
//! All channels are bounded.  When downstream cannot keep up, upstream
//! `put` suspends — no dropped frames, no spin loops, no sleep polling.
//! The sink drives throughput (pull model): a slow consumer throttles the
//! source end to end.
//!
//! # Ordering
//!
//! Within one channel, FIFO is absolute.  Across the pipeline, no frame
//! overtakes an earlier one: the transform stage re-serializes offloader
//! completions through an in-order pending set bounded by the worker
//! count, so out-of-order worker finishes never reach the sink out of
//! order.  That bound is also what keeps memory finite while workers run
//! ahead of the sink.
//!
//! # Shutdown protocol
//!
//! 1. **Normal EOS**: the source exhausts input → enqueues one
//!    `EndOfStream` marker → transform drains its pending set and relays
//!    its own marker → sink terminates.
//! 2. **Cancellation**: `CancellationToken::cancel()` → every stage checks
//!    the token at each suspension point, drains in-flight work, and still
//!    relays the marker downstream.
//! 3. **Error**: a stage returns `Err` → the token is cancelled → cascade.
//!    The `JoinSet` barrier collects the first error.
//!
//! After all tasks are joined the pipeline validates the count
//! monotonicity invariant (read ≥ transformed ≥ consumed) and reports
//! final metrics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::traits::{DetectionCallback, FrameSink, FrameSource, Transform};
use crate::core::types::{DetectedFrame, Frame, Message, Outcome};
use crate::engine::channel::{channel_with_gauge, ChannelRx, ChannelTx, DepthGauge};
use crate::engine::offload::{Offloader, WorkHandle, DEFAULT_WORKERS};
use crate::error::{PipelineError, Result};

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Atomic per-stage frame counters.
#[derive(Debug)]
pub struct PipelineMetrics {
    /// Frames the source pushed into the pipeline.
    pub frames_read: AtomicU64,
    /// Pairs the transform stage forwarded (failed outcomes included).
    pub frames_transformed: AtomicU64,
    /// Pairs the sink successfully consumed.
    pub frames_consumed: AtomicU64,
    /// Pairs that carry a failure marker instead of detections.
    pub transform_failures: AtomicU64,
    /// Callback notifications that errored or were dropped on overflow.
    pub callback_failures: AtomicU64,
}

impl PipelineMetrics {
    /// Allocate fresh metrics with all counters zeroed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames_read: AtomicU64::new(0),
            frames_transformed: AtomicU64::new(0),
            frames_consumed: AtomicU64::new(0),
            transform_failures: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
        })
    }

    /// Validate count monotonicity.  Should hold at shutdown.
    pub fn validate(&self) -> bool {
        let r = self.frames_read.load(Ordering::Acquire);
        let t = self.frames_transformed.load(Ordering::Acquire);
        let c = self.frames_consumed.load(Ordering::Acquire);
        r >= t && t >= c
    }

    /// Report final counters.
    pub fn report(&self) {
        info!(
            read = self.frames_read.load(Ordering::Relaxed),
            transformed = self.frames_transformed.load(Ordering::Relaxed),
            consumed = self.frames_consumed.load(Ordering::Relaxed),
            transform_failures = self.transform_failures.load(Ordering::Relaxed),
            callback_failures = self.callback_failures.load(Ordering::Relaxed),
            "Pipeline counters"
        );
    }
}

// ─── Pipeline config ────────────────────────────────────────────────────────

/// Runtime configuration for a [`Pipeline`] instance.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Channel capacity: source → transform.
    pub raw_capacity: usize,
    /// Channel capacity: transform → sink.
    pub detected_capacity: usize,
    /// Offloader worker bound (also the pending-set bound).
    pub workers: usize,
    /// Callback dispatch queue capacity; overflow drops notifications.
    pub callback_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_capacity: 4,
            detected_capacity: 4,
            workers: DEFAULT_WORKERS,
            callback_capacity: 16,
        }
    }
}

/// Terminal counters for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub frames_read: u64,
    pub frames_transformed: u64,
    pub frames_consumed: u64,
    pub transform_failures: u64,
    pub callback_failures: u64,
    pub elapsed_ms: u64,
    /// Highest occupancy observed on the source → transform channel.
    pub raw_peak_depth: usize,
    /// Highest occupancy observed on the transform → sink channel.
    pub detected_peak_depth: usize,
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// Bounded three-stage pipeline: source → transform → sink.
///
/// Call [`run`](Self::run) to execute to completion or cancellation.
pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    raw_depth: DepthGauge,
    detected_depth: DepthGauge,
}

impl Pipeline {
    /// Create a pipeline with the given config.  Topology is fixed here;
    /// stages and capacities never change after construction.
    pub fn new(config: PipelineConfig) -> Self {
        assert!(config.workers >= 1, "workers must be positive");
        Self {
            config,
            cancel: CancellationToken::new(),
            metrics: PipelineMetrics::new(),
            raw_depth: DepthGauge::default(),
            detected_depth: DepthGauge::default(),
        }
    }

    /// Return a clone of the pipeline's cancellation token.
    ///
    /// Cancelling it requests cooperative shutdown of all stages.  Setting
    /// it more than once is a no-op; it never reverts.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative shutdown.  Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Shared atomic counters for this pipeline.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Current occupancy of the (raw, detected) channels.
    pub fn queue_depths(&self) -> (usize, usize) {
        (self.raw_depth.depth(), self.detected_depth.depth())
    }

    /// Run the full pipeline to completion or cancellation.
    ///
    /// # Shutdown guarantee
    ///
    /// When this function returns:
    /// 1. Every stage has reached its terminated state.
    /// 2. Source and sink resources are closed.
    /// 3. All offloaded work has completed; none was abandoned.
    /// 4. Count monotonicity has been validated.
    ///
    /// The first fatal condition, if any, is the `Err`; per-item transform
    /// failures are counted in the report and in [`metrics`](Self::metrics).
    #[instrument(skip_all, name = "pipeline")]
    pub async fn run<S, K>(
        &self,
        source: S,
        transform: Arc<dyn Transform>,
        sink: K,
        callback: Option<Arc<dyn DetectionCallback>>,
    ) -> Result<RunReport>
    where
        S: FrameSource,
        K: FrameSink,
    {
        let start = Instant::now();
        let cancel = self.cancel.clone();
        let metrics = self.metrics.clone();

        let (tx_raw, rx_raw) =
            channel_with_gauge::<Frame>(self.config.raw_capacity, cancel.clone(), self.raw_depth.clone());
        let (tx_detected, rx_detected) = channel_with_gauge::<DetectedFrame>(
            self.config.detected_capacity,
            cancel.clone(),
            self.detected_depth.clone(),
        );

        let mut tasks = JoinSet::new();

        // ── Callback dispatcher (optional, decoupled from the worker pool) ──
        let callback_tx = callback.map(|cb| {
            let (tx, mut rx) = mpsc::channel::<DetectedFrame>(self.config.callback_capacity);
            let metrics = metrics.clone();
            tasks.spawn(async move {
                while let Some(pair) = rx.recv().await {
                    if let Err(e) = cb.notify(&pair) {
                        warn!(frame = pair.frame.index, %e, "Detection callback failed");
                        metrics.callback_failures.fetch_add(1, Ordering::Release);
                    }
                }
                debug!("Callback dispatcher drained");
                Ok(())
            });
            tx
        });

        // ── Stage 1: Source (blocking thread — reads may block on I/O) ──
        {
            let cancel = cancel.clone();
            let metrics = metrics.clone();
            tasks.spawn_blocking(move || source_stage(source, tx_raw, &cancel, &metrics));
        }

        // ── Stage 2: Transform (async — offloads CPU work, re-serializes) ──
        // Observes cancellation through its channel halves, which carry the
        // token; no direct token handle needed.
        {
            let metrics = metrics.clone();
            let pool = Offloader::new(transform, self.config.workers);
            tasks.spawn(async move {
                transform_stage(rx_raw, tx_detected, pool, callback_tx, &metrics).await
            });
        }

        // ── Stage 3: Sink (blocking thread — consumer may block briefly) ──
        // The sink is the pull-model consumer; its pace drives backpressure
        // through the entire pipeline.
        {
            let cancel = cancel.clone();
            let metrics = metrics.clone();
            tasks.spawn_blocking(move || sink_stage(sink, rx_detected, &cancel, &metrics));
        }

        // ── Collect results — shutdown barrier ──

        let mut first_error: Option<PipelineError> = None;

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(%e, code = e.error_code(), "Pipeline stage failed");
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    error!(%join_err, "Pipeline task panicked");
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(PipelineError::InvariantViolation(format!(
                            "Task panic: {join_err}"
                        )));
                    }
                }
            }
        }

        // ── Post-shutdown: validate invariants, report metrics ──

        debug_assert!(
            metrics.validate(),
            "Pipeline count violation: read={} transformed={} consumed={}",
            metrics.frames_read.load(Ordering::Acquire),
            metrics.frames_transformed.load(Ordering::Acquire),
            metrics.frames_consumed.load(Ordering::Acquire),
        );

        let report = RunReport {
            frames_read: metrics.frames_read.load(Ordering::Acquire),
            frames_transformed: metrics.frames_transformed.load(Ordering::Acquire),
            frames_consumed: metrics.frames_consumed.load(Ordering::Acquire),
            transform_failures: metrics.transform_failures.load(Ordering::Acquire),
            callback_failures: metrics.callback_failures.load(Ordering::Acquire),
            elapsed_ms: start.elapsed().as_millis() as u64,
            raw_peak_depth: self.raw_depth.peak(),
            detected_peak_depth: self.detected_depth.peak(),
        };

        info!(
            read = report.frames_read,
            consumed = report.frames_consumed,
            transform_failures = report.transform_failures,
            elapsed_ms = report.elapsed_ms,
            "Pipeline finished"
        );
        metrics.report();

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Synthetic self-check — validates pipeline mechanics without real I/O.
    ///
    /// Runs `frames` generated frames through a passthrough transform into
    /// a counting sink under a stall timeout, then asserts that every frame
    /// read was consumed.
    pub async fn stress(config: PipelineConfig, frames: u64) -> Result<RunReport> {
        use crate::io::sinks::NullSink;
        use crate::io::sources::SyntheticSource;
        use crate::transforms::MockTransform;

        let pipeline = Pipeline::new(config);
        let source = SyntheticSource::new(frames, Duration::from_micros(100));

        info!(frames, "Stress run starting");
        let timeout = Duration::from_secs(30 + frames / 200);
        let report = tokio::time::timeout(
            timeout,
            pipeline.run(
                source,
                Arc::new(MockTransform::default()),
                NullSink::default(),
                None,
            ),
        )
        .await
        .map_err(|_| {
            PipelineError::InvariantViolation("Stress run timed out — pipeline stall".into())
        })??;

        if report.frames_read != report.frames_consumed {
            return Err(PipelineError::InvariantViolation(format!(
                "Frame count mismatch: read={} consumed={}",
                report.frames_read, report.frames_consumed
            )));
        }
        info!(?report, "Stress run passed");
        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  STAGE IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Stage 1 — Source.
///
/// Runs on a blocking thread.  Pulls raw frames from the external producer
/// and pushes them downstream; `blocking_put` propagates backpressure from
/// the rest of the pipeline back into the read loop.
///
/// Draining runs on every exit path: the end-of-stream marker is enqueued
/// exactly once and the source resource is always released.
fn source_stage<S: FrameSource>(
    mut source: S,
    tx: ChannelTx<Frame>,
    cancel: &CancellationToken,
    metrics: &PipelineMetrics,
) -> Result<()> {
    let mut status: Result<()> = Ok(());

    match source.open() {
        Ok(()) => loop {
            if cancel.is_cancelled() {
                debug!("Source: stop observed");
                break;
            }
            match source.read_next() {
                Ok(Some(frame)) => match tx.blocking_put(frame) {
                    Ok(()) => {
                        metrics.frames_read.fetch_add(1, Ordering::Release);
                    }
                    Err(PipelineError::Cancelled) => {
                        debug!("Source: put cancelled");
                        break;
                    }
                    Err(e) => {
                        status = Err(e);
                        break;
                    }
                },
                Ok(None) => {
                    info!(
                        frames = metrics.frames_read.load(Ordering::Acquire),
                        "Source: end of stream"
                    );
                    break;
                }
                Err(e) => {
                    // A failed read ends the stream like exhaustion; only a
                    // fatal one becomes the run's terminal status.
                    if e.is_fatal() {
                        error!(%e, "Source read failed, draining");
                        status = Err(e);
                    } else {
                        warn!(%e, "Source read failed, draining");
                    }
                    break;
                }
            }
        },
        Err(e) => {
            error!(%e, "Source open failed");
            status = Err(e);
        }
    }

    if let Err(e) = tx.blocking_finish() {
        debug!(%e, "Source: could not deliver end-of-stream marker");
        if status.is_ok() {
            status = Err(e);
        }
    }
    source.close();
    status
}

/// Stage 2 — Transform.
///
/// Pulls frames, submits them to the offloader, and forwards (frame,
/// outcome) pairs strictly in arrival order.  Only the front of the
/// pending set ever leaves, and it leaves as soon as its worker resolves —
/// the stage races the front handle against the next incoming frame, so a
/// completed result never sits behind an idle source.  The set is bounded
/// by the worker count: when it is full, the front is joined and forwarded
/// before the next frame is submitted.  Either way a later frame cannot
/// overtake an earlier one even if its worker finished first.
async fn transform_stage(
    mut rx: ChannelRx<Frame>,
    tx: ChannelTx<DetectedFrame>,
    pool: Offloader,
    callback_tx: Option<mpsc::Sender<DetectedFrame>>,
    metrics: &PipelineMetrics,
) -> Result<()> {
    let mut pending: VecDeque<WorkHandle> = VecDeque::with_capacity(pool.workers());
    let mut status: Result<()> = Ok(());
    let mut forwarding = true;
    let mut last_forwarded: Option<u64> = None;

    loop {
        let have_pending = !pending.is_empty();
        let msg = tokio::select! {
            biased;
            resolved = wait_front(&mut pending), if have_pending => {
                pending.pop_front();
                match resolved {
                    Ok((frame, outcome)) => {
                        match forward_resolved(
                            &tx,
                            callback_tx.as_ref(),
                            frame,
                            outcome,
                            &mut last_forwarded,
                            metrics,
                        )
                        .await
                        {
                            Ok(()) => {}
                            Err(PipelineError::Cancelled) => {
                                forwarding = false;
                                break;
                            }
                            Err(e) => {
                                status = Err(e);
                                forwarding = false;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        status = Err(e);
                        forwarding = false;
                        break;
                    }
                }
                continue;
            }
            msg = rx.get() => msg,
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(PipelineError::Cancelled) => {
                debug!("Transform: stop observed");
                break;
            }
            Err(e) => {
                status = Err(e);
                break;
            }
        };
        let frame = match msg {
            Message::Item(frame) => frame,
            Message::EndOfStream => {
                debug!("Transform: end of stream, draining pending set");
                break;
            }
        };

        if pending.len() == pool.workers() {
            if let Some(handle) = pending.pop_front() {
                match forward_pair(&tx, callback_tx.as_ref(), handle, &mut last_forwarded, metrics)
                    .await
                {
                    Ok(()) => {}
                    Err(PipelineError::Cancelled) => {
                        forwarding = false;
                        break;
                    }
                    Err(e) => {
                        status = Err(e);
                        forwarding = false;
                        break;
                    }
                }
            }
        }

        match pool.submit(frame).await {
            Ok(handle) => pending.push_back(handle),
            Err(e) => {
                status = Err(e);
                break;
            }
        }
    }

    // Draining: every outstanding submission runs to completion — no work
    // is abandoned.  Pairs are forwarded in order while the sink is still
    // there; after a stop they are joined and discarded.
    while let Some(handle) = pending.pop_front() {
        if forwarding {
            match forward_pair(&tx, callback_tx.as_ref(), handle, &mut last_forwarded, metrics)
                .await
            {
                Ok(()) => {}
                Err(PipelineError::Cancelled) | Err(PipelineError::ChannelClosed) => {
                    forwarding = false;
                }
                Err(e) => {
                    if status.is_ok() {
                        status = Err(e);
                    }
                    forwarding = false;
                }
            }
        } else if let Err(e) = handle.join().await {
            debug!(%e, "Transform: discarded pending unit during unwind");
        }
    }

    // The marker still propagates on every exit path, stop included, so
    // the sink never waits for input that will not arrive.
    if let Err(e) = tx.finish().await {
        debug!(%e, "Transform: could not deliver end-of-stream marker");
        if status.is_ok() {
            status = Err(e);
        }
    }
    status
}

/// Resolve the oldest outstanding unit in place.  The caller pops it once
/// this returns; with an empty set (guarded out above) it parks forever.
async fn wait_front(pending: &mut VecDeque<WorkHandle>) -> Result<(Frame, Outcome)> {
    match pending.front_mut() {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}

/// Join one completed unit and forward its pair downstream.
async fn forward_pair(
    tx: &ChannelTx<DetectedFrame>,
    callback_tx: Option<&mpsc::Sender<DetectedFrame>>,
    handle: WorkHandle,
    last_forwarded: &mut Option<u64>,
    metrics: &PipelineMetrics,
) -> Result<()> {
    debug_assert!(
        last_forwarded.map_or(true, |prev| prev < handle.index()),
        "pair for frame {} would overtake frame {:?}",
        handle.index(),
        last_forwarded,
    );
    let (frame, outcome) = handle.join().await?;
    forward_resolved(tx, callback_tx, frame, outcome, last_forwarded, metrics).await
}

/// Forward one (frame, outcome) pair downstream, notifying the callback
/// queue first (best effort — overflow drops, never blocks).
async fn forward_resolved(
    tx: &ChannelTx<DetectedFrame>,
    callback_tx: Option<&mpsc::Sender<DetectedFrame>>,
    frame: Frame,
    outcome: Outcome,
    last_forwarded: &mut Option<u64>,
    metrics: &PipelineMetrics,
) -> Result<()> {
    debug_assert!(
        last_forwarded.map_or(true, |prev| prev < frame.index),
        "pair for frame {} would overtake frame {:?}",
        frame.index,
        last_forwarded,
    );
    let index = frame.index;
    if outcome.is_failed() {
        metrics.transform_failures.fetch_add(1, Ordering::Release);
    }
    let pair = DetectedFrame { frame, outcome };

    if let Some(cb) = callback_tx {
        match cb.try_send(pair.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    frame = dropped.frame.index,
                    "Callback queue full, dropping notification"
                );
                metrics.callback_failures.fetch_add(1, Ordering::Release);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    tx.put(pair).await?;
    *last_forwarded = Some(index);
    metrics.frames_transformed.fetch_add(1, Ordering::Release);
    Ok(())
}

/// Stage 3 — Sink.
///
/// Pull-model consumer: its pace determines pipeline throughput.  On a
/// stop request it leaves queued pairs behind; on end of stream it
/// terminates after the marker.  The consumer resource is closed on every
/// exit path.
fn sink_stage<K: FrameSink>(
    mut sink: K,
    mut rx: ChannelRx<DetectedFrame>,
    cancel: &CancellationToken,
    metrics: &PipelineMetrics,
) -> Result<()> {
    let mut status: Result<()> = Ok(());

    loop {
        if cancel.is_cancelled() {
            debug!("Sink: stop observed, leaving queued pairs");
            break;
        }
        match rx.blocking_get() {
            Ok(Message::Item(pair)) => match sink.consume(pair) {
                Ok(()) => {
                    metrics.frames_consumed.fetch_add(1, Ordering::Release);
                }
                Err(e @ PipelineError::ConsumerGone(_)) => {
                    // Producing into a dead consumer pins bounded-channel
                    // slots forever; escalate so upstream winds down too.
                    error!(%e, "Consumer resource gone, stopping pipeline");
                    cancel.cancel();
                    status = Err(e);
                    break;
                }
                Err(e) => {
                    warn!(%e, "Consume failed, continuing");
                }
            },
            Ok(Message::EndOfStream) => {
                info!(
                    frames = metrics.frames_consumed.load(Ordering::Acquire),
                    "Sink: end of stream"
                );
                break;
            }
            Err(e) => {
                status = Err(e);
                break;
            }
        }
    }

    sink.close();
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_bounds() {
        let config = PipelineConfig::default();
        assert_eq!(config.raw_capacity, 4);
        assert_eq!(config.detected_capacity, 4);
        assert_eq!(config.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn metrics_validate_monotonicity() {
        let metrics = PipelineMetrics::new();
        metrics.frames_read.store(10, Ordering::Release);
        metrics.frames_transformed.store(8, Ordering::Release);
        metrics.frames_consumed.store(8, Ordering::Release);
        assert!(metrics.validate());

        metrics.frames_consumed.store(9, Ordering::Release);
        assert!(!metrics.validate());
    }

    #[test]
    fn stop_is_idempotent() {
        let pipeline = Pipeline::new(PipelineConfig::default());
        let token = pipeline.cancel_token();
        pipeline.stop();
        pipeline.stop();
        assert!(token.is_cancelled());
    }
}
