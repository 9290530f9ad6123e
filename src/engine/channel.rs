//! Bounded FIFO transport between two stages.
//!
//! A thin contract layer over `tokio::sync::mpsc` adding the three things
//! the stages need beyond a plain channel:
//!
//! - an in-band [`Message::EndOfStream`] marker with latched, idempotent
//!   drain — after the marker is read every further `get` returns it again
//!   without blocking;
//! - cancellation-aware blocking: a `put`/`get` parked on a full/empty
//!   channel fails with [`PipelineError::Cancelled`] once the stop signal
//!   fires instead of parking forever;
//! - an occupancy gauge with a high-watermark, for the backpressure
//!   invariant (`peak() <= capacity`, always).
//!
//! [`ChannelTx::finish`] consumes the sender, so enqueueing a second marker
//! or an item after the marker is a compile error, not a runtime check.
//!
//! Single-producer/single-consumer per channel in this topology; the
//! channel itself provides all synchronization.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::types::Message;
use crate::error::{PipelineError, Result};

/// Shared occupancy counter for one channel.  Counts regular items only;
/// the end-of-stream marker is not an item in flight.
#[derive(Clone, Debug, Default)]
pub struct DepthGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    depth: AtomicUsize,
    peak: AtomicUsize,
}

impl DepthGauge {
    fn incr(&self) {
        let depth = self.inner.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(depth, Ordering::AcqRel);
    }

    fn decr(&self) {
        self.inner.depth.fetch_sub(1, Ordering::AcqRel);
    }

    /// Items currently in flight inside the channel.
    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    /// Highest occupancy observed since construction.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }
}

/// Create a bounded channel with the given fixed capacity.
///
/// Capacity is in items and never resized.  The token is the pipeline-wide
/// stop signal; both halves observe it.
pub fn channel<T: Send>(
    capacity: usize,
    cancel: CancellationToken,
) -> (ChannelTx<T>, ChannelRx<T>) {
    channel_with_gauge(capacity, cancel, DepthGauge::default())
}

/// [`channel`] with a caller-supplied gauge, so occupancy can be observed
/// without holding either half.
pub fn channel_with_gauge<T: Send>(
    capacity: usize,
    cancel: CancellationToken,
    gauge: DepthGauge,
) -> (ChannelTx<T>, ChannelRx<T>) {
    assert!(capacity >= 1, "channel capacity must be positive");
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelTx {
            tx,
            cancel: cancel.clone(),
            gauge: gauge.clone(),
        },
        ChannelRx {
            rx,
            cancel,
            gauge,
            eos: false,
        },
    )
}

/// Writing half.  Exactly one per channel.
pub struct ChannelTx<T> {
    tx: mpsc::Sender<Message<T>>,
    cancel: CancellationToken,
    gauge: DepthGauge,
}

impl<T: Send> ChannelTx<T> {
    /// Enqueue one item, suspending while the channel is full.
    ///
    /// Fails with `Cancelled` once the stop signal is observed while
    /// waiting, or `ChannelClosed` if the reader vanished without one.
    pub async fn put(&self, item: T) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(Message::Item(item));
                    self.gauge.incr();
                    Ok(())
                }
                Err(_) => Err(self.closed_error()),
            },
        }
    }

    /// Blocking-thread variant of [`put`](Self::put).
    ///
    /// Checks the stop signal before parking; while parked it is unblocked
    /// by the reader stage dropping its half on cancellation, which every
    /// stage does within one suspension-point cycle.
    pub fn blocking_put(&self, item: T) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match self.tx.blocking_send(Message::Item(item)) {
            Ok(()) => {
                self.gauge.incr();
                Ok(())
            }
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Enqueue the single end-of-stream marker, consuming the sender.
    ///
    /// Under cancellation the marker is still delivered if space remains —
    /// stages downstream must not wait forever for input that will never
    /// arrive — and silently skipped if the reader is already unwinding.
    pub async fn finish(self) -> Result<()> {
        let ChannelTx { tx, cancel, .. } = self;
        tokio::select! {
            res = tx.send(Message::EndOfStream) => res.map_err(|_| {
                if cancel.is_cancelled() {
                    PipelineError::Cancelled
                } else {
                    PipelineError::ChannelClosed
                }
            }),
            _ = cancel.cancelled() => {
                let _ = tx.try_send(Message::EndOfStream);
                Ok(())
            }
        }
    }

    /// Blocking-thread variant of [`finish`](Self::finish).
    pub fn blocking_finish(self) -> Result<()> {
        let ChannelTx { tx, cancel, .. } = self;
        match tx.blocking_send(Message::EndOfStream) {
            Ok(()) => Ok(()),
            // Reader already unwound under cancellation; nothing is waiting
            // for the marker.
            Err(_) if cancel.is_cancelled() => Ok(()),
            Err(_) => Err(PipelineError::ChannelClosed),
        }
    }

    /// Occupancy gauge shared with the reading half.
    pub fn gauge(&self) -> DepthGauge {
        self.gauge.clone()
    }

    fn closed_error(&self) -> PipelineError {
        if self.cancel.is_cancelled() {
            PipelineError::Cancelled
        } else {
            PipelineError::ChannelClosed
        }
    }
}

/// Reading half.  Exactly one per channel.
pub struct ChannelRx<T> {
    rx: mpsc::Receiver<Message<T>>,
    cancel: CancellationToken,
    gauge: DepthGauge,
    eos: bool,
}

impl<T: Send> ChannelRx<T> {
    /// Dequeue the next message in FIFO order, suspending while empty.
    ///
    /// A pending value is always delivered, even after cancellation; only
    /// an empty wait fails with `Cancelled`.  After the end-of-stream
    /// marker has been read — or the writer vanished without one — every
    /// call returns the marker again immediately.
    pub async fn get(&mut self) -> Result<Message<T>> {
        if self.eos {
            return Ok(Message::EndOfStream);
        }
        match self.rx.try_recv() {
            Ok(msg) => Ok(self.note(msg)),
            Err(TryRecvError::Disconnected) => Ok(self.latch_eos()),
            Err(TryRecvError::Empty) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
                    msg = self.rx.recv() => match msg {
                        Some(msg) => Ok(self.note(msg)),
                        None => Ok(self.latch_eos()),
                    },
                }
            }
        }
    }

    /// Blocking-thread variant of [`get`](Self::get).
    ///
    /// Does not observe the stop signal while parked: the upstream stage's
    /// own marker (emitted on every exit path, cancellation included)
    /// or its dropped sender is what unparks this call.
    pub fn blocking_get(&mut self) -> Result<Message<T>> {
        if self.eos {
            return Ok(Message::EndOfStream);
        }
        match self.rx.blocking_recv() {
            Some(msg) => Ok(self.note(msg)),
            None => Ok(self.latch_eos()),
        }
    }

    /// Occupancy gauge shared with the writing half.
    pub fn gauge(&self) -> DepthGauge {
        self.gauge.clone()
    }

    fn note(&mut self, msg: Message<T>) -> Message<T> {
        match &msg {
            Message::Item(_) => self.gauge.decr(),
            Message::EndOfStream => self.eos = true,
        }
        msg
    }

    fn latch_eos(&mut self) -> Message<T> {
        debug!("channel: writer vanished, latching end-of-stream");
        self.eos = true;
        Message::EndOfStream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = channel::<u32>(4, cancel);
        for i in 0..4 {
            tx.put(i).await.unwrap();
        }
        tx.finish().await.unwrap();
        for i in 0..4 {
            assert_eq!(rx.get().await.unwrap(), Message::Item(i));
        }
        assert_eq!(rx.get().await.unwrap(), Message::EndOfStream);
    }

    #[tokio::test]
    async fn end_of_stream_drain_is_idempotent() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = channel::<u32>(1, cancel);
        tx.finish().await.unwrap();
        for _ in 0..3 {
            let msg = tokio::time::timeout(Duration::from_secs(1), rx.get())
                .await
                .expect("drain must never block")
                .unwrap();
            assert_eq!(msg, Message::EndOfStream);
        }
    }

    #[tokio::test]
    async fn put_blocks_while_full_and_resumes_on_get() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = channel::<u32>(1, cancel);
        tx.put(0).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.put(1)).await;
        assert!(blocked.is_err(), "put into a full channel must suspend");

        assert_eq!(rx.get().await.unwrap(), Message::Item(0));
        tokio::time::timeout(Duration::from_secs(1), tx.put(1))
            .await
            .expect("put must resume once space frees up")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_empty_get() {
        let cancel = CancellationToken::new();
        let (_tx, mut rx) = channel::<u32>(1, cancel.clone());

        let waiter = tokio::spawn(async move { rx.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled get must return promptly")
            .unwrap();
        assert!(matches!(res, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_unblocks_full_put() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = channel::<u32>(1, cancel.clone());
        tx.put(0).await.unwrap();

        let cancel2 = cancel.clone();
        let writer = tokio::spawn(async move { tx.put(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel2.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("cancelled put must return promptly")
            .unwrap();
        assert!(matches!(res, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn pending_item_survives_cancellation() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = channel::<u32>(2, cancel.clone());
        tx.put(7).await.unwrap();
        cancel.cancel();
        // Already-enqueued values are still delivered after a stop request.
        assert_eq!(rx.get().await.unwrap(), Message::Item(7));
    }

    #[tokio::test]
    async fn dropped_writer_latches_end_of_stream() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = channel::<u32>(2, cancel);
        tx.put(1).await.unwrap();
        drop(tx);
        assert_eq!(rx.get().await.unwrap(), Message::Item(1));
        assert_eq!(rx.get().await.unwrap(), Message::EndOfStream);
        assert_eq!(rx.get().await.unwrap(), Message::EndOfStream);
    }

    #[tokio::test]
    async fn gauge_tracks_depth_and_peak() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = channel::<u32>(3, cancel);
        let gauge = tx.gauge();
        tx.put(0).await.unwrap();
        tx.put(1).await.unwrap();
        assert_eq!(gauge.depth(), 2);
        rx.get().await.unwrap();
        assert_eq!(gauge.depth(), 1);
        assert_eq!(gauge.peak(), 2);
        assert!(gauge.peak() <= 3);
    }
}
