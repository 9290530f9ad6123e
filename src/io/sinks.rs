//! Frame sinks.
//!
//! A [`FrameSink`] runs on a blocking-capable thread and is the last owner of
//! each detected frame. Sinks must tolerate `close` being called more than
//! once and being called with zero frames consumed.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::core::traits::FrameSink;
use crate::core::types::DetectedFrame;
use crate::error::{PipelineError, Result};

/// Discards every frame after counting it. The default sink for stress runs.
#[derive(Debug, Default)]
pub struct NullSink {
    consumed: u64,
}

impl FrameSink for NullSink {
    fn consume(&mut self, pair: DetectedFrame) -> Result<()> {
        self.consumed += 1;
        drop(pair);
        Ok(())
    }

    fn close(&mut self) {
        debug!(consumed = self.consumed, "Null sink closed");
    }
}

/// Writes raw frame bytes back out to a file, in arrival order.
///
/// Detections ride along for observability but are not serialized; this sink
/// exists to verify ordered, lossless delivery of the frame payloads.
pub struct RawFileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl RawFileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| {
            PipelineError::ConsumerGone(format!("{}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Opened raw frame sink");
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }
}

impl FrameSink for RawFileSink {
    fn consume(&mut self, pair: DetectedFrame) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            PipelineError::ConsumerGone("sink already closed".to_string())
        })?;
        writer.write_all(&pair.frame.data).map_err(|e| {
            PipelineError::ConsumerGone(format!("{}: {e}", self.path.display()))
        })?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "Flush on close failed");
            }
            debug!(path = %self.path.display(), written = self.written, "Raw frame sink closed");
        }
    }
}

/// Collects every delivered pair into shared memory for later inspection.
pub struct CollectSink {
    collected: Arc<Mutex<Vec<DetectedFrame>>>,
}

impl CollectSink {
    /// Returns the sink and a handle that stays valid after the run finishes.
    pub fn new() -> (Self, Arc<Mutex<Vec<DetectedFrame>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                collected: Arc::clone(&collected),
            },
            collected,
        )
    }
}

impl FrameSink for CollectSink {
    fn consume(&mut self, pair: DetectedFrame) -> Result<()> {
        self.collected.lock().unwrap().push(pair);
        Ok(())
    }

    fn close(&mut self) {
        debug!(
            collected = self.collected.lock().unwrap().len(),
            "Collect sink closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Frame, Outcome};

    fn pair(index: u64, data: Vec<u8>) -> DetectedFrame {
        DetectedFrame {
            frame: Frame {
                index,
                pts_us: 0,
                width: data.len() as u32,
                height: 1,
                data,
            },
            outcome: Outcome::Empty,
        }
    }

    #[test]
    fn raw_file_sink_writes_payloads_in_order() {
        let mut path = std::env::temp_dir();
        path.push(format!("framepipe-sink-{}", std::process::id()));
        let mut sink = RawFileSink::create(&path).unwrap();
        sink.consume(pair(0, vec![1, 2])).unwrap();
        sink.consume(pair(1, vec![3, 4])).unwrap();
        sink.close();
        sink.close();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn raw_file_sink_rejects_consume_after_close() {
        let mut path = std::env::temp_dir();
        path.push(format!("framepipe-sink-closed-{}", std::process::id()));
        let mut sink = RawFileSink::create(&path).unwrap();
        sink.close();
        assert!(matches!(
            sink.consume(pair(0, vec![0])),
            Err(PipelineError::ConsumerGone(_))
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn collect_sink_handle_survives_the_sink() {
        let (mut sink, handle) = CollectSink::new();
        sink.consume(pair(5, vec![9])).unwrap();
        drop(sink);
        let collected = handle.lock().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].frame.index, 5);
    }
}
