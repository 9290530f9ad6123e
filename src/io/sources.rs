//! Frame sources.
//!
//! A [`FrameSource`] runs on a blocking-capable thread, so these
//! implementations use ordinary synchronous file I/O and `thread::sleep`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::core::traits::FrameSource;
use crate::core::types::Frame;
use crate::error::{PipelineError, Result};

/// Microseconds between presentation timestamps at a nominal 30 fps.
const FRAME_INTERVAL_US: i64 = 33_333;

/// Sanity cap on a single frame's payload; geometry comes from the CLI.
const MAX_FRAME_BYTES: u64 = 1 << 30;

fn validate_dimensions(width: u32, height: u32) {
    assert!(width > 0 && height > 0, "frame dimensions must be non-zero");
    assert!(
        u64::from(width) * u64::from(height) <= MAX_FRAME_BYTES,
        "frame payload would exceed {MAX_FRAME_BYTES} bytes"
    );
}

/// Generates a fixed number of synthetic grayscale frames at a paced cadence.
///
/// Used by the `stress` command and by tests that need a source with
/// predictable timing and content. Each frame is filled with a byte derived
/// from its index, so downstream stages can verify they received the frame
/// they expected.
pub struct SyntheticSource {
    frames: u64,
    cadence: Duration,
    width: u32,
    height: u32,
    emitted: u64,
}

impl SyntheticSource {
    pub fn new(frames: u64, cadence: Duration) -> Self {
        Self {
            frames,
            cadence,
            width: 64,
            height: 64,
            emitted: 0,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        validate_dimensions(width, height);
        self.width = width;
        self.height = height;
        self
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        debug!(
            frames = self.frames,
            cadence_us = self.cadence.as_micros() as u64,
            "Synthetic source ready"
        );
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<Frame>> {
        if self.emitted >= self.frames {
            return Ok(None);
        }
        if !self.cadence.is_zero() {
            std::thread::sleep(self.cadence);
        }
        let index = self.emitted;
        self.emitted += 1;
        let fill = (index % 251) as u8;
        Ok(Some(Frame {
            index,
            pts_us: index as i64 * FRAME_INTERVAL_US,
            width: self.width,
            height: self.height,
            data: vec![fill; self.width as usize * self.height as usize],
        }))
    }

    fn close(&mut self) {
        debug!(emitted = self.emitted, "Synthetic source closed");
    }
}

/// Reads tightly packed 8-bit grayscale frames from a raw file.
///
/// The file carries no header; frame geometry comes from the caller. A
/// truncated trailing frame is reported as a non-fatal read error so the
/// pipeline drains what it already produced.
pub struct RawFileSource {
    path: PathBuf,
    width: u32,
    height: u32,
    file: Option<File>,
    next_index: u64,
}

impl RawFileSource {
    pub fn new<P: AsRef<Path>>(path: P, width: u32, height: u32) -> Self {
        validate_dimensions(width, height);
        Self {
            path: path.as_ref().to_path_buf(),
            width,
            height,
            file: None,
            next_index: 0,
        }
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl FrameSource for RawFileSource {
    fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| {
            PipelineError::Open(format!("{}: {e}", self.path.display()))
        })?;
        info!(
            path = %self.path.display(),
            width = self.width,
            height = self.height,
            "Opened raw frame source"
        );
        self.file = Some(file);
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<Frame>> {
        let len = self.frame_len();
        let file = self.file.as_mut().ok_or_else(|| PipelineError::Read {
            message: "source read before open".to_string(),
            fatal: true,
        })?;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut data[filled..]).map_err(|e| PipelineError::Read {
                message: format!("{}: {e}", self.path.display()),
                fatal: true,
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < len {
            return Err(PipelineError::Read {
                message: format!(
                    "truncated frame {} ({filled} of {len} bytes)",
                    self.next_index
                ),
                fatal: false,
            });
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame {
            index,
            pts_us: index as i64 * FRAME_INTERVAL_US,
            width: self.width,
            height: self.height,
            data,
        }))
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(frames = self.next_index, "Raw frame source closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_raw_file(name: &str, bytes: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("framepipe-src-{name}-{}", std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn synthetic_emits_exact_count_with_increasing_indices() {
        let mut src = SyntheticSource::new(3, Duration::ZERO).with_dimensions(4, 4);
        src.open().unwrap();
        for expected in 0..3u64 {
            let frame = src.read_next().unwrap().unwrap();
            assert_eq!(frame.index, expected);
            assert_eq!(frame.data.len(), 16);
        }
        assert!(src.read_next().unwrap().is_none());
        assert!(src.read_next().unwrap().is_none());
        src.close();
    }

    #[test]
    fn raw_file_reads_whole_frames_then_eof() {
        let path = temp_raw_file("whole", &[7u8; 32]);
        let mut src = RawFileSource::new(&path, 4, 4);
        src.open().unwrap();
        assert_eq!(src.read_next().unwrap().unwrap().index, 0);
        assert_eq!(src.read_next().unwrap().unwrap().index, 1);
        assert!(src.read_next().unwrap().is_none());
        src.close();
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn raw_file_truncated_tail_is_nonfatal() {
        let path = temp_raw_file("trunc", &[1u8; 20]);
        let mut src = RawFileSource::new(&path, 4, 4);
        src.open().unwrap();
        assert!(src.read_next().unwrap().is_some());
        match src.read_next() {
            Err(PipelineError::Read { fatal, .. }) => assert!(!fatal),
            other => panic!("expected truncation error, got {other:?}"),
        }
        src.close();
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn raw_file_missing_path_fails_open() {
        let mut src = RawFileSource::new("/nonexistent/framepipe.raw", 4, 4);
        assert!(matches!(src.open(), Err(PipelineError::Open(_))));
    }

    #[test]
    #[should_panic(expected = "frame payload")]
    fn rejects_geometry_whose_payload_overflows() {
        // 65536 * 65536 wraps to zero in 32-bit arithmetic; it must be
        // rejected at construction, not silently produce empty frames.
        let _ = RawFileSource::new("/dev/null", 65_536, 65_536);
    }

    #[test]
    #[should_panic(expected = "frame payload")]
    fn synthetic_rejects_oversized_geometry() {
        let _ = SyntheticSource::new(1, Duration::ZERO).with_dimensions(65_536, 65_536);
    }
}
