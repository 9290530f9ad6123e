//! Transform implementations.
//!
//! A [`Transform`] is a pure, reentrant function of a frame; the worker pool
//! may run several invocations concurrently on blocking threads.

use std::time::Duration;

use crate::core::traits::Transform;
use crate::core::types::{Detection, Frame};
use crate::error::{PipelineError, Result};

/// Deterministic transform for stress runs and tests.
///
/// By default it is an instant no-op that reports no detections. Individual
/// frame indices can be scripted to stall or fail, which is how tests force
/// out-of-order worker completion and per-item failure paths.
#[derive(Debug, Default)]
pub struct MockTransform {
    delay_on: Option<(u64, Duration)>,
    fail_on: Option<u64>,
}

impl MockTransform {
    /// Sleep for `delay` when processing the frame with the given index.
    pub fn with_delay_on(mut self, index: u64, delay: Duration) -> Self {
        self.delay_on = Some((index, delay));
        self
    }

    /// Fail with a transform error when processing the given index.
    pub fn with_failure_on(mut self, index: u64) -> Self {
        self.fail_on = Some(index);
        self
    }
}

impl Transform for MockTransform {
    fn apply(&self, frame: &Frame) -> Result<Vec<Detection>> {
        if let Some((index, delay)) = self.delay_on {
            if frame.index == index {
                std::thread::sleep(delay);
            }
        }
        if self.fail_on == Some(frame.index) {
            return Err(PipelineError::Transform(format!(
                "scripted failure on frame {}",
                frame.index
            )));
        }
        Ok(Vec::new())
    }
}

/// Sobel gradient edge detector over 8-bit grayscale frames.
///
/// Reports a single `edge_map` detection whose score is the fraction of
/// interior pixels whose gradient magnitude exceeds the threshold. Frames
/// with no edge pixels produce no detections.
#[derive(Debug)]
pub struct EdgeTransform {
    threshold: u32,
}

impl Default for EdgeTransform {
    fn default() -> Self {
        Self { threshold: 128 }
    }
}

impl EdgeTransform {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }
}

impl Transform for EdgeTransform {
    fn apply(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let w = frame.width as usize;
        let h = frame.height as usize;
        if frame.data.len() != w * h {
            return Err(PipelineError::Transform(format!(
                "frame {} payload is {} bytes, expected {}",
                frame.index,
                frame.data.len(),
                w * h
            )));
        }
        if w < 3 || h < 3 {
            return Ok(Vec::new());
        }
        let px = |x: usize, y: usize| i32::from(frame.data[y * w + x]);
        let mut edges = 0u64;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2 * px(x - 1, y)
                    - px(x - 1, y + 1);
                let gy = px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2 * px(x, y - 1)
                    - px(x + 1, y - 1);
                if (gx.unsigned_abs() + gy.unsigned_abs()) > self.threshold {
                    edges += 1;
                }
            }
        }
        if edges == 0 {
            return Ok(Vec::new());
        }
        let interior = ((w - 2) * (h - 2)) as f32;
        Ok(vec![Detection {
            label: "edge_map".to_string(),
            score: edges as f32 / interior,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(index: u64, width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame {
            index,
            pts_us: 0,
            width,
            height,
            data,
        }
    }

    #[test]
    fn mock_scripted_failure_hits_only_its_index() {
        let t = MockTransform::default().with_failure_on(2);
        assert!(t.apply(&gray_frame(1, 2, 2, vec![0; 4])).is_ok());
        assert!(matches!(
            t.apply(&gray_frame(2, 2, 2, vec![0; 4])),
            Err(PipelineError::Transform(_))
        ));
    }

    #[test]
    fn edge_uniform_frame_has_no_detections() {
        let t = EdgeTransform::default();
        let out = t.apply(&gray_frame(0, 8, 8, vec![50; 64])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn edge_vertical_step_is_detected() {
        let t = EdgeTransform::default();
        let mut data = vec![0u8; 64];
        for y in 0..8 {
            for x in 4..8 {
                data[y * 8 + x] = 255;
            }
        }
        let out = t.apply(&gray_frame(0, 8, 8, data)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "edge_map");
        assert!(out[0].score > 0.0 && out[0].score <= 1.0);
    }

    #[test]
    fn edge_rejects_mismatched_payload() {
        let t = EdgeTransform::default();
        assert!(matches!(
            t.apply(&gray_frame(0, 8, 8, vec![0; 10])),
            Err(PipelineError::Transform(_))
        ));
    }
}
