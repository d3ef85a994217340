//! Frame sources feeding the processing pipeline.

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::info;

use super::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Anything that produces frames for one camera.
pub trait FrameSource: Send {
    fn camera_id(&self) -> &str;

    /// Wait for and return the next frame.
    fn capture_frame(&mut self) -> impl Future<Output = Result<Frame, CaptureError>> + Send;
}

/// Synthetic RGB24 source: a scrolling gradient with a moving block, paced
/// at the configured frame rate. Used when no device is available.
pub struct TestPatternSource {
    camera_id: String,
    width: u32,
    height: u32,
    ticker: Interval,
    sequence: u32,
    started: Instant,
}

impl TestPatternSource {
    pub fn new(config: &CaptureConfig) -> Self {
        let fps = config.fps.max(1);
        let mut ticker = interval(Duration::from_nanos(1_000_000_000 / u64::from(fps)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            camera = %config.camera_id,
            width = config.width,
            height = config.height,
            fps,
            "Test pattern source ready"
        );

        Self {
            camera_id: config.camera_id.clone(),
            width: config.width.max(1),
            height: config.height.max(1),
            ticker,
            sequence: 0,
            started: Instant::now(),
        }
    }

    /// Render the pattern for a given sequence number.
    pub fn render(width: u32, height: u32, sequence: u32) -> Vec<u8> {
        let (w, h) = (width as usize, height as usize);
        let mut data = vec![0u8; w * h * 3];
        let shift = sequence as usize;

        let block = (w.min(h) / 6).max(1);
        let block_x = (shift * 4) % w.saturating_sub(block).max(1);
        let block_y = h / 2 - block / 2;

        for (y, row) in data.chunks_exact_mut(w * 3).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let in_block = (block_x..block_x + block).contains(&x)
                    && (block_y..block_y + block).contains(&y);
                if in_block {
                    px.copy_from_slice(&[255, 255, 255]);
                } else {
                    px[0] = ((x + shift) * 255 / w.max(1)) as u8;
                    px[1] = (y * 255 / h.max(1)) as u8;
                    px[2] = 96;
                }
            }
        }
        data
    }
}

impl FrameSource for TestPatternSource {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    async fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        self.ticker.tick().await;

        self.sequence = self.sequence.wrapping_add(1);
        let data = Self::render(self.width, self.height, self.sequence);

        Ok(Frame::new(
            self.camera_id.as_str(),
            self.width,
            self.height,
            PixelFormat::Rgb24,
            Bytes::from(data),
        )
        .with_metadata(FrameMetadata {
            timestamp_us: self.started.elapsed().as_micros() as u64,
            sequence: self.sequence,
            exposure: 0,
            gain: 0,
        }))
    }
}
