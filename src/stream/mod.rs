//! Multi-client MJPEG distribution.
//!
//! The engine takes processed frames from the producer, rate limits them per
//! camera, encodes JPEG once per frame and fans the encoded bytes out to each
//! subscribed client's bounded queue. Transports consume a [`Subscription`]
//! at their own pace.

mod encoder;
mod engine;
mod governor;
mod session;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use encoder::{encode_rgb, FrameEncoder, ImageJpegEncoder};
pub use engine::{ClientInfo, EngineState, EngineStatus, FrameOutcome, StreamEngine};
pub use governor::{FpsMeter, RateGovernor};
pub use session::{ClientCallbacks, Delivery, EncodedFrame, PumpSummary, Subscription};

use crate::error::StreamError;

/// What to do when a client's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued frame so the client always sees the latest.
    #[default]
    DropOldest,
    /// Keep the queue and discard the incoming frame.
    DropNewest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub jpeg_quality: u8,
    pub max_fps: u32,
    /// 0 means unlimited
    pub max_clients_per_camera: usize,
    /// 0 keeps the native width
    pub output_width: u32,
    /// 0 keeps the native height
    pub output_height: u32,
    pub session_queue_depth: usize,
    pub drop_policy: DropPolicy,
    pub stale_after_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            max_fps: 30,
            max_clients_per_camera: 2,
            output_width: 0,
            output_height: 0,
            session_queue_depth: 4,
            drop_policy: DropPolicy::DropOldest,
            stale_after_secs: 30,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(StreamError::InvalidConfig(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.max_fps == 0 {
            return Err(StreamError::InvalidConfig("max_fps must be positive".into()));
        }
        if self.session_queue_depth == 0 {
            return Err(StreamError::InvalidConfig(
                "session_queue_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Output size when both dimensions are set.
    pub fn resize_target(&self) -> Option<(u32, u32)> {
        (self.output_width > 0 && self.output_height > 0)
            .then_some((self.output_width, self.output_height))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}
