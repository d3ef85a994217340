use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Capture metadata reported by the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
    pub sequence: u32,
    pub exposure: u32,
    pub gain: u32,
}

/// Pixel formats a capture source may deliver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Unknown,
    Yuyv,
    Mjpeg,
    H264,
    Nv12,
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    Yuv420p,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Yuyv => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => Some(4),
            _ => None,
        }
    }

    /// Size of an uncompressed buffer of this format, `None` for compressed
    /// or unknown formats.
    pub fn expected_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420p => {
                let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
                Some(pixels + 2 * chroma)
            }
            other => other.bytes_per_pixel().map(|bpp| pixels * bpp),
        }
    }
}

/// One captured image.
///
/// Read-only after construction. Cloning shares the pixel buffer, so a frame
/// can travel through the pipeline and the engine without copying.
#[derive(Clone)]
pub struct Frame {
    data: Bytes,
    width: u32,
    height: u32,
    format: PixelFormat,
    meta: FrameMetadata,
    camera_id: Arc<str>,
    /// Monotonic capture instant for latency tracking
    captured_at: Instant,
}

impl Frame {
    pub fn new(
        camera_id: impl Into<Arc<str>>,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            meta: FrameMetadata::default(),
            camera_id: camera_id.into(),
            captured_at: Instant::now(),
        }
    }

    pub fn with_metadata(mut self, meta: FrameMetadata) -> Self {
        self.meta = meta;
        self
    }

    /// Build a new image that keeps this frame's camera, metadata and
    /// capture instant. Stages use this for their output.
    pub fn derive(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            meta: self.meta,
            camera_id: Arc::clone(&self.camera_id),
            captured_at: self.captured_at,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn camera_id_arc(&self) -> Arc<str> {
        Arc::clone(&self.camera_id)
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn is_valid(&self) -> bool {
        !self.data.is_empty() && self.width > 0 && self.height > 0
    }

    /// True when the buffer is large enough for the declared raw format.
    /// Compressed formats always pass.
    pub fn has_consistent_len(&self) -> bool {
        match self.format.expected_len(self.width, self.height) {
            Some(expected) => self.data.len() >= expected,
            None => true,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}
