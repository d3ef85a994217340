//! V4L2 capture feeding the pipeline from a /dev/video* device

use std::time::Instant;

use bytes::Bytes;
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::source::FrameSource;
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Memory-mapped V4L2 capture
pub struct V4l2Capture {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    config: CaptureConfig,
    width: u32,
    height: u32,
    sequence: u32,
    started: Instant,
}

fn fourcc_for(format: PixelFormat) -> Result<FourCC, CaptureError> {
    match format {
        PixelFormat::Mjpeg => Ok(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv => Ok(FourCC::new(b"YUYV")),
        PixelFormat::Nv12 => Ok(FourCC::new(b"NV12")),
        PixelFormat::Rgb24 => Ok(FourCC::new(b"RGB3")),
        PixelFormat::Bgr24 => Ok(FourCC::new(b"BGR3")),
        PixelFormat::Yuv420p => Ok(FourCC::new(b"YU12")),
        other => Err(CaptureError::UnsupportedFormat(other)),
    }
}

fn device_err(err: std::io::Error) -> CaptureError {
    CaptureError::Device(err.to_string())
}

impl V4l2Capture {
    /// Open the device and negotiate the configured format
    #[instrument(skip(config), fields(device = %config.device))]
    pub fn new(config: CaptureConfig) -> Result<Self, CaptureError> {
        let device = Device::with_path(&config.device).map_err(device_err)?;

        let caps = device.query_caps().map_err(device_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Device(
                "device doesn't support video capture".into(),
            ));
        }

        let mut fmt = device.format().map_err(device_err)?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc_for(config.format)?;

        // The driver may pick the closest size it supports
        let applied = device.set_format(&fmt).map_err(device_err)?;
        if applied.fourcc != fmt.fourcc {
            return Err(CaptureError::UnsupportedFormat(config.format));
        }

        Ok(Self {
            device: Box::new(device),
            stream: None,
            width: applied.width,
            height: applied.height,
            config,
            sequence: 0,
            started: Instant::now(),
        })
    }

    /// Start streaming with memory-mapped buffers
    pub fn start_stream(&mut self) -> Result<(), CaptureError> {
        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)
                .map_err(device_err)?;

        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }
}

impl FrameSource for V4l2Capture {
    fn camera_id(&self) -> &str {
        &self.config.camera_id
    }

    async fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::NotStarted)?;

        let (buf, meta) = stream.next().map_err(device_err)?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence = self.sequence.wrapping_add(1);

        let timestamp_us = if meta.timestamp.sec == 0 && meta.timestamp.usec == 0 {
            self.started.elapsed().as_micros() as u64
        } else {
            meta.timestamp.sec as u64 * 1_000_000 + meta.timestamp.usec as u64
        };

        Ok(Frame::new(
            self.config.camera_id.as_str(),
            self.width,
            self.height,
            self.config.format,
            data,
        )
        .with_metadata(FrameMetadata {
            timestamp_us,
            sequence: self.sequence,
            exposure: 0,
            gain: 0,
        }))
    }
}
