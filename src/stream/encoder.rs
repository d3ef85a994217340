use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::capture::{decoder, Frame, PixelFormat};
use crate::error::{EncodeError, FrameError};

/// Turns a processed frame into JPEG bytes.
pub trait FrameEncoder: Send + Sync {
    /// Check that encoding works at all before the engine starts.
    fn probe(&self) -> Result<(), EncodeError> {
        Ok(())
    }

    /// Encode `frame`, resizing to `resize` first when it differs from the
    /// frame size.
    fn encode(
        &self,
        frame: &Frame,
        quality: u8,
        resize: Option<(u32, u32)>,
    ) -> Result<Bytes, EncodeError>;
}

/// JPEG encoding through the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageJpegEncoder;

impl FrameEncoder for ImageJpegEncoder {
    fn probe(&self) -> Result<(), EncodeError> {
        let test = RgbImage::from_pixel(8, 8, image::Rgb([128, 128, 128]));
        let jpeg = encode_rgb(&test, 80)?;
        if jpeg.is_empty() {
            return Err(EncodeError::Unavailable("encoder produced no output".into()));
        }
        Ok(())
    }

    fn encode(
        &self,
        frame: &Frame,
        quality: u8,
        resize: Option<(u32, u32)>,
    ) -> Result<Bytes, EncodeError> {
        if !frame.is_valid() {
            return Err(FrameError::Invalid.into());
        }

        let resize = resize.filter(|&dims| dims != (frame.width(), frame.height()));

        // Camera MJPEG at the requested size is already what clients want
        if frame.format() == PixelFormat::Mjpeg && resize.is_none() {
            return Ok(frame.data().clone());
        }

        let rgb = decoder::to_rgb(frame)?;
        let rgb = match resize {
            Some((w, h)) => imageops::resize(&rgb, w, h, FilterType::Triangle),
            None => rgb,
        };
        encode_rgb(&rgb, quality)
    }
}

pub fn encode_rgb(image: &RgbImage, quality: u8) -> Result<Bytes, EncodeError> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(image)
        .map_err(|err| EncodeError::Jpeg(err.to_string()))?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOI: [u8; 2] = [0xFF, 0xD8];

    fn rgb_frame(width: u32, height: u32) -> Frame {
        let data: Vec<u8> = (0..width * height * 3).map(|i| (i % 256) as u8).collect();
        Frame::new("cam0", width, height, PixelFormat::Rgb24, data)
    }

    #[test]
    fn probe_succeeds() {
        assert!(ImageJpegEncoder.probe().is_ok());
    }

    #[test]
    fn encodes_rgb_to_jpeg() {
        let jpeg = ImageJpegEncoder.encode(&rgb_frame(64, 48), 80, None).unwrap();
        assert_eq!(jpeg[..2], SOI);
    }

    #[test]
    fn resizes_before_encoding() {
        let jpeg = ImageJpegEncoder
            .encode(&rgb_frame(64, 48), 80, Some((32, 24)))
            .unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn mjpeg_passes_through_without_resize() {
        let jpeg = ImageJpegEncoder.encode(&rgb_frame(16, 16), 90, None).unwrap();
        let mjpeg = Frame::new("cam0", 16, 16, PixelFormat::Mjpeg, jpeg.clone());

        let out = ImageJpegEncoder.encode(&mjpeg, 50, None).unwrap();
        assert_eq!(out, jpeg);

        let same_size = ImageJpegEncoder.encode(&mjpeg, 50, Some((16, 16))).unwrap();
        assert_eq!(same_size, jpeg);
    }

    #[test]
    fn invalid_and_undecodable_frames_fail() {
        let empty = Frame::new("cam0", 16, 16, PixelFormat::Rgb24, Vec::new());
        assert!(matches!(
            ImageJpegEncoder.encode(&empty, 80, None),
            Err(EncodeError::Frame(FrameError::Invalid))
        ));

        let h264 = Frame::new("cam0", 16, 16, PixelFormat::H264, vec![0u8; 32]);
        assert!(ImageJpegEncoder.encode(&h264, 80, None).is_err());
    }
}
