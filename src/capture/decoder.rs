//! Conversion of captured frames into packed RGB pixels.

use image::RgbImage;
use jpeg_decoder::Decoder;

use super::frame::{Frame, PixelFormat};
use crate::error::FrameError;

/// Decode or convert any supported frame into an RGB image.
pub fn to_rgb(frame: &Frame) -> Result<RgbImage, FrameError> {
    if !frame.is_valid() {
        return Err(FrameError::Invalid);
    }

    let (width, height) = (frame.width(), frame.height());
    let data = &frame.data()[..];

    if let Some(expected) = frame.format().expected_len(width, height) {
        if data.len() < expected {
            return Err(FrameError::BufferSize {
                format: frame.format(),
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
    }

    let pixels = match frame.format() {
        PixelFormat::Mjpeg => return decode_jpeg(data),
        PixelFormat::Rgb24 => data[..(width * height * 3) as usize].to_vec(),
        PixelFormat::Bgr24 => packed_to_rgb(data, 3, [2, 1, 0]),
        PixelFormat::Rgba32 => packed_to_rgb(data, 4, [0, 1, 2]),
        PixelFormat::Bgra32 => packed_to_rgb(data, 4, [2, 1, 0]),
        PixelFormat::Yuyv => yuyv_to_rgb(data, width, height),
        PixelFormat::Nv12 => yuv420_to_rgb(data, width, height, Chroma::Interleaved),
        PixelFormat::Yuv420p => yuv420_to_rgb(data, width, height, Chroma::Planar),
        other => return Err(FrameError::UnsupportedFormat(other)),
    };

    RgbImage::from_raw(width, height, pixels).ok_or(FrameError::Invalid)
}

fn decode_jpeg(data: &[u8]) -> Result<RgbImage, FrameError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|err| FrameError::Decode(err.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| FrameError::Decode("missing image info".into()))?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => {
            return Err(FrameError::Decode(format!(
                "unsupported jpeg pixel format {other:?}"
            )))
        }
    };

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| FrameError::Decode("decoded buffer does not match header".into()))
}

fn packed_to_rgb(data: &[u8], bpp: usize, order: [usize; 3]) -> Vec<u8> {
    data.chunks_exact(bpp)
        .flat_map(|px| [px[order[0]], px[order[1]], px[order[2]]])
        .collect()
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    // Y0 U Y1 V covers two horizontal pixels
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    // odd width leaves the last pixel without a pair
    rgb.resize(pixels * 3, 0);
    rgb
}

enum Chroma {
    /// NV12: one plane of interleaved U/V samples
    Interleaved,
    /// I420: separate U and V planes
    Planar,
}

fn yuv420_to_rgb(data: &[u8], width: u32, height: u32, chroma: Chroma) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let cw = width.div_ceil(2) as usize;
    let ch = height.div_ceil(2) as usize;
    let luma = &data[..w * h];
    let chroma_plane = &data[w * h..];

    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let c = (y / 2) * cw + x / 2;
            let (u, v) = match chroma {
                Chroma::Interleaved => (chroma_plane[2 * c], chroma_plane[2 * c + 1]),
                Chroma::Planar => (chroma_plane[c], chroma_plane[cw * ch + c]),
            };
            rgb.extend_from_slice(&yuv_to_rgb(luma[y * w + x], u, v));
        }
    }
    rgb
}

/// Full-range BT.601 in 16.16 fixed point.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = i32::from(y);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;

    let r = y + ((91_881 * v) >> 16);
    let g = y - ((22_554 * u + 46_802 * v) >> 16);
    let b = y + ((116_130 * u) >> 16);

    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;

    fn frame(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame::new("cam0", width, height, format, data)
    }

    #[test]
    fn bgr_and_bgra_swap_channels() {
        let bgr = to_rgb(&frame(PixelFormat::Bgr24, 1, 1, vec![10, 20, 30])).unwrap();
        assert_eq!(bgr.get_pixel(0, 0).0, [30, 20, 10]);

        let bgra = to_rgb(&frame(PixelFormat::Bgra32, 1, 1, vec![10, 20, 30, 255])).unwrap();
        assert_eq!(bgra.get_pixel(0, 0).0, [30, 20, 10]);

        let rgba = to_rgb(&frame(PixelFormat::Rgba32, 1, 1, vec![10, 20, 30, 0])).unwrap();
        assert_eq!(rgba.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn neutral_chroma_yields_gray() {
        // YUYV: two pixels sharing neutral chroma
        let yuyv = to_rgb(&frame(PixelFormat::Yuyv, 2, 1, vec![50, 128, 200, 128])).unwrap();
        assert_eq!(yuyv.get_pixel(0, 0).0, [50, 50, 50]);
        assert_eq!(yuyv.get_pixel(1, 0).0, [200, 200, 200]);

        let mut nv12 = vec![90u8; 4];
        nv12.extend_from_slice(&[128, 128]);
        let img = to_rgb(&frame(PixelFormat::Nv12, 2, 2, nv12)).unwrap();
        assert!(img.pixels().all(|p| p.0 == [90, 90, 90]));

        let mut i420 = vec![160u8; 4];
        i420.extend_from_slice(&[128, 128]);
        let img = to_rgb(&frame(PixelFormat::Yuv420p, 2, 2, i420)).unwrap();
        assert!(img.pixels().all(|p| p.0 == [160, 160, 160]));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = to_rgb(&frame(PixelFormat::Rgb24, 4, 4, vec![0u8; 5])).unwrap_err();
        assert!(matches!(err, FrameError::BufferSize { expected: 48, actual: 5, .. }));
    }

    #[test]
    fn h264_is_unsupported() {
        let err = to_rgb(&frame(PixelFormat::H264, 4, 4, vec![0u8; 32])).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedFormat(PixelFormat::H264)));
    }

    #[test]
    fn mjpeg_is_decoded() {
        let source = RgbImage::from_pixel(16, 8, image::Rgb([200, 40, 40]));
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&source)
            .unwrap();

        let decoded = to_rgb(&frame(PixelFormat::Mjpeg, 16, 8, jpeg)).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
        let px = decoded.get_pixel(8, 4).0;
        assert!(px[0] > 150 && px[1] < 90 && px[2] < 90, "unexpected colour {px:?}");
    }

    #[test]
    fn garbage_jpeg_fails_to_decode() {
        let err = to_rgb(&frame(PixelFormat::Mjpeg, 4, 4, vec![1, 2, 3, 4])).unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }
}
