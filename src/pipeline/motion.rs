use image::RgbImage;

use super::detector::{BoundingBox, Detection, DetectorBackend};
use crate::error::StageError;

const DEFAULT_CELL: u32 = 8;
const DEFAULT_DELTA: u8 = 25;

/// Mean luma of each `cell x cell` block of an image.
#[derive(Debug, Clone)]
struct LumaGrid {
    width: u32,
    height: u32,
    cols: u32,
    rows: u32,
    cells: Vec<u8>,
}

impl LumaGrid {
    fn build(image: &RgbImage, cell: u32) -> Self {
        let (width, height) = image.dimensions();
        let cols = width.div_ceil(cell);
        let rows = height.div_ceil(cell);
        let mut sums = vec![0u32; (cols * rows) as usize];
        let mut counts = vec![0u32; (cols * rows) as usize];

        for (x, y, px) in image.enumerate_pixels() {
            let [r, g, b] = px.0;
            // BT.601 luma, fixed point
            let luma = (77 * u32::from(r) + 150 * u32::from(g) + 29 * u32::from(b)) >> 8;
            let idx = ((y / cell) * cols + x / cell) as usize;
            sums[idx] += luma;
            counts[idx] += 1;
        }

        let cells = sums
            .iter()
            .zip(counts.iter())
            .map(|(&sum, &count)| (sum / count.max(1)) as u8)
            .collect();

        Self {
            width,
            height,
            cols,
            rows,
            cells,
        }
    }

    fn same_shape(&self, other: &LumaGrid) -> bool {
        self.width == other.width && self.height == other.height
    }
}

/// CPU frame differencing backend.
///
/// Compares the block luma of consecutive frames and reports one `motion`
/// detection covering every block whose luma moved by more than the delta.
/// The first frame, and any frame after a size change, only primes the
/// reference.
#[derive(Debug)]
pub struct MotionBackend {
    cell: u32,
    delta: u8,
    previous: Option<LumaGrid>,
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new(DEFAULT_CELL, DEFAULT_DELTA)
    }
}

impl MotionBackend {
    pub fn new(cell: u32, delta: u8) -> Self {
        Self {
            cell: cell.max(1),
            delta,
            previous: None,
        }
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &str {
        "motion"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, StageError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(StageError::Backend {
                backend: self.name().to_string(),
                reason: "empty image".into(),
            });
        }

        let current = LumaGrid::build(image, self.cell);
        let previous = self.previous.replace(current);
        let (Some(previous), Some(current)) = (previous, self.previous.as_ref()) else {
            return Ok(Vec::new());
        };
        if !previous.same_shape(current) {
            return Ok(Vec::new());
        }

        let mut changed = 0u32;
        let (mut min_col, mut min_row) = (u32::MAX, u32::MAX);
        let (mut max_col, mut max_row) = (0u32, 0u32);
        for row in 0..current.rows {
            for col in 0..current.cols {
                let idx = (row * current.cols + col) as usize;
                if current.cells[idx].abs_diff(previous.cells[idx]) > self.delta {
                    changed += 1;
                    min_col = min_col.min(col);
                    min_row = min_row.min(row);
                    max_col = max_col.max(col);
                    max_row = max_row.max(row);
                }
            }
        }

        if changed == 0 {
            return Ok(Vec::new());
        }

        let x = min_col * self.cell;
        let y = min_row * self.cell;
        let right = ((max_col + 1) * self.cell).min(current.width);
        let bottom = ((max_row + 1) * self.cell).min(current.height);
        let region_cells = (max_col - min_col + 1) * (max_row - min_row + 1);
        let confidence = 0.5 + 0.5 * changed as f32 / region_cells as f32;

        Ok(vec![Detection::new(
            0,
            "motion",
            confidence,
            BoundingBox {
                x,
                y,
                width: right - x,
                height: bottom - y,
            },
        )])
    }

    fn release(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn scene(block_at: Option<(u32, u32)>) -> RgbImage {
        let mut img = RgbImage::from_pixel(64, 48, Rgb([20, 20, 20]));
        if let Some((bx, by)) = block_at {
            for y in by..by + 16 {
                for x in bx..bx + 16 {
                    img.put_pixel(x, y, Rgb([240, 240, 240]));
                }
            }
        }
        img
    }

    #[test]
    fn first_frame_only_primes_reference() {
        let mut backend = MotionBackend::default();
        assert!(backend.detect(&scene(Some((8, 8)))).unwrap().is_empty());
    }

    #[test]
    fn reports_changed_region() {
        let mut backend = MotionBackend::default();
        backend.detect(&scene(None)).unwrap();

        let detections = backend.detect(&scene(Some((16, 8)))).unwrap();
        assert_eq!(detections.len(), 1);

        let det = &detections[0];
        assert_eq!(det.label, "motion");
        assert_eq!(
            det.bbox,
            BoundingBox {
                x: 16,
                y: 8,
                width: 16,
                height: 16
            }
        );
        assert!((det.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn static_scene_reports_nothing() {
        let mut backend = MotionBackend::default();
        backend.detect(&scene(Some((0, 0)))).unwrap();
        assert!(backend.detect(&scene(Some((0, 0)))).unwrap().is_empty());
    }

    #[test]
    fn size_change_resets_reference() {
        let mut backend = MotionBackend::default();
        backend.detect(&scene(None)).unwrap();
        let smaller = RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]));
        assert!(backend.detect(&smaller).unwrap().is_empty());
    }
}
