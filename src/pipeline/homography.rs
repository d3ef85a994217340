//! Perspective transform stage.
//!
//! Four source points are mapped onto four destination points. The 3x3
//! homography is solved from the correspondences when the stage is
//! initialised or reconfigured, and frames are warped by inverse mapping
//! each output pixel into the source image with bilinear sampling.

use std::time::Instant;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::stage::{ProcessingResult, ProcessingStage, StageFault};
use crate::capture::{decoder, Frame, PixelFormat};
use crate::error::{FrameError, StageError};

pub type Matrix3 = [[f64; 3]; 3];

const SINGULAR_EPS: f64 = 1e-12;
const MAX_OUTPUT_DIM: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HomographyConfig {
    pub src_points: [Point; 4],
    pub dst_points: [Point; 4],
    #[serde(default = "default_output_width")]
    pub output_width: u32,
    #[serde(default = "default_output_height")]
    pub output_height: u32,
}

fn default_output_width() -> u32 {
    640
}

fn default_output_height() -> u32 {
    480
}

impl Default for HomographyConfig {
    fn default() -> Self {
        Self {
            src_points: [
                Point::new(0.0, 0.0),
                Point::new(640.0, 0.0),
                Point::new(640.0, 480.0),
                Point::new(0.0, 480.0),
            ],
            dst_points: [
                Point::new(50.0, 50.0),
                Point::new(590.0, 50.0),
                Point::new(590.0, 430.0),
                Point::new(50.0, 430.0),
            ],
            output_width: default_output_width(),
            output_height: default_output_height(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transform {
    forward: Matrix3,
    inverse: Matrix3,
}

impl Transform {
    fn solve(config: &HomographyConfig) -> Option<Self> {
        let forward = solve_homography(&config.src_points, &config.dst_points)?;
        let inverse = invert(&forward)?;
        Some(Self { forward, inverse })
    }
}

/// Solve the homography mapping each `src[i]` onto `dst[i]`.
///
/// Returns `None` when the correspondences are degenerate (three or more
/// collinear points, duplicates).
pub fn solve_homography(src: &[Point; 4], dst: &[Point; 4]) -> Option<Matrix3> {
    // h33 is fixed to 1, leaving eight unknowns and two equations per point
    let mut system = [[0.0f64; 9]; 8];
    for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
        system[2 * i] = [s.x, s.y, 1.0, 0.0, 0.0, 0.0, -d.x * s.x, -d.x * s.y, d.x];
        system[2 * i + 1] = [0.0, 0.0, 0.0, s.x, s.y, 1.0, -d.y * s.x, -d.y * s.y, d.y];
    }

    let h = gaussian_solve(system)?;
    let matrix = [[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], 1.0]];
    invert(&matrix).map(|_| matrix)
}

fn gaussian_solve(mut a: [[f64; 9]; 8]) -> Option<[f64; 8]> {
    for col in 0..8 {
        let pivot = (col..8).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if !a[pivot][col].is_finite() || a[pivot][col].abs() < SINGULAR_EPS {
            return None;
        }
        a.swap(col, pivot);

        let pivot_row = a[col];
        for (row, values) in a.iter_mut().enumerate() {
            if row == col {
                continue;
            }
            let factor = values[col] / pivot_row[col];
            if factor != 0.0 {
                for k in col..9 {
                    values[k] -= factor * pivot_row[k];
                }
            }
        }
    }

    let mut h = [0.0; 8];
    for (i, value) in h.iter_mut().enumerate() {
        *value = a[i][8] / a[i][i];
    }
    Some(h)
}

fn invert(m: &Matrix3) -> Option<Matrix3> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if !det.is_finite() || det.abs() < SINGULAR_EPS {
        return None;
    }

    let cofactors = [
        [
            m[1][1] * m[2][2] - m[1][2] * m[2][1],
            m[0][2] * m[2][1] - m[0][1] * m[2][2],
            m[0][1] * m[1][2] - m[0][2] * m[1][1],
        ],
        [
            m[1][2] * m[2][0] - m[1][0] * m[2][2],
            m[0][0] * m[2][2] - m[0][2] * m[2][0],
            m[0][2] * m[1][0] - m[0][0] * m[1][2],
        ],
        [
            m[1][0] * m[2][1] - m[1][1] * m[2][0],
            m[0][1] * m[2][0] - m[0][0] * m[2][1],
            m[0][0] * m[1][1] - m[0][1] * m[1][0],
        ],
    ];
    Some(cofactors.map(|row| row.map(|v| v / det)))
}

/// Apply a homography to a point. `None` for points mapped to infinity.
pub fn project(m: &Matrix3, p: Point) -> Option<Point> {
    let w = m[2][0] * p.x + m[2][1] * p.y + m[2][2];
    if w.abs() < SINGULAR_EPS {
        return None;
    }
    Some(Point::new(
        (m[0][0] * p.x + m[0][1] * p.y + m[0][2]) / w,
        (m[1][0] * p.x + m[1][1] * p.y + m[1][2]) / w,
    ))
}

fn sample(img: &RgbImage, p: Point) -> Option<[u8; 3]> {
    let (w, h) = img.dimensions();
    let in_bounds =
        p.x >= 0.0 && p.y >= 0.0 && p.x <= f64::from(w - 1) && p.y <= f64::from(h - 1);
    if !in_bounds {
        return None;
    }

    let (x0, y0) = (p.x.floor() as u32, p.y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (p.x - f64::from(x0), p.y - f64::from(y0));

    let a = img.get_pixel(x0, y0).0;
    let b = img.get_pixel(x1, y0).0;
    let c = img.get_pixel(x0, y1).0;
    let d = img.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for (i, channel) in out.iter_mut().enumerate() {
        let top = f64::from(a[i]) * (1.0 - fx) + f64::from(b[i]) * fx;
        let bottom = f64::from(c[i]) * (1.0 - fx) + f64::from(d[i]) * fx;
        *channel = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(out)
}

/// Perspective warp stage.
#[derive(Debug, Default)]
pub struct HomographyStage {
    config: HomographyConfig,
    transform: Option<Transform>,
}

impl HomographyStage {
    pub fn new(config: HomographyConfig) -> Self {
        Self {
            config,
            transform: None,
        }
    }

    /// The forward matrix, once computed.
    pub fn matrix(&self) -> Option<Matrix3> {
        self.transform.map(|t| t.forward)
    }

    fn warp(&self, frame: &Frame, transform: &Transform) -> Result<Frame, FrameError> {
        let src = decoder::to_rgb(frame)?;
        let (ow, oh) = (self.config.output_width, self.config.output_height);

        let mut out = vec![0u8; ow as usize * oh as usize * 3];
        for (y, row) in out.chunks_exact_mut(ow as usize * 3).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let target = Point::new(x as f64, y as f64);
                if let Some(rgb) =
                    project(&transform.inverse, target).and_then(|p| sample(&src, p))
                {
                    px.copy_from_slice(&rgb);
                }
            }
        }

        Ok(frame.derive(ow, oh, PixelFormat::Rgb24, out))
    }
}

impl ProcessingStage for HomographyStage {
    fn name(&self) -> &str {
        "homography"
    }

    fn initialize(&mut self) -> Result<(), StageError> {
        let transform = Transform::solve(&self.config).ok_or_else(|| {
            StageError::InvalidConfig("degenerate point correspondence".into())
        })?;
        self.transform = Some(transform);
        debug!("Homography matrix calculated");
        Ok(())
    }

    fn process(&self, frame: &Frame) -> ProcessingResult {
        let started = Instant::now();

        let Some(transform) = &self.transform else {
            return ProcessingResult::ok(
                frame.clone(),
                json!({ "type": "homography", "status": "no_matrix", "processing": "passthrough" }),
                started.elapsed(),
            );
        };

        match self.warp(frame, transform) {
            Ok(warped) => ProcessingResult::ok(
                warped,
                json!({
                    "type": "homography",
                    "status": "transformed",
                    "processing": "perspective_warp",
                    "output_width": self.config.output_width,
                    "output_height": self.config.output_height,
                }),
                started.elapsed(),
            ),
            Err(err) => {
                warn!(camera = frame.camera_id(), "Perspective warp failed: {}", err);
                ProcessingResult::failed(
                    frame.clone(),
                    json!({
                        "type": "homography",
                        "status": "error",
                        "processing": "failed",
                        "error": err.to_string(),
                    }),
                    started.elapsed(),
                    StageFault::Failed(err.to_string()),
                )
            }
        }
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn set_config(&mut self, config: &Value) -> Result<(), StageError> {
        let parsed: HomographyConfig = serde_json::from_value(config.clone())
            .map_err(|err| StageError::InvalidConfig(err.to_string()))?;

        for dim in [parsed.output_width, parsed.output_height] {
            if dim == 0 || dim > MAX_OUTPUT_DIM {
                return Err(StageError::InvalidConfig(format!(
                    "output size must be within 1..={MAX_OUTPUT_DIM}"
                )));
            }
        }

        let transform = Transform::solve(&parsed).ok_or_else(|| {
            StageError::InvalidConfig("degenerate point correspondence".into())
        })?;

        self.config = parsed;
        self.transform = Some(transform);
        debug!("Homography matrix recalculated");
        Ok(())
    }

    fn cleanup(&mut self) {
        self.transform = None;
    }
}
