//! Object detection stage with ordered backend fallback.
//!
//! Backends are tried in preference order. A backend that fails to
//! initialise, or reports itself unavailable, is retired and never asked
//! again; one that fails a single `detect` call is skipped for that frame
//! only. A frame every live backend failed is a plain [`StageFault::Failed`].
//! Only once no backend is left does the result carry
//! [`StageFault::BackendsExhausted`].
//!
//! Boxes come from backends and are clipped to the image before filtering.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::motion::MotionBackend;
use super::stage::{ProcessingResult, ProcessingStage, StageFault};
use crate::capture::{decoder, Frame, PixelFormat};
use crate::error::StageError;
use crate::utils::lock;

/// Axis-aligned box in output pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    fn right(&self) -> u64 {
        u64::from(self.x) + u64::from(self.width)
    }

    fn bottom(&self) -> u64 {
        u64::from(self.y) + u64::from(self.height)
    }

    /// Intersection over union, 0 for disjoint boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = u64::from(self.x.max(other.x));
        let top = u64::from(self.y.max(other.y));
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0.0;
        }

        let inter = (right - left) * (bottom - top);
        let union = self.area().saturating_add(other.area()) - inter;
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }

    /// The part of the box inside a `width` x `height` image, `None` when
    /// nothing is left.
    pub fn clip(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let right = self.right().min(u64::from(width)) as u32;
        let bottom = self.bottom().min(u64::from(height)) as u32;
        let clipped = BoundingBox {
            x: self.x,
            y: self.y,
            width: right - self.x,
            height: bottom - self.y,
        };
        (clipped.area() > 0).then_some(clipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Center {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub center: Center,
}

impl Detection {
    pub fn new(
        class_id: u32,
        label: impl Into<String>,
        confidence: f32,
        bbox: BoundingBox,
    ) -> Self {
        Self {
            class_id,
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            center: Center {
                x: bbox.x.saturating_add(bbox.width / 2),
                y: bbox.y.saturating_add(bbox.height / 2),
            },
            bbox,
        }
    }

    /// Same detection with its box clipped to the image.
    fn clipped(self, width: u32, height: u32) -> Option<Detection> {
        let bbox = self.bbox.clip(width, height)?;
        Some(Detection::new(self.class_id, self.label, self.confidence, bbox))
    }
}

/// One way of running detection: an accelerator runtime or a CPU fallback.
pub trait DetectorBackend: Send {
    fn name(&self) -> &str;

    /// True for hardware-accelerated backends.
    fn accelerated(&self) -> bool {
        false
    }

    /// Acquire whatever the backend needs. An error marks the backend
    /// unavailable for the lifetime of the stage.
    fn initialize(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, StageError>;

    fn release(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            max_detections: 100,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<(), StageError> {
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(StageError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.max_detections == 0 {
            return Err(StageError::InvalidConfig(
                "max_detections must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Drop low-confidence detections, then greedily suppress overlaps.
    pub fn filter(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        detections.retain(|d| d.confidence >= self.confidence_threshold);
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
        for det in detections {
            if kept.len() == self.max_detections {
                break;
            }
            if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= self.nms_threshold) {
                kept.push(det);
            }
        }
        kept
    }
}

struct BackendSlot {
    name: String,
    accelerated: bool,
    backend: Mutex<Box<dyn DetectorBackend>>,
    available: AtomicBool,
    failures: AtomicU64,
}

/// Detection stage over an ordered list of backends, preferred first.
pub struct DetectorStage {
    slots: Vec<BackendSlot>,
    config: DetectorConfig,
    initialized: bool,
}

impl std::fmt::Debug for DetectorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backends: Vec<&str> = self.slots.iter().map(|s| s.name.as_str()).collect();
        f.debug_struct("DetectorStage")
            .field("backends", &backends)
            .field("config", &self.config)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl DetectorStage {
    pub fn new(backends: Vec<Box<dyn DetectorBackend>>) -> Self {
        let slots = backends
            .into_iter()
            .map(|backend| BackendSlot {
                name: backend.name().to_string(),
                accelerated: backend.accelerated(),
                backend: Mutex::new(backend),
                available: AtomicBool::new(false),
                failures: AtomicU64::new(0),
            })
            .collect();

        Self {
            slots,
            config: DetectorConfig::default(),
            initialized: false,
        }
    }

    /// Stage backed only by the CPU motion backend.
    pub fn cpu() -> Self {
        Self::new(vec![Box::new(MotionBackend::default())])
    }

    /// Names of backends that initialised successfully, in preference order.
    pub fn available_backends(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.available.load(Ordering::Acquire))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Failures recorded against a backend so far.
    pub fn backend_failures(&self, name: &str) -> Option<u64> {
        self.slots
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.failures.load(Ordering::Relaxed))
    }

    fn failure(
        frame: &Frame,
        metadata: Value,
        started: Instant,
        fault: StageFault,
    ) -> ProcessingResult {
        ProcessingResult::failed(frame.clone(), metadata, started.elapsed(), fault)
    }
}

fn class_color(class_id: u32) -> Rgb<u8> {
    const PALETTE: [[u8; 3]; 6] = [
        [0, 255, 0],
        [255, 0, 0],
        [0, 128, 255],
        [255, 255, 0],
        [255, 0, 255],
        [0, 255, 255],
    ];
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Draw a two pixel outline for each detection, clipped to the image.
fn draw_boxes(image: &mut RgbImage, detections: &[Detection]) {
    const THICKNESS: u32 = 2;
    let (w, h) = image.dimensions();

    for det in detections {
        let color = class_color(det.class_id);
        let Some(b) = det.bbox.clip(w, h) else {
            continue;
        };
        let right = b.x + b.width;
        let bottom = b.y + b.height;

        for y in b.y..bottom {
            for x in b.x..right {
                let edge = x < b.x.saturating_add(THICKNESS)
                    || y < b.y.saturating_add(THICKNESS)
                    || x.saturating_add(THICKNESS) >= right
                    || y.saturating_add(THICKNESS) >= bottom;
                if edge {
                    image.put_pixel(x, y, color);
                }
            }
        }
    }
}

impl ProcessingStage for DetectorStage {
    fn name(&self) -> &str {
        "detector"
    }

    fn initialize(&mut self) -> Result<(), StageError> {
        let mut any = false;
        for slot in &mut self.slots {
            let backend = slot
                .backend
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match backend.initialize() {
                Ok(()) => {
                    slot.available.store(true, Ordering::Release);
                    info!(
                        backend = %slot.name,
                        accelerated = slot.accelerated,
                        "Detector backend ready"
                    );
                    any = true;
                }
                Err(err) => {
                    slot.available.store(false, Ordering::Release);
                    slot.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = %slot.name, "Detector backend unavailable: {}", err);
                }
            }
        }

        if !any {
            return Err(StageError::BackendsExhausted);
        }
        self.initialized = true;
        Ok(())
    }

    fn process(&self, frame: &Frame) -> ProcessingResult {
        let started = Instant::now();

        if !self.initialized {
            return Self::failure(
                frame,
                json!({ "type": "detection", "error": "detector not initialized" }),
                started,
                StageFault::Failed("detector not initialized".into()),
            );
        }

        let mut image = match decoder::to_rgb(frame) {
            Ok(image) => image,
            Err(err) => {
                return Self::failure(
                    frame,
                    json!({ "type": "detection", "error": err.to_string() }),
                    started,
                    StageFault::Failed(err.to_string()),
                );
            }
        };

        let mut skipped = 0usize;
        for slot in &self.slots {
            if !slot.available.load(Ordering::Acquire) {
                skipped += 1;
                continue;
            }

            let outcome = lock(&slot.backend).detect(&image);
            let raw = match outcome {
                Ok(raw) => raw,
                Err(err) => {
                    slot.failures.fetch_add(1, Ordering::Relaxed);
                    if matches!(err, StageError::BackendUnavailable { .. }) {
                        slot.available.store(false, Ordering::Release);
                    }
                    warn!(backend = %slot.name, "Detection failed, trying next backend: {}", err);
                    skipped += 1;
                    continue;
                }
            };

            let (w, h) = image.dimensions();
            let raw = raw.into_iter().filter_map(|d| d.clipped(w, h)).collect();
            let detections = self.config.filter(raw);
            draw_boxes(&mut image, &detections);
            debug!(backend = %slot.name, count = detections.len(), "Detection complete");

            let elapsed = started.elapsed();
            let metadata = json!({
                "type": "detection",
                "backend": slot.name,
                "accelerated": slot.accelerated,
                "fallback": skipped > 0,
                "detection_count": detections.len(),
                "detections": detections,
                "processing_time_ms": elapsed.as_secs_f64() * 1000.0,
            });
            let output = frame.derive(w, h, PixelFormat::Rgb24, image.into_raw());
            return ProcessingResult::ok(output, metadata, elapsed);
        }

        // live backends may recover on the next frame
        let exhausted = self.available_backends().is_empty();
        let (reason, fault) = if exhausted {
            warn!(camera = frame.camera_id(), "No detector backend left");
            let reason = "all detector backends unavailable";
            (reason, StageFault::BackendsExhausted(reason.into()))
        } else {
            warn!(camera = frame.camera_id(), "Every detector backend failed this frame");
            let reason = "detection failed on every backend";
            (reason, StageFault::Failed(reason.into()))
        };
        Self::failure(
            frame,
            json!({
                "type": "detection",
                "error": reason,
                "detections": [],
                "detection_count": 0,
            }),
            started,
            fault,
        )
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    /// Keys missing from `config` keep their current value.
    fn set_config(&mut self, config: &Value) -> Result<(), StageError> {
        let Value::Object(patch) = config else {
            return Err(StageError::InvalidConfig("expected an object".into()));
        };

        let mut merged = self.config();
        if let Value::Object(current) = &mut merged {
            for (key, value) in patch {
                current.insert(key.clone(), value.clone());
            }
        }

        let parsed: DetectorConfig = serde_json::from_value(merged)
            .map_err(|err| StageError::InvalidConfig(err.to_string()))?;
        parsed.validate()?;
        self.config = parsed;
        Ok(())
    }

    fn cleanup(&mut self) {
        for slot in &mut self.slots {
            slot.backend
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .release();
            slot.available.store(false, Ordering::Release);
        }
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Backend with scripted behaviour.
    struct Scripted {
        name: &'static str,
        accelerated: bool,
        init_ok: bool,
        detect_ok: bool,
        /// Fail `detect` with `BackendUnavailable` instead of a plain error
        gone: bool,
        detections: Vec<Detection>,
        released: Arc<AtomicBool>,
    }

    impl Scripted {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                accelerated: false,
                init_ok: true,
                detect_ok: true,
                gone: false,
                detections: Vec::new(),
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl DetectorBackend for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn accelerated(&self) -> bool {
            self.accelerated
        }

        fn initialize(&mut self) -> Result<(), StageError> {
            if self.init_ok {
                Ok(())
            } else {
                Err(StageError::BackendUnavailable {
                    backend: self.name.into(),
                    reason: "no device".into(),
                })
            }
        }

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, StageError> {
            if self.gone {
                Err(StageError::BackendUnavailable {
                    backend: self.name.into(),
                    reason: "device lost".into(),
                })
            } else if self.detect_ok {
                Ok(self.detections.clone())
            } else {
                Err(StageError::Backend {
                    backend: self.name.into(),
                    reason: "inference failed".into(),
                })
            }
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn bbox(x: u32, y: u32, width: u32, height: u32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width,
            height,
        }
    }

    fn frame() -> Frame {
        Frame::new("cam0", 32, 32, PixelFormat::Rgb24, vec![0u8; 32 * 32 * 3])
    }

    #[test]
    fn uses_preferred_backend_when_available() {
        let mut npu = Scripted::new("npu");
        npu.accelerated = true;
        let mut stage = DetectorStage::new(vec![Box::new(npu), Box::new(Scripted::new("cpu"))]);
        stage.initialize().unwrap();

        let result = stage.process(&frame());
        assert!(result.success);
        assert_eq!(result.metadata["backend"], "npu");
        assert_eq!(result.metadata["accelerated"], true);
        assert_eq!(result.metadata["fallback"], false);
    }

    #[test]
    fn falls_back_when_accelerator_is_missing() {
        let mut npu = Scripted::new("npu");
        npu.init_ok = false;
        let mut stage = DetectorStage::new(vec![Box::new(npu), Box::new(Scripted::new("cpu"))]);
        stage.initialize().unwrap();
        assert_eq!(stage.available_backends(), ["cpu"]);

        let result = stage.process(&frame());
        assert!(result.success);
        assert_eq!(result.metadata["backend"], "cpu");
        assert_eq!(result.metadata["fallback"], true);
    }

    #[test]
    fn skips_backend_that_fails_a_frame() {
        let mut flaky = Scripted::new("npu");
        flaky.detect_ok = false;
        let mut stage = DetectorStage::new(vec![Box::new(flaky), Box::new(Scripted::new("cpu"))]);
        stage.initialize().unwrap();

        let result = stage.process(&frame());
        assert!(result.success);
        assert_eq!(result.metadata["backend"], "cpu");
        assert_eq!(stage.backend_failures("npu"), Some(1));
        // a transient failure does not retire the backend
        assert_eq!(stage.available_backends(), ["npu", "cpu"]);
    }

    #[test]
    fn transient_failure_of_every_backend_is_not_exhaustion() {
        let mut a = Scripted::new("npu");
        a.detect_ok = false;
        let mut b = Scripted::new("cpu");
        b.detect_ok = false;
        let mut stage = DetectorStage::new(vec![Box::new(a), Box::new(b)]);
        stage.initialize().unwrap();

        let input = frame();
        let result = stage.process(&input);
        assert!(!result.success);
        assert!(!result.backends_exhausted());
        assert!(matches!(result.fault, Some(StageFault::Failed(_))));
        assert_eq!(result.frame.data(), input.data());
        assert_eq!(result.metadata["detection_count"], 0);
        assert_eq!(stage.available_backends(), ["npu", "cpu"]);
    }

    #[test]
    fn exhausted_once_every_backend_is_retired() {
        let mut npu = Scripted::new("npu");
        npu.init_ok = false;
        let mut cpu = Scripted::new("cpu");
        cpu.gone = true;
        let mut stage = DetectorStage::new(vec![Box::new(npu), Box::new(cpu)]);
        stage.initialize().unwrap();

        let result = stage.process(&frame());
        assert!(result.backends_exhausted());
        assert!(stage.available_backends().is_empty());
        assert_eq!(stage.backend_failures("cpu"), Some(1));
    }

    #[test]
    fn oversized_boxes_are_clipped() {
        let mut backend = Scripted::new("cpu");
        backend.detections = vec![
            Detection::new(0, "wide", 0.9, bbox(2, 2, u32::MAX, 3)),
            Detection::new(1, "outside", 0.8, bbox(u32::MAX, u32::MAX, u32::MAX, u32::MAX)),
        ];
        let mut stage = DetectorStage::new(vec![Box::new(backend)]);
        stage.initialize().unwrap();

        let result = stage.process(&frame());
        assert!(result.success);
        assert_eq!(result.metadata["detection_count"], 1);
        assert_eq!(result.metadata["detections"][0]["bbox"]["width"], 30);
        assert_eq!(result.metadata["detections"][0]["center"]["x"], 17);

        let i = (2 * 32 + 31) * 3;
        assert_eq!(&result.frame.data()[i..i + 3], &[0, 255, 0]);
    }

    #[test]
    fn iou_handles_boxes_at_the_coordinate_limit() {
        let huge = bbox(u32::MAX - 1, 0, u32::MAX, 10);
        assert!((huge.iou(&huge) - 1.0).abs() < f32::EPSILON);
        assert_eq!(huge.iou(&bbox(0, 0, 10, 10)), 0.0);
    }

    #[test]
    fn initialize_fails_without_any_backend() {
        let mut a = Scripted::new("npu");
        a.init_ok = false;
        let mut stage = DetectorStage::new(vec![Box::new(a)]);
        assert!(matches!(stage.initialize(), Err(StageError::BackendsExhausted)));
    }

    #[test]
    fn process_before_initialize_reports_failure() {
        let stage = DetectorStage::cpu();
        let result = stage.process(&frame());
        assert!(!result.success);
        assert!(!result.backends_exhausted());
    }

    #[test]
    fn filter_applies_threshold_nms_and_cap() {
        let config = DetectorConfig {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            max_detections: 2,
        };
        let detections = vec![
            Detection::new(0, "a", 0.9, bbox(0, 0, 10, 10)),
            Detection::new(0, "a", 0.8, bbox(1, 1, 10, 10)),
            Detection::new(1, "b", 0.3, bbox(50, 50, 10, 10)),
            Detection::new(2, "c", 0.7, bbox(100, 100, 10, 10)),
            Detection::new(3, "d", 0.6, bbox(200, 200, 10, 10)),
        ];

        let kept = config.filter(detections);
        let labels: Vec<&str> = kept.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, ["a", "c"]);
        assert!((kept[0].confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = bbox(0, 0, 10, 10);
        assert_eq!(a.iou(&bbox(20, 20, 5, 5)), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert!((a.iou(&bbox(5, 0, 10, 10)) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn detections_are_drawn_and_reported() {
        let mut backend = Scripted::new("cpu");
        backend.detections = vec![Detection::new(0, "person", 0.9, bbox(4, 4, 8, 8))];
        let mut stage = DetectorStage::new(vec![Box::new(backend)]);
        stage.initialize().unwrap();

        let result = stage.process(&frame());
        assert_eq!(result.metadata["detection_count"], 1);
        assert_eq!(result.metadata["detections"][0]["label"], "person");
        assert_eq!(result.metadata["detections"][0]["center"]["x"], 8);

        let px = |x: usize, y: usize| {
            let i = (y * 32 + x) * 3;
            [result.frame.data()[i], result.frame.data()[i + 1], result.frame.data()[i + 2]]
        };
        assert_eq!(px(4, 4), [0, 255, 0]);
        assert_eq!(px(8, 8), [0, 0, 0]);
    }

    #[test]
    fn partial_config_update_merges() {
        let mut stage = DetectorStage::cpu();
        stage.set_config(&json!({ "confidence_threshold": 0.25 })).unwrap();

        let config = stage.config();
        assert_eq!(config["confidence_threshold"], 0.25);
        assert!((config["nms_threshold"].as_f64().unwrap() - 0.4).abs() < 1e-6);

        assert!(stage.set_config(&json!({ "nms_threshold": 1.5 })).is_err());
        assert!(stage.set_config(&json!({ "unknown": 1 })).is_err());
        assert_eq!(stage.config()["confidence_threshold"], 0.25);
    }

    #[test]
    fn cleanup_releases_backends() {
        let backend = Scripted::new("cpu");
        let released = Arc::clone(&backend.released);
        let mut stage = DetectorStage::new(vec![Box::new(backend)]);
        stage.initialize().unwrap();
        stage.cleanup();

        assert!(released.load(Ordering::SeqCst));
        assert!(stage.available_backends().is_empty());
    }
}
