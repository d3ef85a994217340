//! Detector failures travel from the pipeline into the engine. Only a stage
//! with no backend left may take distribution down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camstream::capture::{Frame, FrameMetadata, PixelFormat};
use camstream::error::StageError;
use camstream::pipeline::{Detection, DetectorBackend, DetectorStage, Pipeline};
use camstream::stream::{Delivery, EngineState, FrameOutcome, StreamConfig, StreamEngine};
use image::RgbImage;

/// Fails the listed `detect` calls (1-based). `lost` fails them as
/// unavailable instead of transiently.
struct Flaky {
    calls: u32,
    fail_on: Vec<u32>,
    lost: bool,
}

impl DetectorBackend for Flaky {
    fn name(&self) -> &str {
        "cpu"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, StageError> {
        self.calls += 1;
        if !self.fail_on.contains(&self.calls) {
            return Ok(Vec::new());
        }
        if self.lost {
            Err(StageError::BackendUnavailable {
                backend: "cpu".into(),
                reason: "device lost".into(),
            })
        } else {
            Err(StageError::Backend {
                backend: "cpu".into(),
                reason: "inference timed out".into(),
            })
        }
    }
}

fn pipeline(backend: Flaky) -> Pipeline {
    let pipeline = Pipeline::new();
    pipeline
        .register_stage("detector", Box::new(DetectorStage::new(vec![Box::new(backend)])))
        .unwrap();
    pipeline.set_active_stage("detector").unwrap();
    pipeline
}

fn engine() -> Arc<StreamEngine> {
    let engine = Arc::new(StreamEngine::new());
    engine.initialize(StreamConfig::default()).unwrap();
    engine.start().unwrap();
    engine
}

fn frame(sequence: u32) -> Frame {
    Frame::new("cam0", 16, 16, PixelFormat::Rgb24, vec![40u8; 16 * 16 * 3]).with_metadata(
        FrameMetadata {
            sequence,
            ..Default::default()
        },
    )
}

#[test]
fn transient_detector_failure_keeps_streaming() {
    let pipeline = pipeline(Flaky {
        calls: 0,
        fail_on: vec![2],
        lost: false,
    });
    let engine = engine();
    let mut sub = engine.add_client("c1", "cam0").unwrap();
    let t0 = Instant::now();

    let outcomes: Vec<FrameOutcome> = (1..=4u32)
        .map(|sequence| {
            let result = pipeline.process_frame(&frame(sequence));
            let at = t0 + Duration::from_millis(u64::from(sequence) * 100);
            engine.handle_frame_at(&result, at)
        })
        .collect();

    assert_eq!(outcomes, [FrameOutcome::Delivered(1); 4]);
    assert_eq!(engine.state(), EngineState::Running);
    assert!(engine.last_error().is_none());

    let sequences: Vec<u32> = sub
        .drain()
        .into_iter()
        .filter_map(|d| match d {
            Delivery::Frame(frame) => Some(frame.sequence),
            _ => None,
        })
        .collect();
    assert_eq!(sequences, [1, 2, 3, 4]);
    assert!(engine.add_client("c2", "cam0").is_ok());
}

#[test]
fn lost_backend_escalates() {
    let pipeline = pipeline(Flaky {
        calls: 0,
        fail_on: vec![2],
        lost: true,
    });
    let engine = engine();
    let _sub = engine.add_client("c1", "cam0").unwrap();
    let t0 = Instant::now();

    let first = pipeline.process_frame(&frame(1));
    assert_eq!(engine.handle_frame_at(&first, t0), FrameOutcome::Delivered(1));

    let second = pipeline.process_frame(&frame(2));
    assert!(second.backends_exhausted());
    assert_eq!(
        engine.handle_frame_at(&second, t0 + Duration::from_millis(100)),
        FrameOutcome::Escalated
    );
    assert_eq!(engine.state(), EngineState::Error);
}
