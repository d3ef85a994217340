//! Explicit context owning the processing pipeline and the distribution
//! engine, shared by the capture producer and the transports.

use tracing::{info, instrument, trace};

use crate::capture::Frame;
use crate::error::ServerError;
use crate::pipeline::Pipeline;
use crate::stream::{FrameOutcome, StreamEngine};
use crate::Config;

pub struct CameraServer {
    pipeline: Pipeline,
    engine: StreamEngine,
}

impl CameraServer {
    /// Build the pipeline from configuration and start the engine.
    #[instrument(skip_all, fields(camera = %config.capture.camera_id))]
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        let pipeline = Pipeline::from_settings(&config.pipeline)?;
        let engine = StreamEngine::new();
        engine.initialize(config.stream.clone())?;
        engine.start()?;

        info!(
            stages = ?pipeline.list_stages(),
            active = pipeline.active_stage().as_deref().unwrap_or("none"),
            "Camera server ready"
        );
        Ok(Self { pipeline, engine })
    }

    pub fn from_parts(pipeline: Pipeline, engine: StreamEngine) -> Self {
        Self { pipeline, engine }
    }

    /// Entry point for captured frames: process, then distribute.
    pub fn on_frame(&self, frame: &Frame) -> FrameOutcome {
        let result = self.pipeline.process_frame(frame);
        let outcome = self.engine.handle_frame(&result);
        trace!(
            camera = frame.camera_id(),
            sequence = frame.metadata().sequence,
            ?outcome,
            "Frame handled"
        );
        outcome
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    /// Stop distribution, then release every stage.
    pub fn shutdown(&self) {
        self.engine.stop();
        self.pipeline.shutdown();
        info!("Camera server shut down");
    }
}
