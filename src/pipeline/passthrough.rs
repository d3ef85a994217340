use std::time::Duration;

use serde_json::{json, Value};

use super::stage::{ProcessingResult, ProcessingStage};
use crate::capture::Frame;
use crate::error::StageError;

/// Returns every frame unchanged. The bootstrap stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughStage;

impl ProcessingStage for PassThroughStage {
    fn name(&self) -> &str {
        "raw"
    }

    fn initialize(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    fn process(&self, frame: &Frame) -> ProcessingResult {
        ProcessingResult::ok(
            frame.clone(),
            json!({ "type": "raw", "processing": "none" }),
            Duration::ZERO,
        )
    }

    fn config(&self) -> Value {
        json!({})
    }

    fn set_config(&mut self, config: &Value) -> Result<(), StageError> {
        match config {
            Value::Object(_) | Value::Null => Ok(()),
            other => Err(StageError::InvalidConfig(format!(
                "expected an object, got {other}"
            ))),
        }
    }
}
