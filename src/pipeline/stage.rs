//! The processing stage contract and the result it produces.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::detector::DetectorStage;
use super::homography::HomographyStage;
use super::passthrough::PassThroughStage;
use crate::capture::Frame;
use crate::error::{PipelineError, StageError};

/// A pluggable transformation from one image to a processed image plus
/// structured metadata.
///
/// The pipeline calls `initialize` exactly once before a stage becomes
/// reachable, and `cleanup` exactly once when it is replaced, unregistered
/// or the pipeline shuts down. `process` must never panic on bad input;
/// failures are reported in the returned result.
pub trait ProcessingStage: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<(), StageError>;

    fn process(&self, frame: &Frame) -> ProcessingResult;

    /// Current configuration as a JSON document.
    fn config(&self) -> Value;

    /// Apply a JSON configuration document. On error the stage keeps its
    /// previous configuration.
    fn set_config(&mut self, config: &Value) -> Result<(), StageError>;

    fn cleanup(&mut self) {}
}

/// Why a stage could not produce its intended output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFault {
    /// The frame could not be processed; the original is passed on.
    Failed(String),
    /// Every execution backend of the stage is unavailable.
    BackendsExhausted(String),
}

/// Output of a single `process` call.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub frame: Frame,
    pub metadata: Value,
    pub processing_time: Duration,
    pub success: bool,
    pub fault: Option<StageFault>,
}

impl ProcessingResult {
    pub fn ok(frame: Frame, metadata: Value, processing_time: Duration) -> Self {
        Self {
            frame,
            metadata,
            processing_time,
            success: true,
            fault: None,
        }
    }

    pub fn failed(
        frame: Frame,
        metadata: Value,
        processing_time: Duration,
        fault: StageFault,
    ) -> Self {
        Self {
            frame,
            metadata,
            processing_time,
            success: false,
            fault: Some(fault),
        }
    }

    pub fn backends_exhausted(&self) -> bool {
        matches!(self.fault, Some(StageFault::BackendsExhausted(_)))
    }
}

/// Built-in stage kinds available from the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Raw,
    Homography,
    Detector,
}

impl StageKind {
    pub fn all() -> &'static [StageKind] {
        &[StageKind::Raw, StageKind::Homography, StageKind::Detector]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Raw => "raw",
            StageKind::Homography => "homography",
            StageKind::Detector => "detector",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownKind(s.to_string()))
    }
}

/// Build an uninitialised stage of the given kind with default settings.
pub fn create_stage(kind: StageKind) -> Box<dyn ProcessingStage> {
    match kind {
        StageKind::Raw => Box::new(PassThroughStage),
        StageKind::Homography => Box::new(HomographyStage::default()),
        StageKind::Detector => Box::new(DetectorStage::cpu()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_names() {
        for kind in StageKind::all() {
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), *kind);
        }
        assert!(matches!(
            "yolo".parse::<StageKind>(),
            Err(PipelineError::UnknownKind(name)) if name == "yolo"
        ));
    }

    #[test]
    fn factory_builds_every_kind() {
        let names: Vec<String> = StageKind::all()
            .iter()
            .map(|kind| create_stage(*kind).name().to_string())
            .collect();
        assert_eq!(names, ["raw", "homography", "detector"]);
    }
}
