//! Named registry of processing stages with a single hot-swappable active stage.
//!
//! Stages are registered under a name, initialised before they become
//! reachable, and published as active through an atomic pointer swap so the
//! frame path never waits on registry mutations. A stage that is replaced or
//! unregistered is retired under its own write lock before `cleanup` runs; a
//! frame that raced with the retirement reloads the active pointer.

pub mod detector;
pub mod homography;
pub mod motion;
pub mod passthrough;
pub mod stage;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use detector::{BoundingBox, Detection, DetectorBackend, DetectorConfig, DetectorStage};
pub use homography::{HomographyConfig, HomographyStage, Point};
pub use motion::MotionBackend;
pub use passthrough::PassThroughStage;
pub use stage::{create_stage, ProcessingResult, ProcessingStage, StageFault, StageKind};

use crate::capture::Frame;
use crate::error::PipelineError;
use crate::utils::{read, write};
use crate::PipelineConfig;

struct StageSlot {
    name: String,
    stage: RwLock<Box<dyn ProcessingStage>>,
    retired: AtomicBool,
}

impl StageSlot {
    fn new(name: String, stage: Box<dyn ProcessingStage>) -> Arc<Self> {
        Arc::new(Self {
            name,
            stage: RwLock::new(stage),
            retired: AtomicBool::new(false),
        })
    }

    /// Make the slot unreachable for new work, then release the stage.
    fn retire(&self) {
        let mut stage = write(&self.stage);
        if !self.retired.swap(true, Ordering::AcqRel) {
            stage.cleanup();
            debug!(stage = %self.name, "Stage cleaned up");
        }
    }
}

pub struct Pipeline {
    stages: RwLock<HashMap<String, Arc<StageSlot>>>,
    active: ArcSwapOption<StageSlot>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Empty pipeline with no active stage.
    pub fn new() -> Self {
        Self {
            stages: RwLock::new(HashMap::new()),
            active: ArcSwapOption::empty(),
        }
    }

    /// Pipeline with the pass-through stage registered as `raw` and active.
    pub fn with_passthrough() -> Self {
        let pipeline = Self::new();
        let slot = StageSlot::new("raw".into(), Box::new(PassThroughStage));
        write(&pipeline.stages).insert("raw".into(), Arc::clone(&slot));
        pipeline.active.store(Some(slot));
        pipeline
    }

    /// Build stages from configuration. `raw` is always present; the
    /// configured active stage is published last.
    pub fn from_settings(settings: &PipelineConfig) -> Result<Self, PipelineError> {
        let pipeline = Self::with_passthrough();

        for (name, entry) in &settings.stages {
            if name == "raw" && entry.kind == StageKind::Raw && entry.config.is_none() {
                continue;
            }

            let mut stage = create_stage(entry.kind);
            if let Some(config) = &entry.config {
                stage
                    .set_config(config)
                    .map_err(|source| PipelineError::InvalidConfig {
                        name: name.clone(),
                        source,
                    })?;
            }

            if pipeline.contains(name) {
                pipeline.replace_stage(name, stage)?;
            } else {
                pipeline.register_stage(name.clone(), stage)?;
            }
        }

        pipeline.set_active_stage(&settings.active_stage)?;
        Ok(pipeline)
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.stages).contains_key(name)
    }

    /// Initialise `stage` and add it under `name`.
    pub fn register_stage(
        &self,
        name: impl Into<String>,
        mut stage: Box<dyn ProcessingStage>,
    ) -> Result<(), PipelineError> {
        let name = name.into();
        let mut stages = write(&self.stages);
        if stages.contains_key(&name) {
            return Err(PipelineError::DuplicateStage(name));
        }

        stage
            .initialize()
            .map_err(|source| PipelineError::StageInit {
                name: name.clone(),
                source,
            })?;

        info!(stage = %name, kind = stage.name(), "Registered processing stage");
        stages.insert(name.clone(), StageSlot::new(name, stage));
        Ok(())
    }

    /// Publish `name` as the active stage. The previous active stage stays
    /// active on failure.
    pub fn set_active_stage(&self, name: &str) -> Result<(), PipelineError> {
        let stages = read(&self.stages);
        let slot = stages
            .get(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;

        let previous = self.active.swap(Some(Arc::clone(slot)));
        info!(
            from = previous.as_ref().map(|s| s.name.as_str()).unwrap_or("none"),
            to = name,
            "Active stage switched"
        );
        Ok(())
    }

    pub fn active_stage(&self) -> Option<String> {
        self.active.load().as_ref().map(|slot| slot.name.clone())
    }

    /// Registered stage names, sorted.
    pub fn list_stages(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.stages).keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `frame` through the active stage.
    pub fn process_frame(&self, frame: &Frame) -> ProcessingResult {
        loop {
            let Some(slot) = self.active.load_full() else {
                return ProcessingResult::failed(
                    frame.clone(),
                    json!({ "error": "no active stage" }),
                    Duration::ZERO,
                    StageFault::Failed("no active stage".into()),
                );
            };

            let stage = read(&slot.stage);
            if slot.retired.load(Ordering::Acquire) {
                // replaced or unregistered while we were loading it
                continue;
            }

            let result = stage.process(frame);
            metrics::histogram!("pipeline_process_time_us", "stage" => slot.name.clone())
                .record(result.processing_time.as_micros() as f64);
            return result;
        }
    }

    pub fn stage_config(&self, name: &str) -> Result<Value, PipelineError> {
        let slot = self.slot(name)?;
        let config = read(&slot.stage).config();
        Ok(config)
    }

    pub fn set_stage_config(&self, name: &str, config: &Value) -> Result<(), PipelineError> {
        let slot = self.slot(name)?;
        let mut stage = write(&slot.stage);
        stage
            .set_config(config)
            .map_err(|source| PipelineError::InvalidConfig {
                name: name.to_string(),
                source,
            })?;
        debug!(stage = name, "Stage reconfigured");
        Ok(())
    }

    /// Swap in a new instance under an existing name. If the old instance
    /// was active the new one is published in its place before the old one
    /// is cleaned up.
    pub fn replace_stage(
        &self,
        name: &str,
        mut stage: Box<dyn ProcessingStage>,
    ) -> Result<(), PipelineError> {
        let mut stages = write(&self.stages);
        if !stages.contains_key(name) {
            return Err(PipelineError::NotFound(name.to_string()));
        }

        stage
            .initialize()
            .map_err(|source| PipelineError::StageInit {
                name: name.to_string(),
                source,
            })?;

        let fresh = StageSlot::new(name.to_string(), stage);
        let Some(old) = stages.insert(name.to_string(), Arc::clone(&fresh)) else {
            return Ok(());
        };

        let was_active = self
            .active
            .load()
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &old));
        if was_active {
            self.active.store(Some(fresh));
        }

        old.retire();
        info!(stage = name, was_active, "Replaced processing stage");
        Ok(())
    }

    /// Remove an inactive stage and clean it up.
    pub fn unregister_stage(&self, name: &str) -> Result<(), PipelineError> {
        let mut stages = write(&self.stages);
        let slot = stages
            .get(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;

        let is_active = self
            .active
            .load()
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, slot));
        if is_active {
            return Err(PipelineError::StageActive(name.to_string()));
        }

        if let Some(slot) = stages.remove(name) {
            slot.retire();
        }
        info!(stage = name, "Unregistered processing stage");
        Ok(())
    }

    /// Clear the active stage and clean up every stage. Idempotent.
    pub fn shutdown(&self) {
        self.active.store(None);
        let drained: Vec<Arc<StageSlot>> = write(&self.stages).drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }

        for slot in &drained {
            slot.retire();
        }
        info!(count = drained.len(), "Pipeline shut down");
    }

    fn slot(&self, name: &str) -> Result<Arc<StageSlot>, PipelineError> {
        read(&self.stages).get(name).cloned().ok_or_else(|| {
            warn!(stage = name, "Unknown stage");
            PipelineError::NotFound(name.to_string())
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
