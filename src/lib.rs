pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod stream;
pub mod utils;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use capture::{Frame, FrameMetadata, PixelFormat};
pub use error::ConfigError;
pub use pipeline::{Pipeline, ProcessingResult, ProcessingStage, StageKind};
pub use server::CameraServer;
pub use stream::{StreamConfig, StreamEngine};

/// Environment variables overriding file settings, e.g.
/// `CAMSTREAM__STREAM__MAX_FPS=15`.
pub const ENV_PREFIX: &str = "CAMSTREAM";

/// Server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub pipeline: PipelineConfig,
    pub service: ServiceConfig,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    TestPattern,
    V4l2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub camera_id: String,
    /// Empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Frames buffered between capture and processing
    pub queue_depth: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::TestPattern,
            camera_id: "cam0".into(),
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Rgb24,
            buffer_count: 4,
            queue_depth: 4,
        }
    }
}

/// One configured stage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    pub kind: StageKind,
    /// Stage-specific document passed to `set_config`
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub active_stage: String,
    pub stages: BTreeMap<String, StageSettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            active_stage: "raw".into(),
            stages: BTreeMap::new(),
        }
    }
}

/// Settings for the background tasks of the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub reap_interval_secs: u64,
    pub stats_interval_secs: u64,
    /// In-process clients that consume the stream, for smoke testing
    pub demo_viewers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: 5,
            stats_interval_secs: 10,
            demo_viewers: 1,
        }
    }
}

impl Config {
    /// Load defaults, then the optional TOML file, then `CAMSTREAM__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let loaded: Config = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 || capture.fps == 0 {
            return Err(ConfigError::Invalid(
                "capture width, height and fps must be positive".into(),
            ));
        }
        if capture.camera_id.is_empty() {
            return Err(ConfigError::Invalid("capture.camera_id is empty".into()));
        }
        if self.pipeline.active_stage.is_empty() {
            return Err(ConfigError::Invalid("pipeline.active_stage is empty".into()));
        }
        Ok(())
    }
}
