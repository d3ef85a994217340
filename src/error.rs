//! Error types for every layer of the server core.

use thiserror::Error;

use crate::capture::PixelFormat;
use crate::stream::EngineState;

/// Failures turning a captured frame into packed RGB pixels.
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    #[error("frame is empty or has zero dimensions")]
    Invalid,

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("frame buffer has {actual} bytes, {format:?} {width}x{height} needs {expected}")]
    BufferSize {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("jpeg decode failed: {0}")]
    Decode(String),
}

/// Failures on the resize + JPEG encode path. Always per-frame.
#[derive(Debug, Clone, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("jpeg encode failed: {0}")]
    Jpeg(String),

    #[error("encoder unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported by a processing stage or one of its backends.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("all detector backends unavailable")]
    BackendsExhausted,

    #[error("backend '{backend}' failed: {reason}")]
    Backend { backend: String, reason: String },
}

/// Registry-level errors from the processing pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{0}' not found")]
    NotFound(String),

    #[error("stage '{0}' already registered")]
    DuplicateStage(String),

    #[error("stage '{0}' is the active stage")]
    StageActive(String),

    #[error("stage '{name}' failed to initialize: {source}")]
    StageInit {
        name: String,
        #[source]
        source: StageError,
    },

    #[error("stage '{name}' rejected config: {source}")]
    InvalidConfig {
        name: String,
        #[source]
        source: StageError,
    },

    #[error("unknown stage kind '{0}'")]
    UnknownKind(String),
}

/// Errors surfaced by the distribution engine to the transport layer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream config: {0}")]
    InvalidConfig(String),

    #[error("stream engine has not been initialized")]
    NotInitialized,

    #[error("stream engine is not running (state: {0})")]
    NotRunning(EngineState),

    #[error("stream engine is busy (state: {0})")]
    Busy(EngineState),

    #[error("client '{0}' already registered")]
    DuplicateClient(String),

    #[error("camera '{camera_id}' already has the maximum of {limit} clients")]
    CapacityExceeded { camera_id: String, limit: usize },

    #[error(transparent)]
    Encoder(#[from] EncodeError),
}

/// Returned by a client's frame callback when the write to the client failed.
#[derive(Debug, Clone, Error)]
#[error("delivery to client failed: {0}")]
pub struct DeliveryError(pub String);

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Frame source failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device error: {0}")]
    Device(String),

    #[error("capture stream not started")]
    NotStarted,

    #[error("unsupported capture format: {0:?}")]
    UnsupportedFormat(PixelFormat),
}

/// Errors while loading layered configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors while assembling the server context.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
