use thiserror::Error;

use crate::types::VideoCodec;

/// Surface or context failures. Fatal to the current decode generation, never
/// to the process.
#[derive(Error, Debug)]
pub enum GraphicsError {
    #[error("GPU context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("Failed to make the GPU context current: {0}")]
    MakeCurrentFailed(String),

    #[error("Display surface rejected: {reason}")]
    SurfaceRejected { reason: String },

    #[error("{operation} failed: {reason}")]
    OperationFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("Surface handle already released")]
    Released,
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("No decoder available for codec {codec}")]
    NoCompatibleDecoder { codec: VideoCodec },

    #[error("Decoder configuration rejected: {reason}")]
    ConfigurationRejected { reason: String },

    #[error("GStreamer pipeline error: {0}")]
    GStreamerPipeline(String),

    #[error("Failed to queue input buffer: {reason}")]
    QueueFailed { reason: String },

    #[error("Decoder session closed")]
    SessionClosed,

    #[error("Decoder not initialized")]
    NotInitialized,

    #[error("Fatal decoder error: {reason}")]
    Fatal { reason: String },

    #[error("Output surface error: {0}")]
    Surface(#[from] GraphicsError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Protocol misuse: {reason}")]
    ProtocolMisuse { reason: String },

    #[error("Graphics error: {0}")]
    Graphics(#[from] GraphicsError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),

    #[error("Pipeline worker is gone")]
    WorkerGone,
}

impl PipelineError {
    pub fn misuse(reason: impl Into<String>) -> Self {
        Self::ProtocolMisuse { reason: reason.into() }
    }
}
