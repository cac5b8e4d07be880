use framelink_core::{ConnectionEvent, DecoderError};
use tracing::{info, warn};

/// Receives what the pipeline has to report. Called from the pipeline's
/// worker task, so implementations must not block.
pub trait FrameObserver: Send + Sync {
    /// Frame `frame_id` has been presented. Called once per presented frame.
    fn on_frame_rendered(&self, frame_id: u64);

    /// A connection event handed to `DecodePipeline::on_connection_event`.
    fn on_connection_event(&self, _event: &ConnectionEvent) {}

    /// The decoder failed; the pipeline has already paused itself.
    fn on_decoder_error(&self, _error: &DecoderError) {}
}

impl<F> FrameObserver for F
where
    F: Fn(u64) + Send + Sync,
{
    fn on_frame_rendered(&self, frame_id: u64) {
        self(frame_id)
    }
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl FrameObserver for LoggingObserver {
    fn on_frame_rendered(&self, frame_id: u64) {
        tracing::trace!("Frame {} presented", frame_id);
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Error { error } => warn!("Connection error: {}", error),
            other => info!("Connection event: {:?}", other),
        }
    }

    fn on_decoder_error(&self, error: &DecoderError) {
        warn!("Decoder failed: {}", error);
    }
}
