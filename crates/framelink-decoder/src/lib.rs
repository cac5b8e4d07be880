//! framelink-decoder
//!
//! Asynchronous hardware decoder sessions. A session wraps one platform
//! decoder configured to render straight into an off-screen surface; the
//! frame id travelling with each coded frame is recovered on output through
//! the [`FrameCorrelationTable`].
//!
//! # Flow
//! ```text
//! decoder ──input slot──▶ InputBuffer ──queue(frame id)──▶ decoder
//!         ──output(pts)──▶ table.take(pts) ──FrameReady(id)──▶ render worker
//! ```
//!
//! Backends: [`loopback`] (always built) and `gst` (feature `gstreamer`).

pub mod backend;
pub mod frame_map;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod input;
pub mod loopback;
pub mod session;
pub mod signal;

pub use backend::{
    CodecCallbacks, DecoderBackend, DecoderFormat, DecoderParams, DecoderProvider, DecoderRegistry, InputKind,
};
pub use frame_map::{FrameCorrelationTable, NO_FRAME};
pub use input::{next_presentation_time_us, InputBuffer};
pub use loopback::{LoopbackControl, LoopbackProvider, LoopbackStats};
pub use session::{HardwareDecoderSession, SessionSinks};
pub use signal::{render_channel, FrameRejected, RenderQueue, RenderSignal, RenderSignals};
