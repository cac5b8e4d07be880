//! framelink-pipeline: decode-and-present state machine.
//!
//! ```text
//!  settings mailbox ─┐
//!  target mailbox   ─┼─▶ worker task ──▶ DecodeGeneration (session + render target + table)
//!  commands         ─┘        ▲                    │
//!                             └── RenderSignal ◀───┘ decoder callbacks
//! ```
//!
//! A [`DecodePipeline`] owns at most one decode generation at a time. Every
//! transition (`start`, `restart`, `pause`, `stop`) runs on a single worker
//! task; decoder callbacks run on their own threads and only ever talk to the
//! worker through the render signal channel.

pub mod fps;
mod generation;
pub mod mailbox;
pub mod observer;
pub mod pipeline;

pub use fps::FrameRateMeter;
pub use mailbox::Mailbox;
pub use observer::{FrameObserver, LoggingObserver};
pub use pipeline::{DecodePipeline, PipelineState, PipelineStats};
