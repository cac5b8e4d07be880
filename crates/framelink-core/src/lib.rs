pub mod config;
pub mod display;
pub mod errors;
pub mod types;

pub use config::PipelineConfig;
pub use display::{DisplayTarget, NativeSurface};
pub use errors::{DecoderError, GraphicsError, PipelineError};
pub use types::*;
