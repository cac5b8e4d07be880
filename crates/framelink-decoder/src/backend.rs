use std::sync::Arc;

use framelink_core::{DecoderError, StreamSettings, VideoCodec};
use framelink_renderer::SurfaceHandle;
use tracing::{info, warn};

// MARK: - Format / parameters

/// Decoder tuning derived from [`StreamSettings`]; updatable while running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderParams {
    /// Request real-time scheduling priority. Best effort.
    pub realtime: bool,
    /// Expected input rate, used as the operating-rate hint.
    pub operating_rate: f32,
    /// Vendor low-latency mode.
    pub low_latency: bool,
}

impl DecoderParams {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            realtime: settings.realtime,
            operating_rate: settings.fps,
            low_latency: true,
        }
    }
}

/// Everything a backend needs to configure one decoder instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderFormat {
    pub codec: VideoCodec,
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
    pub params: DecoderParams,
}

/// What an input buffer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Codec configuration (SPS/PPS/VPS); always queued with timestamp 0.
    CodecConfig,
    /// A coded frame.
    Frame,
}

// MARK: - Callbacks

/// Raw platform decoder callbacks. Invoked on a thread chosen by the backend,
/// possibly several different ones over a session's life.
pub trait CodecCallbacks: Send + Sync {
    fn on_input_buffer_available(&self, index: usize, capacity: usize);

    fn on_output_buffer_available(&self, index: usize, presentation_time_us: u64);

    fn on_output_format_changed(&self, width: u32, height: u32);

    fn on_error(&self, error: DecoderError);
}

// MARK: - Backend

/// One platform decoder instance (MediaCodec, GStreamer pipeline, ...).
pub trait DecoderBackend: Send {
    fn name(&self) -> &str;

    fn configure(
        &mut self,
        format: &DecoderFormat,
        surface: SurfaceHandle,
        callbacks: Arc<dyn CodecCallbacks>,
    ) -> Result<(), DecoderError>;

    fn start(&mut self) -> Result<(), DecoderError>;

    fn queue_input(
        &mut self,
        index: usize,
        data: &[u8],
        presentation_time_us: u64,
        kind: InputKind,
    ) -> Result<(), DecoderError>;

    /// Return an output buffer; with `render` the image goes to the surface.
    fn release_output(&mut self, index: usize, render: bool) -> Result<(), DecoderError>;

    fn set_parameters(&mut self, params: &DecoderParams) -> Result<(), DecoderError>;

    /// Stop decoding and free platform resources. Must tolerate repeats.
    fn stop(&mut self);
}

/// Factory for one decoder implementation.
pub trait DecoderProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, codec: VideoCodec) -> bool;

    fn is_hardware_accelerated(&self) -> bool {
        true
    }

    fn create(&self) -> Result<Box<dyn DecoderBackend>, DecoderError>;
}

// MARK: - Registry

/// Decoder providers in priority order.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    providers: Vec<Arc<dyn DecoderProvider>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl DecoderProvider + 'static) -> Self {
        self.register(provider);
        self
    }

    /// Append a provider (lowest priority so far).
    pub fn register(&mut self, provider: impl DecoderProvider + 'static) {
        self.providers.push(Arc::new(provider));
    }

    /// Move the provider called `name` to the front. Returns `false` if no
    /// provider has that name.
    pub fn prefer(&mut self, name: &str) -> bool {
        match self.providers.iter().position(|p| p.name() == name) {
            Some(pos) => {
                let provider = self.providers.remove(pos);
                self.providers.insert(0, provider);
                true
            }
            None => {
                warn!("Preferred decoder '{}' is not registered", name);
                false
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_owned()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Highest-priority provider able to decode `codec`.
    pub fn select(&self, codec: VideoCodec) -> Result<Arc<dyn DecoderProvider>, DecoderError> {
        if codec.mime().is_none() {
            return Err(DecoderError::NoCompatibleDecoder { codec });
        }
        for provider in &self.providers {
            if provider.supports(codec) {
                info!(
                    "Selected decoder: {} for {} (hw={})",
                    provider.name(),
                    codec,
                    provider.is_hardware_accelerated()
                );
                return Ok(Arc::clone(provider));
            }
            warn!("Decoder '{}' cannot decode {}, trying next", provider.name(), codec);
        }
        Err(DecoderError::NoCompatibleDecoder { codec })
    }
}
