use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default correlation table size (slots). Must be a power of two.
pub const DEFAULT_CORRELATION_SLOTS: usize = 4096;

/// Runtime tuning for a decode pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots in each generation's frame correlation table.
    #[serde(alias = "correlationSlots")]
    pub correlation_slots: usize,
    /// Capacity of the decoder → worker "frame ready" channel. Signals beyond
    /// this are dropped and counted.
    #[serde(alias = "renderQueueDepth")]
    pub render_queue_depth: usize,
    /// Preferred decoder provider name; tried before the registry order.
    #[serde(alias = "preferredDecoder")]
    pub decoder: Option<String>,
    /// Log the presented frame rate once per second at debug level.
    #[serde(alias = "logFps")]
    pub log_fps: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            correlation_slots: DEFAULT_CORRELATION_SLOTS,
            render_queue_depth: 16,
            decoder: None,
            log_fps: true,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `FRAMELINK_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FRAMELINK_CORRELATION_SLOTS` | `correlation_slots` |
    /// | `FRAMELINK_RENDER_QUEUE_DEPTH` | `render_queue_depth` (min 1) |
    /// | `FRAMELINK_DECODER` | `decoder` |
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(slots) = env_parse::<usize>("FRAMELINK_CORRELATION_SLOTS") {
            cfg.correlation_slots = slots;
        }
        if let Some(depth) = env_parse::<usize>("FRAMELINK_RENDER_QUEUE_DEPTH") {
            cfg.render_queue_depth = depth.max(1);
        }
        if let Ok(name) = std::env::var("FRAMELINK_DECODER") {
            if !name.trim().is_empty() {
                cfg.decoder = Some(name.trim().to_owned());
            }
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}
