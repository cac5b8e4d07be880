use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Presented-frame rate, reported once per second.
pub struct FrameRateMeter {
    window_start: Instant,
    frames: u32,
    last: Option<f32>,
}

impl FrameRateMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            last: None,
        }
    }

    /// Count one frame. Returns the rate when a reporting window closes.
    pub fn tick(&mut self) -> Option<f32> {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < REPORT_INTERVAL {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        debug!("FPS: {:.1}", fps);
        self.frames = 0;
        self.window_start = Instant::now();
        self.last = Some(fps);
        Some(fps)
    }

    pub fn last(&self) -> Option<f32> {
        self.last
    }

    /// Start a fresh window, e.g. after a pause.
    pub fn reset(&mut self) {
        self.frames = 0;
        self.window_start = Instant::now();
    }
}

impl Default for FrameRateMeter {
    fn default() -> Self {
        Self::new()
    }
}
