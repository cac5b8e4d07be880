//! Decoder → render worker signalling.
//!
//! Frame notifications are bounded: at most `depth` `FrameReady` signals can
//! be waiting, further ones are rejected and the caller counts a drop.
//! `Cancelled` and `Fatal` always get through so teardown and error handling
//! never depend on the consumer keeping up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use framelink_core::DecoderError;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum RenderSignal {
    /// Frame `frame_id` has been rendered into the off-screen surface of
    /// decoder session `session`.
    FrameReady { session: u64, frame_id: u64 },
    /// Wake the consumer without a frame; sent on teardown.
    Cancelled,
    /// Decoder session `session` failed and will produce nothing more.
    Fatal { session: u64, error: DecoderError },
}

/// Why a decoded frame could not be handed to the render worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameRejected {
    #[error("render queue full")]
    Full,
    #[error("render worker gone")]
    Closed,
}

/// Producer half; cloned into every decoder session.
#[derive(Clone)]
pub struct RenderQueue {
    tx: mpsc::UnboundedSender<RenderSignal>,
    pending: Arc<AtomicUsize>,
    depth: usize,
}

/// Consumer half, owned by the render worker.
pub struct RenderSignals {
    rx: mpsc::UnboundedReceiver<RenderSignal>,
    pending: Arc<AtomicUsize>,
}

pub fn render_channel(depth: usize) -> (RenderQueue, RenderSignals) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        RenderQueue {
            tx,
            pending: Arc::clone(&pending),
            depth: depth.max(1),
        },
        RenderSignals { rx, pending },
    )
}

impl RenderQueue {
    pub fn frame_ready(&self, session: u64, frame_id: u64) -> Result<(), FrameRejected> {
        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.depth {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(FrameRejected::Full);
        }
        if self.tx.send(RenderSignal::FrameReady { session, frame_id }).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(FrameRejected::Closed);
        }
        Ok(())
    }

    /// Returns `false` if the consumer is gone.
    pub fn cancel(&self) -> bool {
        self.tx.send(RenderSignal::Cancelled).is_ok()
    }

    pub fn fatal(&self, session: u64, error: DecoderError) -> bool {
        self.tx.send(RenderSignal::Fatal { session, error }).is_ok()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl RenderSignals {
    pub async fn recv(&mut self) -> Option<RenderSignal> {
        let signal = self.rx.recv().await;
        self.account(&signal);
        signal
    }

    pub fn try_recv(&mut self) -> Option<RenderSignal> {
        let signal = self.rx.try_recv().ok();
        self.account(&signal);
        signal
    }

    /// Frame notifications currently waiting.
    pub fn pending_frames(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn account(&self, signal: &Option<RenderSignal>) {
        if let Some(RenderSignal::FrameReady { .. }) = signal {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
