use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use bytes::BytesMut;
use framelink_core::DecoderError;

use crate::backend::InputKind;
use crate::session::SessionShared;

static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();
static LAST_PTS: AtomicU64 = AtomicU64::new(0);

/// Monotonic presentation time in microseconds. Never 0 (reserved for codec
/// configuration) and strictly increasing across calls, so two frames queued
/// within the same microsecond still land in different correlation slots.
pub fn next_presentation_time_us() -> u64 {
    let base = *CLOCK_BASE.get_or_init(Instant::now);
    let now = base.elapsed().as_micros() as u64;
    let mut last = LAST_PTS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_PTS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// A free decoder input slot handed out to the stream consumer.
///
/// Fill it with [`InputBuffer::write`] and give it back with
/// [`InputBuffer::queue`] (coded frame) or [`InputBuffer::queue_config`]
/// (SPS/PPS). Buffers outliving their session fail with
/// [`DecoderError::SessionClosed`].
pub struct InputBuffer {
    session: Weak<SessionShared>,
    session_id: u64,
    index: usize,
    capacity: usize,
    data: BytesMut,
}

impl InputBuffer {
    pub(crate) fn new(session: &Arc<SessionShared>, index: usize, capacity: usize) -> Self {
        Self::for_session(Arc::downgrade(session), session.id, index, capacity)
    }

    fn for_session(session: Weak<SessionShared>, session_id: u64, index: usize, capacity: usize) -> Self {
        Self {
            session,
            session_id,
            index,
            capacity,
            // Grows on write; slots waiting in the channel stay cheap.
            data: BytesMut::new(),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Append `bytes` to the payload.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), DecoderError> {
        if self.data.len() + bytes.len() > self.capacity {
            return Err(DecoderError::QueueFailed {
                reason: format!(
                    "{} bytes exceed input buffer capacity {}",
                    self.data.len() + bytes.len(),
                    self.capacity
                ),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// `false` once the session that issued this buffer is gone.
    pub fn is_session_alive(&self) -> bool {
        self.session.upgrade().map_or(false, |s| s.is_active())
    }

    /// Queue the payload as codec configuration.
    pub fn queue_config(self) -> Result<(), DecoderError> {
        let session = self.session.upgrade().ok_or(DecoderError::SessionClosed)?;
        session.queue_input(self.index, &self.data, 0, InputKind::CodecConfig)
    }

    /// Queue the payload as frame `frame_id`; returns the presentation time
    /// it was submitted with.
    pub fn queue(self, frame_id: u64) -> Result<u64, DecoderError> {
        let session = self.session.upgrade().ok_or(DecoderError::SessionClosed)?;
        let pts = next_presentation_time_us();
        // Registered before queueing: the decoder may finish before
        // queue_input returns.
        session.frames.put(pts, frame_id);
        if let Err(e) = session.queue_input(self.index, &self.data, pts, InputKind::Frame) {
            session.frames.take(pts);
            return Err(e);
        }
        Ok(pts)
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("session", &self.session_id)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
