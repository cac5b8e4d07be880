//! Presentation-timestamp → frame-id correlation.
//!
//! Decoders echo back only the timestamp they were given, so the id of each
//! submitted frame is parked here under `timestamp & (N - 1)` and picked up
//! again when the decoder reports the output. Two in-flight frames whose
//! timestamps share a slot overwrite each other; the earlier one is then
//! reported as a correlation miss and dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use framelink_core::config::DEFAULT_CORRELATION_SLOTS;
use tracing::warn;

/// Frame id meaning "no entry".
pub const NO_FRAME: u64 = 0;

pub struct FrameCorrelationTable {
    slots: Box<[AtomicU64]>,
    mask: u64,
}

impl FrameCorrelationTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CORRELATION_SLOTS)
    }

    /// `slots` is rounded up to the next power of two.
    pub fn with_capacity(slots: usize) -> Self {
        let capacity = slots.max(1).next_power_of_two();
        if capacity != slots {
            warn!("Correlation table size {} is not a power of two, using {}", slots, capacity);
        }
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(NO_FRAME)).collect(),
            mask: capacity as u64 - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record `frame_id` under `timestamp_us`, replacing whatever was there.
    pub fn put(&self, timestamp_us: u64, frame_id: u64) {
        if frame_id == NO_FRAME {
            warn!("0 means no value, ignoring frame id 0 (ts={}us)", timestamp_us);
            return;
        }
        self.slot(timestamp_us).store(frame_id, Ordering::Release);
    }

    /// Remove and return the id stored under `timestamp_us`, or [`NO_FRAME`].
    pub fn take(&self, timestamp_us: u64) -> u64 {
        self.slot(timestamp_us).swap(NO_FRAME, Ordering::AcqRel)
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != NO_FRAME)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Empty every slot. Returns how many frame ids were discarded.
    pub fn clear(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.swap(NO_FRAME, Ordering::AcqRel) != NO_FRAME)
            .count()
    }

    fn slot(&self, timestamp_us: u64) -> &AtomicU64 {
        &self.slots[(timestamp_us & self.mask) as usize]
    }
}

impl Default for FrameCorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
