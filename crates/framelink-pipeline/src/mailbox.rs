use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::trace;

/// Single-slot channel that keeps only the newest value.
///
/// `send` never blocks and replaces whatever is waiting; `receive` waits
/// until a value is present. `receive` is cancel-safe: a value is only taken
/// out of the slot in the same poll that returns it.
pub struct Mailbox<T> {
    name: &'static str,
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Mailbox<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Store `value`. Returns `true` if an older, unread value was discarded.
    pub fn send(&self, value: T) -> bool {
        let replaced = self.lock().replace(value).is_some();
        if replaced {
            trace!("{} mailbox: unread value overwritten", self.name);
        }
        self.notify.notify_one();
        replaced
    }

    pub async fn receive(&self) -> T {
        loop {
            if let Some(value) = self.lock().take() {
                return value;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_receive(&self) -> Option<T> {
        self.lock().take()
    }

    /// Drop the waiting value, if any, and return it.
    pub fn clear(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
