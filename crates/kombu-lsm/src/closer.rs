//! Shutdown signaling for background workers.
//!
//! A [`Closer`] wraps a zero-capacity channel whose sender side is
//! dropped on `close()`. Workers select on `has_been_closed()` at their
//! dispatch boundaries; a disconnected receive fires immediately once
//! the closer is closed.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

struct Inner {
    rx: Receiver<()>,
    tx: Mutex<Option<Sender<()>>>,
}

impl Closer {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                rx,
                tx: Mutex::new(Some(tx)),
            }),
        }
    }

    /// Signals shutdown. Idempotent.
    pub fn close(&self) {
        self.inner.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    /// Channel that disconnects once `close()` has been called; use with
    /// `crossbeam_channel::select!`.
    pub fn has_been_closed(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}
