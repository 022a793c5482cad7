//! Teardown signalling shared by the broker and bot adapters
//!
//! Neither adapter has a cancellation token; the only way to stop a
//! background loop is teardown of its owner, which flips this signal.

use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Owner side of the teardown signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Background-loop side of the teardown signal
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownListener) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownListener { rx })
    }

    /// Request teardown. Returns false if it had already been requested.
    pub fn request(&self) -> bool {
        self.tx.send_if_modified(|stop| {
            if *stop {
                false
            } else {
                *stop = true;
                true
            }
        })
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ShutdownListener {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once teardown has been requested (or the owner is gone)
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            debug!("Shutdown owner dropped, treating as teardown");
        }
    }

    /// Sleep unless teardown arrives first.
    /// Returns true if the sleep completed, false if teardown was requested.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = self.requested() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
