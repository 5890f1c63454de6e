//! Diagnostic events raised anywhere in the core.
//!
//! Every event is written to the local log right away and queued for the device
//! loop, which mirrors it to the observer while one is connected.

use log::Level;
use tokio::sync::mpsc;

pub type DiagnosticsReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Clone, Debug)]
pub struct Diagnostics {
    tx: mpsc::UnboundedSender<String>,
}

impl Diagnostics {
    pub fn channel() -> (Self, DiagnosticsReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{message}");

        // receiver is gone once the device loop has stopped
        let _ = self.tx.send(message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.report(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.report(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.report(Level::Error, message);
    }
}
