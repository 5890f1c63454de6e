use log::{error, info};
use std::time::Duration;
use tokio::sync::mpsc;

/// Why the device asked for a restart
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartReason {
    /// Observer sent the literal `reboot` command
    RebootCommand,
    /// New network credentials were submitted through the portal
    CredentialsSaved,
    /// An update image was staged and waits to be applied
    UpdateInstalled,
    /// Update delivery failed and cannot be recovered in this boot cycle
    UpdateFault,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::RebootCommand => write!(f, "reboot requested by observer"),
            RestartReason::CredentialsSaved => write!(f, "network credentials saved"),
            RestartReason::UpdateInstalled => write!(f, "update staged"),
            RestartReason::UpdateFault => write!(f, "update delivery failed"),
        }
    }
}

pub type RestartReceiver = mpsc::UnboundedReceiver<RestartReason>;

/// Cloneable trigger for the one "reset everything" primitive of the device
#[derive(Clone, Debug)]
pub struct RestartHandle {
    tx: mpsc::UnboundedSender<RestartReason>,
}

impl RestartHandle {
    pub fn channel() -> (Self, RestartReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self, reason: RestartReason) {
        info!("restart requested: {reason}");

        if let Err(e) = self.tx.send(reason) {
            error!("failed to request restart: {e:#}");
        }
    }

    /// Request a restart once `delay` has passed, e.g. to let a response flush
    pub fn request_after(&self, reason: RestartReason, delay: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.request(reason);
        });
    }
}
