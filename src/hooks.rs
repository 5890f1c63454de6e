//! Capability interface implemented by the host application.
//!
//! The core never interprets state fields. It hands proposed mutations to
//! [`StateHooks::on_state_mutation_proposed`] and asks
//! [`StateHooks::on_broadcast_prepare`] to fill outbound documents.

use crate::document::StateDocument;
use log::info;

pub trait StateHooks {
    /// Called on every edge of the observer link
    fn on_connectivity_changed(&mut self, connected: bool);

    /// Validate and merge a proposed mutation
    ///
    /// The document never contains the reserved address field.
    ///
    /// # Returns
    /// `true` if any accepted field changed the application state
    fn on_state_mutation_proposed(&mut self, document: &StateDocument) -> bool;

    /// Fill the outbound document with the current application state
    ///
    /// The address field is injected after this call and always wins.
    fn on_broadcast_prepare(&mut self, document: &mut StateDocument);
}

/// Host application that accepts every field and keeps the merged state
#[derive(Debug, Default)]
pub struct MergeStateHooks {
    state: StateDocument,
    connected: bool,
}

impl MergeStateHooks {
    pub fn state(&self) -> &StateDocument {
        &self.state
    }

    pub fn connected(&self) -> bool {
        self.connected
    }
}

impl StateHooks for MergeStateHooks {
    fn on_connectivity_changed(&mut self, connected: bool) {
        info!("observer connected: {connected}");
        self.connected = connected;
    }

    fn on_state_mutation_proposed(&mut self, document: &StateDocument) -> bool {
        let mut changed = false;

        for (key, value) in document.iter() {
            if self.state.get(key) != Some(value) {
                self.state.insert(key.clone(), value.clone());
                changed = true;
            }
        }

        changed
    }

    fn on_broadcast_prepare(&mut self, document: &mut StateDocument) {
        for (key, value) in self.state.iter() {
            document.insert(key.clone(), value.clone());
        }
    }
}
