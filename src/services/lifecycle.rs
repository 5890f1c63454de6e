//! Network lifecycle
//!
//! Decides once per boot cycle whether the device joins its configured network
//! or hosts its own hub with the setup portal. Both outcomes are terminal until
//! the next restart.

use crate::{
    config::{DeviceSettings, Timing},
    diagnostics::Diagnostics,
    network_stack::{NetworkCredentials, NetworkStack},
    services::storage::ConfigStore,
};
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr};
use tokio::time::{interval, timeout};

/// Hub address assumed when the network stack cannot report one
pub const DEFAULT_HUB_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Joining,
    Joined,
    PortalActive,
}

/// Steady state reached by [`NetworkLifecycle::setup`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Joined { address: IpAddr },
    Portal { hub_address: IpAddr, hub_name: String },
}

pub struct NetworkLifecycle<N> {
    settings: DeviceSettings,
    timing: Timing,
    network: N,
    store: ConfigStore,
    diagnostics: Diagnostics,
    state: ConnectionState,
    credentials: NetworkCredentials,
}

impl<N: NetworkStack> NetworkLifecycle<N> {
    pub fn new(
        settings: DeviceSettings,
        timing: Timing,
        network: N,
        store: ConfigStore,
        diagnostics: Diagnostics,
    ) -> Self {
        let credentials = settings.fallback_credentials.clone();

        Self {
            settings,
            timing,
            network,
            store,
            diagnostics,
            state: ConnectionState::Disconnected,
            credentials,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Credentials used for the join attempt
    pub fn credentials(&self) -> &NetworkCredentials {
        &self.credentials
    }

    /// Drive the device into its steady state for this boot cycle
    ///
    /// Unusable storage and a join that does not yield an address within
    /// [`Timing::join_timeout`] both end up in [`Mode::Portal`].
    pub async fn setup(&mut self) -> Mode {
        if let Err(e) = self.store.mount() {
            self.diagnostics
                .error(format!("failed to mount storage: {e:#}"));
            self.state = ConnectionState::Joining;
            return self.start_portal().await;
        }

        if let Some(credentials) = self.store.load_credentials() {
            self.diagnostics
                .info(format!("Loaded WiFi config: {}", credentials.ssid));
            self.credentials = credentials;
        }

        self.state = ConnectionState::Joining;
        self.diagnostics
            .info(format!("Connecting with SSID: {}", self.credentials.ssid));

        match self.wait_for_address().await {
            Some(address) => {
                self.state = ConnectionState::Joined;
                self.diagnostics
                    .info(format!("Connected. IP address: {address}"));
                Mode::Joined { address }
            }
            None => self.start_portal().await,
        }
    }

    async fn wait_for_address(&self) -> Option<IpAddr> {
        let attempt = async {
            if self.credentials.ssid.is_empty() {
                self.diagnostics.warn("no network credentials configured");
            } else if let Err(e) = self.network.join(&self.credentials).await {
                self.diagnostics.warn(format!("join failed: {e:#}"));
            }

            let mut poll = interval(self.timing.join_poll);

            loop {
                poll.tick().await;

                match self.network.address().await {
                    Ok(Some(address)) => return address,
                    Ok(None) => debug!("no address yet"),
                    Err(e) => debug!("failed to get address: {e:#}"),
                }
            }
        };

        timeout(self.timing.join_timeout, attempt).await.ok()
    }

    async fn start_portal(&mut self) -> Mode {
        self.state = ConnectionState::PortalActive;
        self.diagnostics.warn("WiFi failed, starting AP mode...");

        let hub_name = match self.network.hardware_address().await {
            Ok(hardware_address) => hub_name(&self.settings.name, &hardware_address),
            Err(e) => {
                self.diagnostics
                    .error(format!("failed to get hardware address: {e:#}"));
                self.settings.name.clone()
            }
        };

        let hub_address = match self
            .network
            .start_hub(&hub_name, &self.settings.hub_passphrase)
            .await
        {
            Ok(address) => address,
            Err(e) => {
                self.diagnostics.error(format!("failed to start hub: {e:#}"));
                IpAddr::V4(DEFAULT_HUB_ADDRESS)
            }
        };

        info!("AP IP address: {hub_address}");

        Mode::Portal {
            hub_address,
            hub_name,
        }
    }
}

/// `<name> - <last six hex digits of the hardware address>`
pub fn hub_name(name: &str, hardware_address: &str) -> String {
    let digits: Vec<char> = hardware_address
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let suffix: String = digits[digits.len().saturating_sub(6)..].iter().collect();

    format!("{name} - {suffix}")
}
