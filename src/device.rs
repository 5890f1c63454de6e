//! Device loop
//!
//! [`DeviceLink::run`] drives one boot cycle: network setup, then either the
//! sync channel with update delivery or the captive portal, until a restart is
//! requested. The loop task is the only writer of sync state and hooks.

use crate::{
    api::{PortalApi, UpdateApi, run_portal_server, run_update_server},
    config::{DeviceSettings, Ports, Timing},
    diagnostics::{Diagnostics, DiagnosticsReceiver},
    dns,
    hooks::StateHooks,
    network_stack::NetworkStack,
    restart::{RestartHandle, RestartReason, RestartReceiver},
    services::{
        firmware::UPDATE_FILE_NAME,
        lifecycle::{DEFAULT_HUB_ADDRESS, Mode, NetworkLifecycle},
        storage::ConfigStore,
        sync::{SyncChannel, SyncEventReceiver, SyncHandle, mirror_pending},
    },
    sync_server,
};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use std::{net::IpAddr, path::PathBuf};
use tokio::net::{TcpListener, UdpSocket};

pub struct DeviceLink<N, H> {
    settings: DeviceSettings,
    timing: Timing,
    ports: Ports,
    storage_root: PathBuf,
    network: N,
    hooks: H,
    sync: SyncHandle,
    events: SyncEventReceiver,
}

/// Settings and channels shared by every part of one boot cycle
struct Session {
    settings: DeviceSettings,
    timing: Timing,
    ports: Ports,
    store: ConfigStore,
    restart: RestartHandle,
    restart_rx: RestartReceiver,
    diagnostics_rx: DiagnosticsReceiver,
}

impl<N, H> DeviceLink<N, H>
where
    N: NetworkStack,
    H: StateHooks,
{
    pub fn new(settings: DeviceSettings, network: N, hooks: H) -> Self {
        let (sync, events) = SyncHandle::channel();

        Self {
            settings,
            timing: Timing::default(),
            ports: Ports::default(),
            storage_root: PathBuf::from("/data"),
            network,
            hooks,
            sync,
            events,
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_ports(mut self, ports: Ports) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Handle for host triggered broadcasts
    pub fn sync_handle(&self) -> SyncHandle {
        self.sync.clone()
    }

    /// Run one boot cycle
    ///
    /// # Returns
    /// Why the device has to restart, or an error if a server stopped
    pub async fn run(self) -> Result<RestartReason> {
        let (diagnostics, diagnostics_rx) = Diagnostics::channel();
        let (restart, restart_rx) = RestartHandle::channel();
        let store = ConfigStore::new(&self.storage_root, diagnostics.clone());

        let mut lifecycle = NetworkLifecycle::new(
            self.settings.clone(),
            self.timing,
            self.network,
            store.clone(),
            diagnostics,
        );

        let mode = lifecycle.setup().await;
        info!("connection state: {:?}", lifecycle.state());

        let session = Session {
            settings: self.settings,
            timing: self.timing,
            ports: self.ports,
            store,
            restart,
            restart_rx,
            diagnostics_rx,
        };

        match mode {
            Mode::Joined { address } => {
                Self::run_joined(session, self.hooks, self.sync, self.events, address).await
            }
            Mode::Portal {
                hub_address,
                hub_name,
            } => {
                info!("serving setup portal on hub {hub_name}");
                Self::run_portal(session, hub_address).await
            }
        }
    }

    async fn run_joined(
        mut session: Session,
        hooks: H,
        sync: SyncHandle,
        mut events: SyncEventReceiver,
        address: IpAddr,
    ) -> Result<RestartReason> {
        let listener = TcpListener::bind(("0.0.0.0", session.ports.sync))
            .await
            .context("failed to bind sync channel")?;
        let mut sync_task = tokio::spawn(sync_server::serve(listener, sync));

        let update_api = UpdateApi::new(
            session.store.resolve(UPDATE_FILE_NAME),
            session.restart.clone(),
            session.timing.restart_grace,
        );
        let (update_handle, mut update_task) =
            run_update_server(update_api, session.ports.update)?;

        let mut channel = SyncChannel::new(
            hooks,
            session.store.clone(),
            session.restart.clone(),
            address,
            session.settings.state_doc_size,
        );
        channel.restore_persisted_state();

        let outcome = loop {
            tokio::select! {
                Some(reason) = session.restart_rx.recv() => break Ok(reason),
                Some(event) = events.recv() => channel.handle(event),
                Some(message) = session.diagnostics_rx.recv() => {
                    channel.mirror(&message);
                    mirror_pending(&channel, &mut session.diagnostics_rx);
                }
                result = &mut sync_task => {
                    break Err(anyhow!("sync channel stopped: {result:?}"));
                }
                result = &mut update_task => {
                    break Err(anyhow!("update server stopped: {result:?}"));
                }
            }
        };

        debug!("stopping joined mode");
        update_handle.stop(true).await;
        sync_task.abort();

        outcome
    }

    async fn run_portal(mut session: Session, hub_address: IpAddr) -> Result<RestartReason> {
        let api = PortalApi::new(
            session.store.clone(),
            session.restart.clone(),
            hub_address,
            session.settings.advertised_name(),
            session.timing.restart_grace,
        );
        let (portal_handle, mut portal_task) = run_portal_server(api, session.ports.portal)?;

        let dns_address = match hub_address {
            IpAddr::V4(address) => address,
            IpAddr::V6(_) => DEFAULT_HUB_ADDRESS,
        };
        let socket = UdpSocket::bind(("0.0.0.0", session.ports.dns))
            .await
            .context("failed to bind dns responder")?;
        let mut dns_task = tokio::spawn(dns::serve(socket, dns_address));

        let outcome = loop {
            tokio::select! {
                Some(reason) = session.restart_rx.recv() => break Ok(reason),
                // nobody observes diagnostics while the portal is active
                Some(_) = session.diagnostics_rx.recv() => {}
                result = &mut portal_task => {
                    break Err(anyhow!("portal server stopped: {result:?}"));
                }
                result = &mut dns_task => {
                    break Err(anyhow!("dns responder stopped: {result:?}"));
                }
            }
        };

        debug!("stopping portal mode");
        portal_handle.stop(true).await;
        dns_task.abort();

        outcome
    }
}
