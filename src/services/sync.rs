//! State sync channel
//!
//! Pushes the full state document to the single observer on connect and after
//! every accepted mutation, and applies inbound mutation frames. The channel is
//! transport agnostic: connections show up as [`SyncEvent`]s and outbound
//! frames leave through the observer's [`OutboundFrame`] sink.

use crate::{
    diagnostics::DiagnosticsReceiver,
    document::StateDocument,
    hooks::StateHooks,
    restart::{RestartHandle, RestartReason},
    services::storage::ConfigStore,
};
use log::{Level, debug, info};
use std::net::IpAddr;
use tokio::sync::mpsc;

/// Frame that restarts the device instead of being parsed
pub const REBOOT_COMMAND: &str = "reboot";
/// Prefix of diagnostic frames
pub const LOG_PREFIX: &str = "log:";

pub type ObserverId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObserverLink {
    Connected,
    Disconnected,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

pub type ObserverSink = mpsc::UnboundedSender<OutboundFrame>;

#[derive(Debug)]
pub enum SyncEvent {
    Connected { id: ObserverId, sink: ObserverSink },
    Disconnected { id: ObserverId },
    Text { id: ObserverId, payload: String },
    /// Binary frames, pings and other non-text socket events
    Other { id: ObserverId, description: String },
    BroadcastRequested,
}

pub type SyncEventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Cloneable entry point into the device loop
#[derive(Clone, Debug)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncHandle {
    pub fn channel() -> (Self, SyncEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Re-broadcast the current state without a preceding mutation
    pub fn request_broadcast(&self) {
        self.send(SyncEvent::BroadcastRequested);
    }

    /// Forward a transport event; returns `false` once the device loop is gone
    pub fn send(&self, event: SyncEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

struct Observer {
    id: ObserverId,
    sink: ObserverSink,
}

pub struct SyncChannel<H> {
    hooks: H,
    store: ConfigStore,
    restart: RestartHandle,
    address: IpAddr,
    budget: usize,
    observer: Option<Observer>,
}

impl<H: StateHooks> SyncChannel<H> {
    pub fn new(
        hooks: H,
        store: ConfigStore,
        restart: RestartHandle,
        address: IpAddr,
        budget: usize,
    ) -> Self {
        Self {
            hooks,
            store,
            restart,
            address,
            budget,
            observer: None,
        }
    }

    pub fn link(&self) -> ObserverLink {
        match self.observer {
            Some(_) => ObserverLink::Connected,
            None => ObserverLink::Disconnected,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn handle(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Connected { id, sink } => self.on_observer_connected(id, sink),
            SyncEvent::Disconnected { id } => self.on_observer_disconnected(id),
            SyncEvent::Text { id, payload } => {
                if self.is_current(id) {
                    self.on_mutation_received(&payload);
                } else {
                    debug!("ignoring frame of superseded observer {id}");
                }
            }
            SyncEvent::Other { id, description } => {
                if self.is_current(id) {
                    self.diagnose(Level::Debug, format!("Socket event: {description}"));
                }
            }
            SyncEvent::BroadcastRequested => self.request_broadcast(),
        }
    }

    fn is_current(&self, id: ObserverId) -> bool {
        self.observer.as_ref().is_some_and(|observer| observer.id == id)
    }

    /// Hand the persisted state to the host application
    pub fn restore_persisted_state(&mut self) {
        let Some(mut document) = self.store.load_state(self.budget) else {
            self.diagnose(Level::Info, "No config file");
            return;
        };

        document.strip_address();
        self.hooks.on_state_mutation_proposed(&document);
        self.diagnose(Level::Info, "State model loaded from storage");
    }

    pub fn on_observer_connected(&mut self, id: ObserverId, sink: ObserverSink) {
        let previous = self.observer.replace(Observer { id, sink });

        match previous {
            Some(previous) => {
                info!("observer {} superseded by {id}", previous.id);
                let _ = previous.sink.send(OutboundFrame::Close);
            }
            None => self.hooks.on_connectivity_changed(true),
        }

        self.diagnose(Level::Info, "Device connected");
        self.broadcast();
    }

    pub fn on_observer_disconnected(&mut self, id: ObserverId) {
        if !self.is_current(id) {
            debug!("superseded observer {id} disconnected");
            return;
        }

        self.observer = None;
        self.diagnose(Level::Info, "Device disconnected");
        self.hooks.on_connectivity_changed(false);
    }

    pub fn on_mutation_received(&mut self, payload: &str) {
        if payload == REBOOT_COMMAND {
            self.restart.request(RestartReason::RebootCommand);
            return;
        }

        let mut document = match StateDocument::parse(payload.as_bytes(), self.budget) {
            Ok(document) => document,
            Err(e) => {
                self.diagnose(
                    Level::Warn,
                    format!("State JSON deserialization error: {e:#}"),
                );
                return;
            }
        };

        document.strip_address();

        if !self.hooks.on_state_mutation_proposed(&document) {
            debug!("mutation left state unchanged");
            return;
        }

        self.persist(&document);
        self.broadcast();
    }

    pub fn request_broadcast(&mut self) {
        self.broadcast();
    }

    /// Mirror an already logged diagnostic to the observer
    pub fn mirror(&self, message: &str) {
        self.send(format!("{LOG_PREFIX}{message}"));
    }

    fn diagnose(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{message}");
        self.mirror(&message);
    }

    fn persist(&self, accepted: &StateDocument) {
        match self.store.save_state(accepted, self.budget) {
            Ok(size) => {
                self.diagnose(Level::Info, format!("Saving state to storage. Size = {size}"))
            }
            Err(e) => self.diagnose(Level::Error, format!("failed to save state: {e:#}")),
        }
    }

    fn broadcast(&mut self) {
        if self.observer.is_none() {
            return;
        }

        let mut document = StateDocument::new();
        document.set_address(self.address);
        self.hooks.on_broadcast_prepare(&mut document);

        // the budget bounds the application fields, not the injected address
        let mut fields = document.clone();
        fields.strip_address();
        if let Err(e) = fields.to_json(self.budget) {
            self.diagnose(Level::Error, format!("failed to broadcast state: {e:#}"));
            return;
        }

        document.set_address(self.address);
        match document.to_pretty_json() {
            Ok(json) => self.send(json),
            Err(e) => self.diagnose(Level::Error, format!("failed to broadcast state: {e:#}")),
        }
    }

    fn send(&self, frame: String) {
        let Some(observer) = &self.observer else {
            return;
        };

        if observer.sink.send(OutboundFrame::Text(frame)).is_err() {
            debug!("observer {} is gone", observer.id);
        }
    }
}

/// Forward every queued diagnostic to the observer
pub fn mirror_pending<H: StateHooks>(
    sync: &SyncChannel<H>,
    diagnostics: &mut DiagnosticsReceiver,
) {
    while let Ok(message) = diagnostics.try_recv() {
        sync.mirror(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::Diagnostics,
        hooks::MergeStateHooks,
        restart::RestartReceiver,
        services::storage::STATE_DOCUMENT_PATH,
    };
    use std::{fs, net::Ipv4Addr};
    use tempfile::TempDir;

    const ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

    #[derive(Default)]
    struct RecordingHooks {
        inner: MergeStateHooks,
        proposed: Vec<StateDocument>,
        connectivity: Vec<bool>,
    }

    impl StateHooks for RecordingHooks {
        fn on_connectivity_changed(&mut self, connected: bool) {
            self.connectivity.push(connected);
        }

        fn on_state_mutation_proposed(&mut self, document: &StateDocument) -> bool {
            self.proposed.push(document.clone());
            self.inner.on_state_mutation_proposed(document)
        }

        fn on_broadcast_prepare(&mut self, document: &mut StateDocument) {
            self.inner.on_broadcast_prepare(document);
        }
    }

    struct Fixture {
        _dir: TempDir,
        sync: SyncChannel<RecordingHooks>,
        restart_rx: RestartReceiver,
    }

    fn fixture(budget: usize) -> Fixture {
        let dir = TempDir::new().expect("failed to create temp directory");
        let (diagnostics, _) = Diagnostics::channel();
        let store = ConfigStore::new(dir.path(), diagnostics);
        let (restart, restart_rx) = RestartHandle::channel();

        Fixture {
            sync: SyncChannel::new(RecordingHooks::default(), store, restart, ADDRESS, budget),
            _dir: dir,
            restart_rx,
        }
    }

    fn connect(
        sync: &mut SyncChannel<RecordingHooks>,
        id: ObserverId,
    ) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (sink, rx) = mpsc::unbounded_channel();
        sync.on_observer_connected(id, sink);
        rx
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut frames = vec![];
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn state_frames(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<StateDocument> {
        frames(rx)
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Text(text) if !text.starts_with(LOG_PREFIX) => {
                    Some(StateDocument::parse(text.as_bytes(), 4096).unwrap())
                }
                _ => None,
            })
            .collect()
    }

    mod connect {
        use super::*;

        #[test]
        fn pushes_state_with_address_on_connect() {
            let mut f = fixture(1024);
            let mut rx = connect(&mut f.sync, 1);

            let states = state_frames(&mut rx);
            assert_eq!(states.len(), 1);
            assert_eq!(states[0].address(), Some("192.168.1.50"));
            assert_eq!(f.sync.link(), ObserverLink::Connected);
            assert_eq!(f.sync.hooks().connectivity, vec![true]);
        }

        #[test]
        fn emits_connected_log_frame() {
            let mut f = fixture(1024);
            let mut rx = connect(&mut f.sync, 1);

            assert!(
                frames(&mut rx).contains(&OutboundFrame::Text("log:Device connected".to_string()))
            );
        }

        #[test]
        fn newer_observer_supersedes_current_one() {
            let mut f = fixture(1024);
            let mut first = connect(&mut f.sync, 1);
            let mut second = connect(&mut f.sync, 2);

            assert!(frames(&mut first).contains(&OutboundFrame::Close));
            assert_eq!(state_frames(&mut second).len(), 1);
            assert_eq!(f.sync.hooks().connectivity, vec![true]);

            f.sync.on_observer_disconnected(1);
            assert_eq!(f.sync.link(), ObserverLink::Connected);

            f.sync.on_observer_disconnected(2);
            assert_eq!(f.sync.link(), ObserverLink::Disconnected);
            assert_eq!(f.sync.hooks().connectivity, vec![true, false]);
        }
    }

    mod mutation {
        use super::*;

        #[test]
        fn accepted_mutation_is_persisted_and_broadcast() {
            let mut f = fixture(1024);
            let mut rx = connect(&mut f.sync, 1);
            frames(&mut rx);

            f.sync.on_mutation_received(r#"{"led":true}"#);

            let states = state_frames(&mut rx);
            assert_eq!(states.len(), 1);
            assert_eq!(states[0].get("led"), Some(&serde_json::json!(true)));

            let persisted = fs::read_to_string(f.sync.store.resolve(STATE_DOCUMENT_PATH)).unwrap();
            assert_eq!(persisted, r#"{"led":true}"#);
        }

        #[test]
        fn repeated_mutation_is_a_no_op() {
            let mut f = fixture(1024);
            let mut rx = connect(&mut f.sync, 1);
            frames(&mut rx);

            f.sync.on_mutation_received(r#"{"led":true}"#);
            assert_eq!(state_frames(&mut rx).len(), 1);

            let file = f.sync.store.resolve(STATE_DOCUMENT_PATH);
            fs::remove_file(&file).unwrap();

            f.sync.on_mutation_received(r#"{"led":true}"#);
            assert!(frames(&mut rx).is_empty());
            assert!(!file.exists());
        }

        #[test]
        fn address_field_never_reaches_hooks() {
            let mut f = fixture(1024);
            f.sync.on_mutation_received(r#"{"ip":"6.6.6.6","led":false}"#);

            let proposed = &f.sync.hooks().proposed;
            assert_eq!(proposed.len(), 1);
            assert_eq!(proposed[0].address(), None);
            assert_eq!(proposed[0].get("led"), Some(&serde_json::json!(false)));
        }

        #[test]
        fn malformed_payload_is_reported_only() {
            let mut f = fixture(1024);
            let mut rx = connect(&mut f.sync, 1);
            frames(&mut rx);

            f.sync.on_mutation_received("{not json");

            let frames = frames(&mut rx);
            assert_eq!(frames.len(), 1);
            let OutboundFrame::Text(text) = &frames[0] else {
                panic!("expected a text frame");
            };
            assert!(text.starts_with("log:State JSON deserialization error"));
            assert!(f.sync.hooks().proposed.is_empty());
        }

        #[test]
        fn oversized_payload_never_reaches_hooks() {
            let mut f = fixture(32);
            let payload = format!(r#"{{"name":"{}"}}"#, "x".repeat(40));

            f.sync.on_mutation_received(&payload);

            assert!(f.sync.hooks().proposed.is_empty());
        }

        #[test]
        fn each_save_holds_only_the_accepted_document() {
            let mut f = fixture(40);
            let mut rx = connect(&mut f.sync, 1);
            frames(&mut rx);

            f.sync.on_mutation_received(r#"{"aaaaaaaaaaaaaaaa":1}"#);
            f.sync.on_mutation_received(r#"{"bbbbbbbbbbbbbbbb":2}"#);

            let persisted = fs::read_to_string(f.sync.store.resolve(STATE_DOCUMENT_PATH)).unwrap();
            assert_eq!(persisted, r#"{"bbbbbbbbbbbbbbbb":2}"#);
            assert!(!frames(&mut rx).iter().any(|frame| matches!(
                frame,
                OutboundFrame::Text(text) if text.starts_with("log:failed to save state")
            )));
        }
    }

    mod reboot {
        use super::*;

        #[test]
        fn reboot_frame_requests_restart_without_parsing() {
            let mut f = fixture(1024);
            f.sync.on_mutation_received(REBOOT_COMMAND);

            assert_eq!(f.restart_rx.try_recv().unwrap(), RestartReason::RebootCommand);
            assert!(f.sync.hooks().proposed.is_empty());
        }

        #[test]
        fn quoted_reboot_is_a_document_attempt() {
            let mut f = fixture(1024);
            f.sync.on_mutation_received("\"reboot\"");

            assert!(f.restart_rx.try_recv().is_err());
        }
    }

    mod broadcast {
        use super::*;

        #[test]
        fn injected_address_wins_over_application_field() {
            let mut f = fixture(1024);
            f.sync.hooks.inner.on_state_mutation_proposed(
                &StateDocument::parse(br#"{"ip":"10.0.0.9"}"#, 64).unwrap(),
            );
            let mut rx = connect(&mut f.sync, 1);

            let states = state_frames(&mut rx);
            assert_eq!(states[0].address(), Some("192.168.1.50"));
        }

        #[test]
        fn document_near_budget_is_broadcast_with_address() {
            let payloads = [
                r#"{"a":1,"b":2,"c":3,"d":4,"e":5}"#.to_string(),
                format!(r#"{{"name":"{}"}}"#, "x".repeat(53)),
            ];

            for payload in payloads {
                let mut f = fixture(64);
                let mut rx = connect(&mut f.sync, 1);
                frames(&mut rx);

                f.sync.on_mutation_received(&payload);

                let frames = frames(&mut rx);
                assert!(!frames.iter().any(|frame| matches!(
                    frame,
                    OutboundFrame::Text(text) if text.starts_with("log:failed")
                )));

                let states: Vec<_> = frames
                    .iter()
                    .filter_map(|frame| match frame {
                        OutboundFrame::Text(text) if !text.starts_with(LOG_PREFIX) => {
                            Some(StateDocument::parse(text.as_bytes(), 4096).unwrap())
                        }
                        _ => None,
                    })
                    .collect();
                assert_eq!(states.len(), 1, "{payload}");
                assert_eq!(states[0].address(), Some("192.168.1.50"));

                let mut fields = states[0].clone();
                fields.strip_address();
                assert_eq!(fields.to_json(64).unwrap(), payload);
            }
        }

        #[test]
        fn oversized_host_state_is_not_broadcast() {
            let mut f = fixture(32);
            let payload = format!(r#"{{"name":"{}"}}"#, "x".repeat(40));
            let state = StateDocument::parse(payload.as_bytes(), 1024).unwrap();
            f.sync.hooks.inner.on_state_mutation_proposed(&state);
            let mut rx = connect(&mut f.sync, 1);

            let frames = frames(&mut rx);
            assert!(frames.iter().all(|frame| matches!(
                frame,
                OutboundFrame::Text(text) if text.starts_with(LOG_PREFIX)
            )));
            assert!(frames.iter().any(|frame| matches!(
                frame,
                OutboundFrame::Text(text) if text.starts_with("log:failed to broadcast state")
            )));
        }

        #[test]
        fn nothing_is_sent_without_observer() {
            let mut f = fixture(1024);
            f.sync.request_broadcast();
            f.sync.on_mutation_received(r#"{"led":true}"#);
            assert_eq!(f.sync.link(), ObserverLink::Disconnected);
        }

        #[test]
        fn requested_broadcast_resends_state() {
            let mut f = fixture(1024);
            let mut rx = connect(&mut f.sync, 1);
            frames(&mut rx);

            f.sync.handle(SyncEvent::BroadcastRequested);
            assert_eq!(state_frames(&mut rx).len(), 1);
        }

        #[test]
        fn mirrored_diagnostics_carry_log_prefix() {
            let mut f = fixture(1024);
            let mut rx = connect(&mut f.sync, 1);
            frames(&mut rx);

            let (diagnostics, mut diagnostics_rx) = Diagnostics::channel();
            diagnostics.warn("storage is slow");
            mirror_pending(&f.sync, &mut diagnostics_rx);

            assert_eq!(
                frames(&mut rx),
                vec![OutboundFrame::Text("log:storage is slow".to_string())]
            );
        }
    }

    #[test]
    fn restore_hands_persisted_state_to_hooks() {
        let mut f = fixture(1024);
        fs::write(
            f.sync.store.resolve(STATE_DOCUMENT_PATH),
            r#"{"led":true,"ip":"1.1.1.1"}"#,
        )
        .unwrap();

        f.sync.restore_persisted_state();

        let proposed = &f.sync.hooks().proposed;
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].address(), None);
        assert_eq!(proposed[0].get("led"), Some(&serde_json::json!(true)));
    }
}
