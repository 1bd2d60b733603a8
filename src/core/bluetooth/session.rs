//! Per-device session state machine
//! `SessionRegistry` owns one `DeviceSession` per serial and decides, for every
//! observation, user request and link outcome, which link operations to issue
//! and which events to publish. It performs no I/O itself.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::advertisement::DeviceStatus;
use crate::core::bluetooth::protocol::{
    ProbeCommand, WifiConfig, decode_power_status, decode_wifi_info,
};
use crate::core::bluetooth::transport::{InfoProperties, ProbeLink, ServiceGroup};
use crate::core::error::CoreError;
use crate::core::events::CoreEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Seen in an advertisement, no link
    Discovered,
    Connecting,
    /// Linked, but attribute discovery was not started (or was abandoned)
    Connected,
    DiscoveringAttributes,
    /// Every discovered group is subscribed or read
    Ready,
    Disconnected,
}

/// Operation to run on a session's link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Connect,
    DiscoverServices(Vec<ServiceGroup>),
    DiscoverCharacteristics(ServiceGroup),
    Subscribe(ServiceGroup),
    Read(ServiceGroup),
    Write(ServiceGroup, Vec<u8>),
}

/// A link operation bound to the session and connection attempt that issued it
pub struct PendingOp {
    pub serial: String,
    pub attempt: u64,
    pub link: Arc<dyn ProbeLink>,
    pub op: LinkOp,
    /// Cancelled when the session starts over or is dropped
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStage {
    Connect,
    ServiceDiscovery,
    CharacteristicDiscovery(ServiceGroup),
    Subscribe(ServiceGroup),
    Notify(ServiceGroup),
    Read(ServiceGroup),
    Write(ServiceGroup),
}

impl fmt::Display for LinkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::ServiceDiscovery => write!(f, "service discovery"),
            Self::CharacteristicDiscovery(group) => write!(f, "{} characteristic discovery", group),
            Self::Subscribe(group) => write!(f, "{} subscribe", group),
            Self::Notify(group) => write!(f, "{} notification", group),
            Self::Read(group) => write!(f, "{} read", group),
            Self::Write(group) => write!(f, "{} write", group),
        }
    }
}

/// Result of a link operation, fed back into the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Connected,
    ServicesDiscovered(Vec<ServiceGroup>),
    CharacteristicsDiscovered(ServiceGroup, InfoProperties),
    Subscribed(ServiceGroup),
    Value(ServiceGroup, Vec<u8>),
    Written(ServiceGroup),
    Failed(LinkStage, String),
    /// The device is no longer connected
    Lost,
}

/// Configuration change requested for the selected scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    Wifi {
        wifi_direct: bool,
        ssid: Option<String>,
        password: Option<String>,
    },
    Power(bool),
    TogglePower,
}

/// What the caller has to do after a registry call
#[derive(Default)]
pub struct Effects {
    pub ops: Vec<PendingOp>,
    pub events: Vec<CoreEvent>,
}

impl Effects {
    fn report(&mut self, err: CoreError) {
        warn!("{}", err);
        self.events.push(CoreEvent::from(&err));
    }
}

pub struct DeviceSession {
    serial: String,
    link: Arc<dyn ProbeLink>,
    state: SessionState,
    /// Incremented on every connect so outcomes of older attempts can be told apart
    attempt: u64,
    last_status: DeviceStatus,
    last_powered_on: Option<bool>,
    last_wifi_info: Option<WifiConfig>,
    /// Groups whose characteristic discovery has not completed
    pending_groups: BTreeSet<ServiceGroup>,
    /// Groups whose characteristics are known, so requests may be written
    discovered_groups: BTreeSet<ServiceGroup>,
    /// Groups whose characteristic discovery failed in this round
    failed_groups: BTreeSet<ServiceGroup>,
    last_seen: u64,
    /// Shared by every task of the current round of link operations
    cancel: CancellationToken,
}

impl DeviceSession {
    fn new(
        status: DeviceStatus,
        link: Arc<dyn ProbeLink>,
        seen: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            serial: status.serial.clone(),
            link,
            state: SessionState::Discovered,
            attempt: 0,
            last_status: status,
            last_powered_on: None,
            last_wifi_info: None,
            pending_groups: BTreeSet::new(),
            discovered_groups: BTreeSet::new(),
            failed_groups: BTreeSet::new(),
            last_seen: seen,
            cancel,
        }
    }

    fn op(&self, op: LinkOp) -> PendingOp {
        PendingOp {
            serial: self.serial.clone(),
            attempt: self.attempt,
            link: self.link.clone(),
            op,
            cancel: self.cancel.clone(),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("Scanner {}: {:?} -> {:?}", self.serial, self.state, state);
            self.state = state;
        }
    }

    /// Stops the tasks of the previous round (forwarders included) and starts a new one.
    fn renew_cancel(&mut self, root: &CancellationToken) {
        self.cancel.cancel();
        self.cancel = root.child_token();
    }

    fn begin_connect(&mut self, root: &CancellationToken) -> PendingOp {
        self.renew_cancel(root);
        self.attempt += 1;
        self.pending_groups.clear();
        self.discovered_groups.clear();
        self.failed_groups.clear();
        self.set_state(SessionState::Connecting);
        self.op(LinkOp::Connect)
    }

    fn begin_discovery(&mut self, root: &CancellationToken) -> PendingOp {
        self.renew_cancel(root);
        self.pending_groups = ServiceGroup::ALL.into_iter().collect();
        self.discovered_groups.clear();
        self.failed_groups.clear();
        self.set_state(SessionState::DiscoveringAttributes);
        self.op(LinkOp::DiscoverServices(ServiceGroup::ALL.to_vec()))
    }

    /// Discovery started but nothing is left in flight
    fn discovery_stalled(&self) -> bool {
        self.state == SessionState::DiscoveringAttributes && self.pending_groups.is_empty()
    }

    /// Moves to `Ready` once every found group is discovered and none failed.
    fn finish_discovery(&mut self) -> bool {
        if self.state == SessionState::DiscoveringAttributes
            && self.pending_groups.is_empty()
            && self.failed_groups.is_empty()
            && !self.discovered_groups.is_empty()
        {
            self.set_state(SessionState::Ready);
            return true;
        }
        false
    }

    fn snapshot(&self, selected: bool) -> SessionSnapshot {
        SessionSnapshot {
            serial: self.serial.clone(),
            state: self.state,
            attempt: self.attempt,
            status: self.last_status.clone(),
            powered_on: self.last_powered_on,
            wifi: self.last_wifi_info.clone(),
            discovered_groups: self.discovered_groups.iter().copied().collect(),
            selected,
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub serial: String,
    pub state: SessionState,
    pub attempt: u64,
    pub status: DeviceStatus,
    pub powered_on: Option<bool>,
    pub wifi: Option<WifiConfig>,
    pub discovered_groups: Vec<ServiceGroup>,
    pub selected: bool,
}

/// All sessions known to this process, plus the active selection
pub struct SessionRegistry {
    sessions: HashMap<String, DeviceSession>,
    selected: Option<String>,
    /// Optional capacity; `None` keeps every session for the life of the process
    max_sessions: Option<usize>,
    sequence: u64,
    /// Parent of every session's cancellation token
    root: CancellationToken,
}

impl SessionRegistry {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: HashMap::new(),
            selected: None,
            max_sessions,
            sequence: 0,
            root: CancellationToken::new(),
        }
    }

    /// Cancels every link task of every session.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn known_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.sessions.keys().cloned().collect();
        serials.sort();
        serials
    }

    pub fn snapshot(&self, serial: &str) -> Option<SessionSnapshot> {
        self.sessions
            .get(serial)
            .map(|session| session.snapshot(self.selected() == Some(serial)))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Records an advertisement. The first sighting of a serial creates its
    /// session with the given link; later sightings only refresh the status.
    pub fn observe(&mut self, status: DeviceStatus, link: Arc<dyn ProbeLink>) -> Effects {
        let mut effects = Effects::default();
        self.sequence += 1;
        let seen = self.sequence;

        match self.sessions.get_mut(&status.serial) {
            Some(session) => {
                session.last_status = status.clone();
                session.last_seen = seen;
            }
            None => {
                if !self.make_room() {
                    warn!(
                        "Session capacity reached, ignoring scanner {}",
                        status.serial
                    );
                    return effects;
                }
                info!("New scanner {} found (device {})", status.serial, link.id());
                self.sessions.insert(
                    status.serial.clone(),
                    DeviceSession::new(status.clone(), link, seen, self.root.child_token()),
                );
            }
        }

        effects.events.push(CoreEvent::DeviceObserved(status));
        effects
    }

    /// Evicts the least recently seen idle session when at capacity.
    fn make_room(&mut self) -> bool {
        let Some(limit) = self.max_sessions else {
            return true;
        };
        if self.sessions.len() < limit {
            return true;
        }
        let victim = self
            .sessions
            .values()
            .filter(|session| self.selected() != Some(session.serial.as_str()))
            .filter(|session| {
                matches!(
                    session.state,
                    SessionState::Discovered | SessionState::Disconnected
                )
            })
            .min_by_key(|session| session.last_seen)
            .map(|session| session.serial.clone());

        match victim {
            Some(serial) => {
                info!("Evicting idle scanner {} to make room", serial);
                if let Some(session) = self.sessions.remove(&serial) {
                    session.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Makes `serial` the active selection and starts connecting if needed.
    pub fn select(&mut self, serial: &str) -> Result<Effects, CoreError> {
        let session = self
            .sessions
            .get_mut(serial)
            .ok_or_else(|| CoreError::NotDiscovered(serial.to_string()))?;
        self.selected = Some(serial.to_string());

        let mut effects = Effects::default();
        match session.state {
            SessionState::Discovered | SessionState::Disconnected => {
                effects.ops.push(session.begin_connect(&self.root));
            }
            SessionState::Connected => {
                effects.ops.push(session.begin_discovery(&self.root));
            }
            _ if session.discovery_stalled() => {
                effects.ops.push(session.begin_discovery(&self.root));
            }
            state => debug!("Scanner {} selected while {:?}", serial, state),
        }
        Ok(effects)
    }

    /// Clears the selection; links stay as they are.
    pub fn deselect(&mut self) {
        if let Some(serial) = self.selected.take() {
            info!("Scanner {} deselected", serial);
        }
    }

    /// Validates a configuration change for the selected scanner and issues the write.
    pub fn request(&mut self, request: WriteRequest) -> Result<Effects, CoreError> {
        let serial = self.selected.clone().ok_or(CoreError::NoSelection)?;
        let session = self
            .sessions
            .get(&serial)
            .ok_or_else(|| CoreError::NotDiscovered(serial.clone()))?;

        let command = match request {
            WriteRequest::Wifi { wifi_direct: true, .. } => ProbeCommand::WifiDirect,
            WriteRequest::Wifi {
                wifi_direct: false,
                ssid: Some(ssid),
                password: Some(password),
            } if !ssid.is_empty() => ProbeCommand::JoinNetwork { ssid, password },
            WriteRequest::Wifi { .. } => {
                return Err(CoreError::InvalidRequest(
                    "joining a network needs both an SSID and a password".to_string(),
                ));
            }
            WriteRequest::Power(on) => ProbeCommand::Power(on),
            // Unknown power state counts as off, so the toggle powers on.
            WriteRequest::TogglePower => {
                ProbeCommand::Power(!session.last_powered_on.unwrap_or(false))
            }
        };

        let group = command.group();
        if !session.discovered_groups.contains(&group) {
            return Err(CoreError::CharacteristicUnavailable { serial, group });
        }
        let data = command.to_bytes().ok_or_else(|| {
            CoreError::InvalidRequest(format!("failed to format {:?}", command))
        })?;

        info!("Sending {:?} to scanner {}", command, serial);
        let mut effects = Effects::default();
        effects.ops.push(session.op(LinkOp::Write(group, data)));
        Ok(effects)
    }

    /// Applies the outcome of a link operation.
    pub fn on_link_outcome(&mut self, serial: &str, attempt: u64, outcome: LinkOutcome) -> Effects {
        let mut effects = Effects::default();
        let is_selected = self.selected() == Some(serial);
        let Some(session) = self.sessions.get_mut(serial) else {
            debug!("Outcome for unknown scanner {}: {:?}", serial, outcome);
            return effects;
        };
        if session.attempt != attempt {
            debug!(
                "Ignoring outcome of stale attempt {} for {} (current {})",
                attempt, serial, session.attempt
            );
            return effects;
        }

        match outcome {
            LinkOutcome::Connected => {
                if session.state != SessionState::Connecting {
                    debug!("Scanner {} connected while {:?}", serial, session.state);
                } else if is_selected {
                    effects.ops.push(session.begin_discovery(&self.root));
                } else {
                    // Selection moved on; keep the link but go no further.
                    info!("Scanner {} connected but is no longer selected", serial);
                    session.set_state(SessionState::Connected);
                }
            }
            LinkOutcome::ServicesDiscovered(groups) => {
                if session.state != SessionState::DiscoveringAttributes {
                    debug!("Services for {} arrived while {:?}", serial, session.state);
                } else if !is_selected {
                    info!("Scanner {} is no longer selected, abandoning discovery", serial);
                    session.pending_groups.clear();
                    session.set_state(SessionState::Connected);
                } else if groups.is_empty() {
                    session.pending_groups.clear();
                    effects.report(CoreError::Transport(format!(
                        "Scanner {} has neither the Wi-Fi nor the power service",
                        serial
                    )));
                } else {
                    session.pending_groups = groups.iter().copied().collect();
                    for group in groups {
                        effects
                            .ops
                            .push(session.op(LinkOp::DiscoverCharacteristics(group)));
                    }
                }
            }
            LinkOutcome::CharacteristicsDiscovered(group, properties) => {
                session.pending_groups.remove(&group);
                session.discovered_groups.insert(group);
                if properties.notify {
                    effects.ops.push(session.op(LinkOp::Subscribe(group)));
                }
                if properties.read {
                    effects.ops.push(session.op(LinkOp::Read(group)));
                }
                if session.finish_discovery() {
                    effects.events.push(CoreEvent::SessionReady {
                        serial: serial.to_string(),
                    });
                }
            }
            LinkOutcome::Subscribed(group) => {
                debug!("Subscribed to {} info of {}", group, serial);
            }
            LinkOutcome::Value(ServiceGroup::Wifi, value) => match decode_wifi_info(&value) {
                Some(wifi) => {
                    session.last_wifi_info = Some(wifi.clone());
                    effects.events.push(CoreEvent::ConfigurationUpdated {
                        serial: serial.to_string(),
                        wifi,
                    });
                }
                None => effects.report(CoreError::ProtocolDecode(format!(
                    "unreadable Wi-Fi info from {}",
                    serial
                ))),
            },
            LinkOutcome::Value(ServiceGroup::Power, value) => match decode_power_status(&value) {
                Some(powered) => {
                    session.last_powered_on = Some(powered);
                    effects.events.push(CoreEvent::PowerUpdated {
                        serial: serial.to_string(),
                        powered,
                    });
                }
                None => effects.report(CoreError::ProtocolDecode(format!(
                    "empty power status from {}",
                    serial
                ))),
            },
            LinkOutcome::Written(group) => {
                info!("{} request delivered to {}", group, serial);
            }
            LinkOutcome::Failed(stage, message) => {
                match stage {
                    LinkStage::Connect => session.set_state(SessionState::Disconnected),
                    LinkStage::ServiceDiscovery => session.pending_groups.clear(),
                    LinkStage::CharacteristicDiscovery(group) => {
                        session.pending_groups.remove(&group);
                        session.failed_groups.insert(group);
                    }
                    _ => {}
                }
                effects.report(CoreError::Transport(format!(
                    "{} failed for {}: {}",
                    stage, serial, message
                )));
            }
            LinkOutcome::Lost => {
                if session.state != SessionState::Disconnected {
                    info!("Lost connection to scanner {}", serial);
                    session.cancel.cancel();
                    session.pending_groups.clear();
                    session.discovered_groups.clear();
                    session.failed_groups.clear();
                    session.set_state(SessionState::Disconnected);
                }
            }
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::advertisement::{Availability, ChargingStatus, ListenPolicy};
    use crate::core::bluetooth::testing::FakeLink;
    use crate::core::error::ErrorKind;

    fn status(serial: &str) -> DeviceStatus {
        DeviceStatus {
            serial: serial.to_string(),
            battery_percent: 80,
            temperature_percent: 30,
            powered_on: false,
            availability: Availability::Available,
            listen_policy: ListenPolicy::Disabled,
            charging_status: ChargingStatus::None,
            signal_strength: -50,
        }
    }

    fn registry_with(serials: &[&str]) -> SessionRegistry {
        let mut registry = SessionRegistry::new(None);
        for serial in serials {
            registry.observe(status(serial), Arc::new(FakeLink::default()));
        }
        registry
    }

    fn ops(effects: &Effects) -> Vec<LinkOp> {
        effects.ops.iter().map(|pending| pending.op.clone()).collect()
    }

    fn state(registry: &SessionRegistry, serial: &str) -> SessionState {
        registry.snapshot(serial).unwrap().state
    }

    /// Drives `serial` to `Ready` with both groups readable and notifying.
    fn make_ready(registry: &mut SessionRegistry, serial: &str) {
        registry.select(serial).unwrap();
        let attempt = registry.snapshot(serial).unwrap().attempt;
        registry.on_link_outcome(serial, attempt, LinkOutcome::Connected);
        registry.on_link_outcome(
            serial,
            attempt,
            LinkOutcome::ServicesDiscovered(ServiceGroup::ALL.to_vec()),
        );
        let props = InfoProperties { notify: true, read: true };
        for group in ServiceGroup::ALL {
            registry.on_link_outcome(
                serial,
                attempt,
                LinkOutcome::CharacteristicsDiscovered(group, props),
            );
        }
    }

    #[test]
    fn first_sighting_creates_session_and_later_ones_refresh_it() {
        let mut registry = SessionRegistry::new(None);
        let first = registry.observe(status("S1"), Arc::new(FakeLink::default()));
        assert_eq!(first.events, vec![CoreEvent::DeviceObserved(status("S1"))]);
        assert_eq!(state(&registry, "S1"), SessionState::Discovered);

        make_ready(&mut registry, "S1");
        let mut update = status("S1");
        update.battery_percent = 12;
        registry.observe(update, Arc::new(FakeLink::default()));

        let snapshot = registry.snapshot("S1").unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.status.battery_percent, 12);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn redundant_sightings_keep_the_first_link() {
        let mut registry = SessionRegistry::new(None);
        let original = Arc::new(FakeLink::named("first"));
        registry.observe(status("S1"), original);
        registry.observe(status("S1"), Arc::new(FakeLink::named("second")));

        let effects = registry.select("S1").unwrap();
        assert_eq!(effects.ops[0].link.id(), "first");
    }

    #[test]
    fn selecting_an_unseen_serial_is_rejected() {
        let mut registry = registry_with(&["S1"]);
        let err = registry.select("S9").err().unwrap();
        assert_eq!(err, CoreError::NotDiscovered("S9".to_string()));
        assert_eq!(registry.selected(), None);
        assert_eq!(state(&registry, "S1"), SessionState::Discovered);
    }

    #[test]
    fn selecting_starts_a_connect() {
        let mut registry = registry_with(&["S1"]);
        let effects = registry.select("S1").unwrap();
        assert_eq!(ops(&effects), vec![LinkOp::Connect]);
        assert_eq!(state(&registry, "S1"), SessionState::Connecting);
        assert_eq!(registry.selected(), Some("S1"));

        // Selecting again while connecting issues nothing new.
        assert!(registry.select("S1").unwrap().ops.is_empty());
    }

    #[test]
    fn connect_success_discovers_both_groups() {
        let mut registry = registry_with(&["S1"]);
        registry.select("S1").unwrap();
        let effects = registry.on_link_outcome("S1", 1, LinkOutcome::Connected);
        assert_eq!(
            ops(&effects),
            vec![LinkOp::DiscoverServices(vec![ServiceGroup::Wifi, ServiceGroup::Power])]
        );
        assert_eq!(state(&registry, "S1"), SessionState::DiscoveringAttributes);
    }

    #[test]
    fn switching_selection_mid_connect_abandons_discovery() {
        let mut registry = registry_with(&["A", "B"]);
        registry.select("A").unwrap();
        registry.select("B").unwrap();

        let effects = registry.on_link_outcome("A", 1, LinkOutcome::Connected);
        assert!(effects.ops.is_empty());
        assert_eq!(state(&registry, "A"), SessionState::Connected);
        assert_eq!(state(&registry, "B"), SessionState::Connecting);

        // Coming back to A resumes at discovery without reconnecting.
        let effects = registry.select("A").unwrap();
        assert!(matches!(effects.ops[0].op, LinkOp::DiscoverServices(_)));
        assert_eq!(effects.ops[0].attempt, 1);
    }

    #[test]
    fn services_arriving_after_deselection_are_abandoned() {
        let mut registry = registry_with(&["A"]);
        registry.select("A").unwrap();
        registry.on_link_outcome("A", 1, LinkOutcome::Connected);
        registry.deselect();

        let effects = registry.on_link_outcome(
            "A",
            1,
            LinkOutcome::ServicesDiscovered(ServiceGroup::ALL.to_vec()),
        );
        assert!(effects.ops.is_empty());
        assert_eq!(state(&registry, "A"), SessionState::Connected);
    }

    #[test]
    fn characteristics_subscribe_and_read_per_properties() {
        let mut registry = registry_with(&["S1"]);
        registry.select("S1").unwrap();
        registry.on_link_outcome("S1", 1, LinkOutcome::Connected);
        let effects = registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::ServicesDiscovered(ServiceGroup::ALL.to_vec()),
        );
        assert_eq!(
            ops(&effects),
            vec![
                LinkOp::DiscoverCharacteristics(ServiceGroup::Wifi),
                LinkOp::DiscoverCharacteristics(ServiceGroup::Power),
            ]
        );

        let wifi = registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::CharacteristicsDiscovered(
                ServiceGroup::Wifi,
                InfoProperties { notify: true, read: true },
            ),
        );
        assert_eq!(
            ops(&wifi),
            vec![LinkOp::Subscribe(ServiceGroup::Wifi), LinkOp::Read(ServiceGroup::Wifi)]
        );
        assert!(wifi.events.is_empty());

        let power = registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::CharacteristicsDiscovered(
                ServiceGroup::Power,
                InfoProperties { notify: false, read: true },
            ),
        );
        assert_eq!(ops(&power), vec![LinkOp::Read(ServiceGroup::Power)]);
        assert_eq!(
            power.events,
            vec![CoreEvent::SessionReady { serial: "S1".to_string() }]
        );
        assert_eq!(state(&registry, "S1"), SessionState::Ready);
    }

    #[test]
    fn values_update_the_session() {
        let mut registry = registry_with(&["S1"]);
        make_ready(&mut registry, "S1");

        let effects = registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::Value(ServiceGroup::Wifi, b"ssid: lab\nip4: 10.0.0.7\nctl: 5828\n".to_vec()),
        );
        let wifi = WifiConfig {
            ssid: "lab".into(),
            password: String::new(),
            address: "10.0.0.7".into(),
            control_port: 5828,
        };
        assert_eq!(
            effects.events,
            vec![CoreEvent::ConfigurationUpdated { serial: "S1".into(), wifi: wifi.clone() }]
        );

        let effects = registry.on_link_outcome("S1", 1, LinkOutcome::Value(ServiceGroup::Power, vec![1]));
        assert_eq!(
            effects.events,
            vec![CoreEvent::PowerUpdated { serial: "S1".into(), powered: true }]
        );

        let snapshot = registry.snapshot("S1").unwrap();
        assert_eq!(snapshot.wifi, Some(wifi));
        assert_eq!(snapshot.powered_on, Some(true));
    }

    #[test]
    fn undecodable_values_are_reported_and_ignored() {
        let mut registry = registry_with(&["S1"]);
        make_ready(&mut registry, "S1");
        registry.on_link_outcome("S1", 1, LinkOutcome::Value(ServiceGroup::Power, vec![0]));

        let effects = registry.on_link_outcome("S1", 1, LinkOutcome::Value(ServiceGroup::Power, vec![]));
        assert!(matches!(
            effects.events.as_slice(),
            [CoreEvent::Error { kind: ErrorKind::ProtocolDecode, .. }]
        ));
        let effects = registry.on_link_outcome("S1", 1, LinkOutcome::Value(ServiceGroup::Wifi, vec![0xFF]));
        assert!(matches!(
            effects.events.as_slice(),
            [CoreEvent::Error { kind: ErrorKind::ProtocolDecode, .. }]
        ));
        let snapshot = registry.snapshot("S1").unwrap();
        assert_eq!(snapshot.powered_on, Some(false));
        assert_eq!(snapshot.wifi, None);
    }

    #[test]
    fn transport_errors_keep_the_state() {
        let mut registry = registry_with(&["S1"]);
        registry.select("S1").unwrap();
        registry.on_link_outcome("S1", 1, LinkOutcome::Connected);

        let effects = registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::Failed(LinkStage::ServiceDiscovery, "gatt error".into()),
        );
        assert!(effects.ops.is_empty());
        assert!(matches!(
            effects.events.as_slice(),
            [CoreEvent::Error { kind: ErrorKind::Transport, .. }]
        ));
        assert_eq!(state(&registry, "S1"), SessionState::DiscoveringAttributes);

        // Reselection is the retry.
        let retry = registry.select("S1").unwrap();
        assert!(matches!(retry.ops[0].op, LinkOp::DiscoverServices(_)));
    }

    fn discover_with_power_failing(registry: &mut SessionRegistry, power_first: bool) {
        registry.select("S1").unwrap();
        registry.on_link_outcome("S1", 1, LinkOutcome::Connected);
        registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::ServicesDiscovered(ServiceGroup::ALL.to_vec()),
        );
        let wifi = LinkOutcome::CharacteristicsDiscovered(
            ServiceGroup::Wifi,
            InfoProperties { notify: true, read: true },
        );
        let power = LinkOutcome::Failed(
            LinkStage::CharacteristicDiscovery(ServiceGroup::Power),
            "gatt error".into(),
        );
        let (first, second) = if power_first { (power, wifi) } else { (wifi, power) };
        let mut events = registry.on_link_outcome("S1", 1, first).events;
        events.extend(registry.on_link_outcome("S1", 1, second).events);
        assert!(!events.iter().any(|e| matches!(e, CoreEvent::SessionReady { .. })));
    }

    #[test]
    fn partial_characteristic_discovery_never_reaches_ready() {
        for power_first in [true, false] {
            let mut registry = registry_with(&["S1"]);
            discover_with_power_failing(&mut registry, power_first);

            let snapshot = registry.snapshot("S1").unwrap();
            assert_eq!(snapshot.state, SessionState::DiscoveringAttributes);
            assert_eq!(snapshot.discovered_groups, vec![ServiceGroup::Wifi]);
            assert!(matches!(
                registry.request(WriteRequest::Power(true)).err(),
                Some(CoreError::CharacteristicUnavailable { .. })
            ));

            // Reselection restarts discovery on the same link.
            let retry = registry.select("S1").unwrap();
            assert_eq!(
                ops(&retry),
                vec![LinkOp::DiscoverServices(ServiceGroup::ALL.to_vec())]
            );
            assert_eq!(retry.ops[0].attempt, 1);
        }
    }

    #[test]
    fn notification_failure_keeps_the_session_ready() {
        let mut registry = registry_with(&["S1"]);
        make_ready(&mut registry, "S1");

        let effects = registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::Failed(LinkStage::Notify(ServiceGroup::Power), "CCCD write failed".into()),
        );
        assert!(matches!(
            effects.events.as_slice(),
            [CoreEvent::Error { kind: ErrorKind::Transport, .. }]
        ));
        let snapshot = registry.snapshot("S1").unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.discovered_groups, ServiceGroup::ALL.to_vec());
        assert!(
            registry
                .request(WriteRequest::Wifi { wifi_direct: true, ssid: None, password: None })
                .is_ok()
        );
    }

    #[test]
    fn reconnect_cancels_the_previous_round() {
        let mut registry = registry_with(&["S1"]);
        registry.select("S1").unwrap();
        registry.on_link_outcome("S1", 1, LinkOutcome::Connected);
        registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::ServicesDiscovered(vec![ServiceGroup::Power]),
        );
        let subscribe = registry.on_link_outcome(
            "S1",
            1,
            LinkOutcome::CharacteristicsDiscovered(
                ServiceGroup::Power,
                InfoProperties { notify: true, read: false },
            ),
        );
        let old = subscribe.ops[0].cancel.clone();
        assert!(!old.is_cancelled());

        registry.on_link_outcome("S1", 1, LinkOutcome::Lost);
        assert!(old.is_cancelled());

        let reconnect = registry.select("S1").unwrap();
        assert!(!reconnect.ops[0].cancel.is_cancelled());

        registry.shutdown();
        assert!(reconnect.ops[0].cancel.is_cancelled());
    }

    #[test]
    fn connect_failure_allows_a_fresh_attempt() {
        let mut registry = registry_with(&["S1"]);
        registry.select("S1").unwrap();
        registry.on_link_outcome("S1", 1, LinkOutcome::Failed(LinkStage::Connect, "timeout".into()));
        assert_eq!(state(&registry, "S1"), SessionState::Disconnected);

        let effects = registry.select("S1").unwrap();
        assert_eq!(ops(&effects), vec![LinkOp::Connect]);
        assert_eq!(effects.ops[0].attempt, 2);
    }

    #[test]
    fn stale_outcomes_are_ignored() {
        let mut registry = registry_with(&["S1"]);
        registry.select("S1").unwrap();
        registry.on_link_outcome("S1", 1, LinkOutcome::Failed(LinkStage::Connect, "timeout".into()));
        registry.select("S1").unwrap();

        let effects = registry.on_link_outcome("S1", 1, LinkOutcome::Connected);
        assert!(effects.ops.is_empty());
        assert_eq!(state(&registry, "S1"), SessionState::Connecting);
    }

    #[test]
    fn lost_link_disconnects_and_blocks_writes() {
        let mut registry = registry_with(&["S1"]);
        make_ready(&mut registry, "S1");
        registry.on_link_outcome("S1", 1, LinkOutcome::Lost);
        assert_eq!(state(&registry, "S1"), SessionState::Disconnected);

        let err = registry.request(WriteRequest::Power(true)).err().unwrap();
        assert!(matches!(err, CoreError::CharacteristicUnavailable { .. }));
    }

    #[test]
    fn writes_need_a_selection() {
        let mut registry = registry_with(&["S1"]);
        assert_eq!(
            registry.request(WriteRequest::Power(true)).err(),
            Some(CoreError::NoSelection)
        );
    }

    #[test]
    fn writes_need_discovered_characteristics() {
        let mut registry = registry_with(&["S1"]);
        registry.select("S1").unwrap();
        assert_eq!(
            registry.request(WriteRequest::TogglePower).err(),
            Some(CoreError::CharacteristicUnavailable {
                serial: "S1".into(),
                group: ServiceGroup::Power,
            })
        );
    }

    #[test]
    fn power_toggle_uses_the_cached_state() {
        let mut registry = registry_with(&["S1"]);
        make_ready(&mut registry, "S1");

        let effects = registry.request(WriteRequest::TogglePower).unwrap();
        assert_eq!(ops(&effects), vec![LinkOp::Write(ServiceGroup::Power, vec![1])]);

        registry.on_link_outcome("S1", 1, LinkOutcome::Value(ServiceGroup::Power, vec![1]));
        let effects = registry.request(WriteRequest::TogglePower).unwrap();
        assert_eq!(ops(&effects), vec![LinkOp::Write(ServiceGroup::Power, vec![0])]);
        // The write itself leaves the session alone.
        assert_eq!(state(&registry, "S1"), SessionState::Ready);
    }

    #[test]
    fn wifi_requests_are_validated() {
        let mut registry = registry_with(&["S1"]);
        make_ready(&mut registry, "S1");

        let missing = registry.request(WriteRequest::Wifi {
            wifi_direct: false,
            ssid: Some("net".into()),
            password: None,
        });
        assert!(matches!(missing.err(), Some(CoreError::InvalidRequest(_))));

        let direct = registry
            .request(WriteRequest::Wifi {
                wifi_direct: true,
                ssid: Some("ignored".into()),
                password: None,
            })
            .unwrap();
        assert_eq!(ops(&direct), vec![LinkOp::Write(ServiceGroup::Wifi, b"ap: true\n".to_vec())]);
    }

    #[test]
    fn capacity_evicts_the_oldest_idle_session() {
        let mut registry = SessionRegistry::new(Some(2));
        registry.observe(status("A"), Arc::new(FakeLink::default()));
        registry.observe(status("B"), Arc::new(FakeLink::default()));
        registry.select("A").unwrap();

        registry.observe(status("C"), Arc::new(FakeLink::default()));
        assert_eq!(registry.known_serials(), vec!["A".to_string(), "C".to_string()]);

        // A is selected and C is idle, so C goes.
        registry.observe(status("D"), Arc::new(FakeLink::default()));
        assert_eq!(registry.known_serials(), vec!["A".to_string(), "D".to_string()]);
    }

    #[test]
    fn capacity_without_idle_sessions_ignores_newcomers() {
        let mut registry = SessionRegistry::new(Some(1));
        registry.observe(status("A"), Arc::new(FakeLink::default()));
        registry.select("A").unwrap();

        let effects = registry.observe(status("B"), Arc::new(FakeLink::default()));
        assert!(effects.events.is_empty());
        assert_eq!(registry.known_serials(), vec!["A".to_string()]);
    }
}
