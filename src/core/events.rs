//! Typed event channel
//! All externally observable state changes leave the core through a single
//! `EventSink`. The consumer owns the matching receiver; dropping it is the
//! teardown, after which published events are discarded.

use std::path::PathBuf;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::bluetooth::{DeviceStatus, WifiConfig};
use crate::core::cloud::CloudRecord;
use crate::core::error::{CoreError, ErrorKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CoreEvent {
    DeviceObserved(DeviceStatus),
    SessionReady { serial: String },
    ConfigurationUpdated { serial: String, wifi: WifiConfig },
    PowerUpdated { serial: String, powered: bool },
    CloudRecordAvailable { serial: String, record: CloudRecord },
    FirmwareReady { path: PathBuf },
    Error { kind: ErrorKind, message: String },
}

impl From<&CoreError> for CoreEvent {
    fn from(err: &CoreError) -> Self {
        CoreEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Sending half of the event channel; cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<CoreEvent>;

/// Creates the event channel shared by all components.
pub fn event_channel() -> (EventSink, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

impl EventSink {
    pub fn publish(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event consumer is gone, dropping event");
        }
    }

    /// Logs and publishes an error.
    pub fn report(&self, err: &CoreError) {
        warn!("{}", err);
        self.publish(CoreEvent::from(err));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
