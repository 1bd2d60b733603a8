//! Session actor
//! A single task owns the `SessionRegistry`. Observations, user requests and
//! link outcomes all arrive through one FIFO queue, so they are applied one at
//! a time; link operations run concurrently and report back through the
//! same queue.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::advertisement::DeviceStatus;
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::session::{
    Effects, LinkOutcome, SessionRegistry, SessionSnapshot, WriteRequest,
};
use crate::core::bluetooth::transport::ProbeLink;
use crate::core::error::CoreError;
use crate::core::events::EventSink;

/// Messages processed by the session actor, in arrival order
pub enum SessionMessage {
    Observed {
        status: DeviceStatus,
        link: Arc<dyn ProbeLink>,
    },
    Select {
        serial: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Deselect,
    Request {
        request: WriteRequest,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    KnownSerials {
        reply: oneshot::Sender<Vec<String>>,
    },
    Snapshot {
        serial: String,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Link {
        serial: String,
        attempt: u64,
        outcome: LinkOutcome,
    },
    Shutdown,
}

pub struct SessionManager {
    registry: SessionRegistry,
    events: EventSink,
    connection: ConnectionManager,
    queue: mpsc::UnboundedSender<SessionMessage>,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Starts the actor and returns its handle.
    pub fn spawn(config: &BluetoothConfig, events: EventSink) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let manager = Self {
            registry: SessionRegistry::new(config.max_sessions),
            events,
            connection: ConnectionManager::new(Duration::from_secs(config.operation_timeout_secs)),
            queue: tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(manager.run(rx));
        SessionHandle { tx, cancel }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        info!("Session manager started");
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => message,
            };
            match message {
                Some(SessionMessage::Shutdown) | None => break,
                Some(message) => self.handle(message),
            }
        }
        // Stops every link task still running for this manager.
        self.cancel.cancel();
        self.registry.shutdown();
        info!("Session manager stopped with {} sessions", self.registry.len());
    }

    fn handle(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Observed { status, link } => {
                let effects = self.registry.observe(status, link);
                self.apply(effects);
            }
            SessionMessage::Select { serial, reply } => {
                let result = self.registry.select(&serial);
                let _ = reply.send(self.settle(result));
            }
            SessionMessage::Deselect => self.registry.deselect(),
            SessionMessage::Request { request, reply } => {
                let result = self.registry.request(request);
                let _ = reply.send(self.settle(result));
            }
            SessionMessage::KnownSerials { reply } => {
                let _ = reply.send(self.registry.known_serials());
            }
            SessionMessage::Snapshot { serial, reply } => {
                let _ = reply.send(self.registry.snapshot(&serial));
            }
            SessionMessage::Link { serial, attempt, outcome } => {
                let effects = self.registry.on_link_outcome(&serial, attempt, outcome);
                self.apply(effects);
            }
            SessionMessage::Shutdown => {}
        }
    }

    /// Applies the effects of a request, or reports why it was rejected.
    fn settle(&self, result: Result<Effects, CoreError>) -> Result<(), CoreError> {
        match result {
            Ok(effects) => {
                self.apply(effects);
                Ok(())
            }
            Err(err) => {
                self.events.report(&err);
                Err(err)
            }
        }
    }

    fn apply(&self, effects: Effects) {
        for event in effects.events {
            self.events.publish(event);
        }
        for pending in effects.ops {
            self.connection.execute(pending, self.queue.clone());
        }
    }
}

/// Cloneable handle to the session actor
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
    cancel: CancellationToken,
}

impl SessionHandle {
    fn send(&self, message: SessionMessage) -> Result<(), CoreError> {
        self.tx.send(message).map_err(|_| CoreError::Shutdown)
    }

    async fn call<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, CoreError> {
        let (reply, response) = oneshot::channel();
        self.send(message(reply))?;
        response.await.map_err(|_| CoreError::Shutdown)
    }

    /// Queues an advertisement observation.
    pub fn observe(&self, status: DeviceStatus, link: Arc<dyn ProbeLink>) -> Result<(), CoreError> {
        self.send(SessionMessage::Observed { status, link })
    }

    /// Selects the scanner to connect to; fails with `NotDiscovered` for unseen serials.
    pub async fn select(&self, serial: &str) -> Result<(), CoreError> {
        let serial = serial.to_string();
        self.call(|reply| SessionMessage::Select { serial, reply }).await?
    }

    pub fn deselect(&self) -> Result<(), CoreError> {
        self.send(SessionMessage::Deselect)
    }

    /// Asks the selected scanner to host its own network, or to join `ssid`.
    pub async fn request_wifi(
        &self,
        wifi_direct: bool,
        ssid: Option<String>,
        password: Option<String>,
    ) -> Result<(), CoreError> {
        let request = WriteRequest::Wifi { wifi_direct, ssid, password };
        self.call(|reply| SessionMessage::Request { request, reply }).await?
    }

    pub async fn set_power(&self, on: bool) -> Result<(), CoreError> {
        let request = WriteRequest::Power(on);
        self.call(|reply| SessionMessage::Request { request, reply }).await?
    }

    /// Powers the selected scanner off if it last reported on, otherwise on.
    pub async fn toggle_power(&self) -> Result<(), CoreError> {
        let request = WriteRequest::TogglePower;
        self.call(|reply| SessionMessage::Request { request, reply }).await?
    }

    pub async fn known_serials(&self) -> Result<Vec<String>, CoreError> {
        self.call(|reply| SessionMessage::KnownSerials { reply }).await
    }

    /// Waits until `serial` has been observed, checking every `poll`, then selects it.
    pub async fn select_when_seen(&self, serial: &str, poll: Duration) -> Result<(), CoreError> {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            if self.known_serials().await?.iter().any(|known| known == serial) {
                break;
            }
            debug!("Scanner {} not seen yet", serial);
        }
        self.select(serial).await
    }

    pub async fn snapshot(&self, serial: &str) -> Result<Option<SessionSnapshot>, CoreError> {
        let serial = serial.to_string();
        self.call(|reply| SessionMessage::Snapshot { serial, reply }).await
    }

    /// Stops the actor and every link task it started.
    pub fn shutdown(&self) {
        debug!("Shutting down session manager");
        let _ = self.send(SessionMessage::Shutdown);
        self.cancel.cancel();
    }
}
