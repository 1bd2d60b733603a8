//! In-memory `ProbeLink` for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::{Notify, mpsc};

use crate::core::bluetooth::transport::{InfoProperties, ProbeLink, ServiceGroup, ValueStream};

#[derive(Default)]
pub(crate) struct FakeLink {
    name: String,
    connect_gate: Option<Arc<Notify>>,
    fail_connect: bool,
    disconnected: AtomicBool,
    properties: InfoProperties,
    reads: HashMap<ServiceGroup, Vec<u8>>,
    calls: Mutex<Vec<String>>,
    writes: Mutex<Vec<(ServiceGroup, Vec<u8>)>>,
    notifiers: Mutex<HashMap<ServiceGroup, mpsc::UnboundedSender<Result<Vec<u8>>>>>,
}

impl FakeLink {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// A scanner exposing both groups with notifying and readable info characteristics.
    pub fn scanner(name: &str) -> Self {
        Self {
            properties: InfoProperties { notify: true, read: true },
            ..Self::named(name)
        }
    }

    /// `connect` waits until the gate is notified.
    pub fn with_connect_gate(mut self, gate: Arc<Notify>) -> Self {
        self.connect_gate = Some(gate);
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn with_read(mut self, group: ServiceGroup, value: &[u8]) -> Self {
        self.reads.insert(group, value.to_vec());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(ServiceGroup, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn notify(&self, group: ServiceGroup, value: &[u8]) -> bool {
        self.notifiers
            .lock()
            .unwrap()
            .get(&group)
            .map(|tx| tx.send(Ok(value.to_vec())).is_ok())
            .unwrap_or(false)
    }

    /// Ends the notification stream of a group while the link stays up.
    pub fn end_notifications(&self, group: ServiceGroup) {
        self.notifiers.lock().unwrap().remove(&group);
    }

    /// Pushes an error into the notification stream of a group.
    pub fn fail_notifications(&self, group: ServiceGroup, message: &str) -> bool {
        self.notifiers
            .lock()
            .unwrap()
            .get(&group)
            .map(|tx| tx.send(Err(anyhow!(message.to_string()))).is_ok())
            .unwrap_or(false)
    }

    /// Drops the link: the device reports disconnected and every stream ends.
    pub fn drop_link(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.notifiers.lock().unwrap().clear();
    }

    pub fn subscriptions(&self) -> usize {
        self.calls().iter().filter(|call| call.starts_with("subscribe")).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProbeLink for FakeLink {
    fn id(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.record("connect".to_string());
        if let Some(gate) = &self.connect_gate {
            gate.notified().await;
        }
        if self.fail_connect {
            return Err(anyhow!("connection refused"));
        }
        self.disconnected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn discover_services(&self, groups: &[ServiceGroup]) -> Result<Vec<ServiceGroup>> {
        self.record("discover_services".to_string());
        Ok(groups.to_vec())
    }

    async fn discover_characteristics(&self, group: ServiceGroup) -> Result<InfoProperties> {
        self.record(format!("discover_characteristics:{}", group));
        Ok(self.properties)
    }

    async fn subscribe(&self, group: ServiceGroup) -> Result<ValueStream> {
        self.record(format!("subscribe:{}", group));
        let (tx, rx) = mpsc::unbounded_channel();
        self.notifiers.lock().unwrap().insert(group, tx);
        let values = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(values.boxed())
    }

    async fn read(&self, group: ServiceGroup) -> Result<Vec<u8>> {
        self.record(format!("read:{}", group));
        self.reads
            .get(&group)
            .cloned()
            .ok_or_else(|| anyhow!("read not permitted"))
    }

    async fn write(&self, group: ServiceGroup, data: &[u8]) -> Result<()> {
        self.record(format!("write:{}", group));
        self.writes.lock().unwrap().push((group, data.to_vec()));
        Ok(())
    }
}
