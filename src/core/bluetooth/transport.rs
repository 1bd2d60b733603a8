//! Attribute transport
//! `ProbeLink` is the per-device handle the session state machine drives.
//! `BluestLink` implements it on top of bluest.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_POWER_INFO_CHAR, UUID_POWER_REQUEST_CHAR, UUID_POWER_SERVICE, UUID_WIFI_INFO_CHAR,
    UUID_WIFI_REQUEST_CHAR, UUID_WIFI_SERVICE,
};

/// A logical pair of (info, request) characteristics under one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceGroup {
    Wifi,
    Power,
}

impl ServiceGroup {
    pub const ALL: [ServiceGroup; 2] = [ServiceGroup::Wifi, ServiceGroup::Power];

    pub fn service_uuid(self) -> Uuid {
        match self {
            Self::Wifi => UUID_WIFI_SERVICE,
            Self::Power => UUID_POWER_SERVICE,
        }
    }

    pub fn info_uuid(self) -> Uuid {
        match self {
            Self::Wifi => UUID_WIFI_INFO_CHAR,
            Self::Power => UUID_POWER_INFO_CHAR,
        }
    }

    pub fn request_uuid(self) -> Uuid {
        match self {
            Self::Wifi => UUID_WIFI_REQUEST_CHAR,
            Self::Power => UUID_POWER_REQUEST_CHAR,
        }
    }
}

impl fmt::Display for ServiceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wifi => f.write_str("wifi"),
            Self::Power => f.write_str("power"),
        }
    }
}

/// Capabilities of a group's info characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfoProperties {
    pub notify: bool,
    pub read: bool,
}

/// Stream of values pushed by an info characteristic
pub type ValueStream = BoxStream<'static, Result<Vec<u8>>>;

/// Transport handle owned by one device session.
#[async_trait]
pub trait ProbeLink: Send + Sync {
    /// Platform identifier, for logging
    fn id(&self) -> String;

    async fn connect(&self) -> Result<()>;

    /// Whether the device link is still up
    async fn is_connected(&self) -> bool;

    /// Discovers the requested services, returning the groups that were found.
    async fn discover_services(&self, groups: &[ServiceGroup]) -> Result<Vec<ServiceGroup>>;

    /// Discovers the info and request characteristics of a group.
    async fn discover_characteristics(&self, group: ServiceGroup) -> Result<InfoProperties>;

    async fn subscribe(&self, group: ServiceGroup) -> Result<ValueStream>;

    async fn read(&self, group: ServiceGroup) -> Result<Vec<u8>>;

    async fn write(&self, group: ServiceGroup, data: &[u8]) -> Result<()>;
}

#[derive(Clone)]
struct GroupCharacteristics {
    info: Characteristic,
    request: Characteristic,
}

/// bluest backed link
pub struct BluestLink {
    adapter: Adapter,
    device: Device,
    services: Mutex<HashMap<ServiceGroup, bluest::Service>>,
    characteristics: Mutex<HashMap<ServiceGroup, GroupCharacteristics>>,
}

impl BluestLink {
    pub fn new(adapter: Adapter, device: Device) -> Self {
        Self {
            adapter,
            device,
            services: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
        }
    }

    fn group_characteristics(&self, group: ServiceGroup) -> Result<GroupCharacteristics> {
        self.characteristics
            .lock()
            .map_err(|_| anyhow!("Characteristic cache poisoned"))?
            .get(&group)
            .cloned()
            .ok_or_else(|| anyhow!("{} characteristics not discovered", group))
    }

    fn service(&self, group: ServiceGroup) -> Result<bluest::Service> {
        self.services
            .lock()
            .map_err(|_| anyhow!("Service cache poisoned"))?
            .get(&group)
            .cloned()
            .ok_or_else(|| anyhow!("{} service not discovered", group))
    }
}

#[async_trait]
impl ProbeLink for BluestLink {
    fn id(&self) -> String {
        self.device.id().to_string()
    }

    async fn connect(&self) -> Result<()> {
        if self.device.is_connected().await {
            info!("Device {} already connected", self.device.id());
            return Ok(());
        }
        info!("Initiating connection to {}...", self.device.id());
        self.adapter.connect_device(&self.device).await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn discover_services(&self, groups: &[ServiceGroup]) -> Result<Vec<ServiceGroup>> {
        let mut found = Vec::new();
        for group in groups {
            let services = self
                .device
                .discover_services_with_uuid(group.service_uuid())
                .await?;
            match services.into_iter().next() {
                Some(service) => {
                    info!("Found {} service: {}", group, service.uuid());
                    self.services
                        .lock()
                        .map_err(|_| anyhow!("Service cache poisoned"))?
                        .insert(*group, service);
                    found.push(*group);
                }
                None => info!("Device {} has no {} service", self.device.id(), group),
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(&self, group: ServiceGroup) -> Result<InfoProperties> {
        let service = self.service(group)?;

        let mut info_opt = None;
        let mut request_opt = None;
        for characteristic in service.discover_characteristics().await? {
            let uuid = characteristic.uuid();
            if uuid == group.info_uuid() {
                debug!("Found {} info characteristic: {}", group, uuid);
                info_opt = Some(characteristic);
            } else if uuid == group.request_uuid() {
                debug!("Found {} request characteristic: {}", group, uuid);
                request_opt = Some(characteristic);
            }
        }

        let info = info_opt.ok_or_else(|| anyhow!("{} info characteristic not found", group))?;
        let request =
            request_opt.ok_or_else(|| anyhow!("{} request characteristic not found", group))?;
        let properties = info.properties().await?;

        self.characteristics
            .lock()
            .map_err(|_| anyhow!("Characteristic cache poisoned"))?
            .insert(group, GroupCharacteristics { info, request });

        Ok(InfoProperties {
            notify: properties.notify || properties.indicate,
            read: properties.read,
        })
    }

    async fn subscribe(&self, group: ServiceGroup) -> Result<ValueStream> {
        let info = self.group_characteristics(group)?.info;
        let (tx, rx) = mpsc::unbounded_channel();

        // The notify stream borrows the characteristic, so it lives in its own task.
        tokio::spawn(async move {
            match info.notify().await {
                Ok(mut notifications) => {
                    while let Some(item) = notifications.next().await {
                        let item = item.map_err(anyhow::Error::from);
                        if tx.send(item).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to subscribe to {} notifications: {}", group, e);
                    let _ = tx.send(Err(e.into()));
                }
            }
            debug!("{} notification stream ended", group);
        });

        let values = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(values.boxed())
    }

    async fn read(&self, group: ServiceGroup) -> Result<Vec<u8>> {
        let info = self.group_characteristics(group)?.info;
        Ok(info.read().await?)
    }

    async fn write(&self, group: ServiceGroup, data: &[u8]) -> Result<()> {
        let request = self.group_characteristics(group)?.request;
        request.write(data).await?;
        Ok(())
    }
}
