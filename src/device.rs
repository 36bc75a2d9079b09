//! Device identity and the process-wide device registry.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::discovery::ConnectionInfo;
use crate::event::StageLinqEvent;
use crate::service::ServiceHandle;
use crate::{Error, Result};

/// Identity of a remote device, derived from the 16-byte discovery token.
///
/// Renders as the canonical dashed-hex string used as the registry key.
/// Conversions are pure and idempotent; the identity never changes after
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    pub fn from_token(token: [u8; 16]) -> Self {
        Self(token)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl From<[u8; 16]> for DeviceId {
    fn from(token: [u8; 16]) -> Self {
        Self(token)
    }
}

impl From<&ConnectionInfo> for DeviceId {
    fn from(info: &ConnectionInfo) -> Self {
        Self(info.token)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(|uuid| Self(uuid.into_bytes()))
            .map_err(|_| Error::InvalidDeviceId(s.to_string()))
    }
}

/// Bookkeeping for one remote endpoint and the live services attached to it.
pub struct Device {
    pub id: DeviceId,
    /// Replaced on rediscovery via [`Devices::update_info`].
    pub info: ConnectionInfo,
    services: HashMap<String, ServiceHandle>,
}

impl Device {
    fn new(info: ConnectionInfo) -> Self {
        Self {
            id: DeviceId::from_token(info.token),
            info,
            services: HashMap::new(),
        }
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

struct Inner {
    devices: RwLock<HashMap<DeviceId, Arc<RwLock<Device>>>>,
    inserted: Notify,
    event_tx: mpsc::UnboundedSender<StageLinqEvent>,
}

/// Process-wide registry of known devices.
///
/// The single source of truth for device existence: every component that
/// needs to know whether a device exists asks here.
#[derive(Clone)]
pub struct Devices {
    inner: Arc<Inner>,
}

impl Devices {
    pub fn new(event_tx: mpsc::UnboundedSender<StageLinqEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                devices: RwLock::new(HashMap::new()),
                inserted: Notify::new(),
                event_tx,
            }),
        }
    }

    /// Registers a device, waking every [`Devices::get`] waiter.
    ///
    /// A rediscovered token replaces the previous entry outright.
    pub async fn add(&self, info: ConnectionInfo) -> Arc<RwLock<Device>> {
        let id = DeviceId::from_token(info.token);
        let device = Arc::new(RwLock::new(Device::new(info.clone())));
        self.inner
            .devices
            .write()
            .await
            .insert(id, Arc::clone(&device));
        info!(device = %id, address = %info.address, "New device registered");
        let _ = self.inner.event_tx.send(StageLinqEvent::NewDevice(info));
        self.inner.inserted.notify_waiters();
        device
    }

    /// Suspends until a device with this identity exists, then returns it.
    ///
    /// The notified future is registered before the existence check so an
    /// insert racing between check and await cannot be missed.
    pub async fn get(&self, id: &DeviceId) -> Arc<RwLock<Device>> {
        loop {
            let notified = self.inner.inserted.notified();
            if let Some(device) = self.inner.devices.read().await.get(id) {
                return Arc::clone(device);
            }
            debug!(device = %id, "Waiting for device");
            notified.await;
        }
    }

    /// Non-blocking existence check.
    pub async fn has(&self, id: &DeviceId) -> bool {
        self.inner.devices.read().await.contains_key(id)
    }

    /// Non-blocking lookup.
    pub async fn device(&self, id: &DeviceId) -> Option<Arc<RwLock<Device>>> {
        self.inner.devices.read().await.get(id).map(Arc::clone)
    }

    /// Waits for the device, then replaces its connection info.
    pub async fn update_info(&self, id: &DeviceId, info: ConnectionInfo) {
        let device = self.get(id).await;
        device.write().await.info = info;
    }

    /// Waits for the device, then attaches a live service to it.
    pub async fn add_service(&self, id: &DeviceId, service: ServiceHandle) {
        let device = self.get(id).await;
        let name = service.name().to_string();
        device.write().await.services.insert(name.clone(), service);
        debug!(device = %id, service = %name, "Service attached");
        let _ = self.inner.event_tx.send(StageLinqEvent::NewService {
            device: *id,
            service: name,
        });
    }

    /// Detaches a service from the device, returning its handle if present.
    pub async fn delete_service(&self, id: &DeviceId, name: &str) -> Option<ServiceHandle> {
        let device = self.device(id).await?;
        let removed = device.write().await.services.remove(name);
        if removed.is_some() {
            debug!(device = %id, service = name, "Service detached");
        }
        removed
    }
}
