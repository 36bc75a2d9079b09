//! Discovery-driven connection orchestration.
//!
//! [`StageLinqDevices`] consumes discovery announcements, runs the
//! per-identity connect/retry state machine, filters unwanted and duplicate
//! announcements, and fans every component's events into one channel.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::beat_info::{BeatCallback, BeatOptions};
use crate::device::Devices;
use crate::discovery::{self, ConnectionInfo};
use crate::event::StageLinqEvent;
use crate::file_transfer::FileTransfer;
use crate::network_device::NetworkDevice;
use crate::{Error, Result};

/// Delay between connection attempts for one device.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct StageLinqOptions {
    /// Bound on the per-device connection attempt sequence.
    pub max_retries: u32,
    /// Prefetch the remote database source listing after connecting.
    pub download_db_sources: bool,
    /// Source identity this process announces as; announcements bearing it
    /// are our own reflection and are skipped.
    pub acting_as_source: String,
}

impl Default for StageLinqOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            download_db_sources: false,
            acting_as_source: "stagelinq-rs".to_string(),
        }
    }
}

/// Connection lifecycle states per discovered identity. Absence from the
/// status map is the implicit "unseen" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStatus {
    Connecting,
    Connected,
    Failed,
}

/// Per-address session bookkeeping, separate from the device registry.
struct TrackedDevice {
    network: Arc<NetworkDevice>,
    file_transfer: Arc<FileTransfer>,
}

/// Clears a CONNECTING entry when the attempt is dropped before resolving,
/// so a fresh announcement can restart the sequence.
struct StatusGuard<'a> {
    status: &'a Mutex<HashMap<String, ConnectionStatus>>,
    identity: String,
    resolved: bool,
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut status = self.status.lock().unwrap();
        if status.get(&self.identity) == Some(&ConnectionStatus::Connecting) {
            status.remove(&self.identity);
        }
    }
}

/// Connection orchestrator across all discovered devices.
pub struct StageLinqDevices {
    options: StageLinqOptions,
    registry: Devices,
    status: Mutex<HashMap<String, ConnectionStatus>>,
    tracked: Mutex<HashMap<IpAddr, TrackedDevice>>,
    event_tx: mpsc::UnboundedSender<StageLinqEvent>,
}

impl StageLinqDevices {
    /// Returns the orchestrator and the unified event stream.
    pub fn new(
        options: StageLinqOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StageLinqEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = Devices::new(event_tx.clone());
        (
            Arc::new(Self {
                options,
                registry,
                status: Mutex::new(HashMap::new()),
                tracked: Mutex::new(HashMap::new()),
                event_tx,
            }),
            event_rx,
        )
    }

    /// The process-wide device registry.
    pub fn registry(&self) -> &Devices {
        &self.registry
    }

    /// Entry point for one discovery announcement.
    ///
    /// No-op for identities that are already being handled (in any state) or
    /// that match the unwanted-device policy; otherwise runs the bounded
    /// connect/retry sequence for this device. Callers spawn one task per
    /// announcement so a slow device never blocks discovery handling.
    pub async fn handle_device(&self, info: ConnectionInfo) -> Result<()> {
        self.run_connection(info, |info| self.connect_to_player(info))
            .await
    }

    /// The state machine, with the connect routine injected.
    async fn run_connection<F, Fut>(&self, info: ConnectionInfo, mut connect: F) -> Result<()>
    where
        F: FnMut(ConnectionInfo) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let identity = info.identity();

        {
            let mut status = self.status.lock().unwrap();
            if let Some(current) = status.get(&identity) {
                debug!(device = %identity, status = ?current, "Announcement for known identity skipped");
                return Ok(());
            }
            if discovery::is_unwanted(&info, &self.options.acting_as_source) {
                debug!(device = %identity, software = %info.software.name, "Unwanted device skipped");
                return Ok(());
            }
            status.insert(identity.clone(), ConnectionStatus::Connecting);
        }
        info!(device = %identity, "Connecting to device");

        let mut guard = StatusGuard {
            status: &self.status,
            identity: identity.clone(),
            resolved: false,
        };

        let mut attempt = 1;
        while attempt < self.options.max_retries {
            match connect(info.clone()).await {
                Ok(()) => {
                    guard.resolved = true;
                    self.status
                        .lock()
                        .unwrap()
                        .insert(identity.clone(), ConnectionStatus::Connected);
                    info!(device = %identity, "Device ready");
                    let _ = self.event_tx.send(StageLinqEvent::Ready);
                    return Ok(());
                }
                Err(e) => {
                    warn!(device = %identity, attempt, error = %e, "Connection attempt failed");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }

        guard.resolved = true;
        self.status
            .lock()
            .unwrap()
            .insert(identity.clone(), ConnectionStatus::Failed);
        Err(Error::ConnectFailed {
            device: identity,
            attempts: attempt - 1,
        })
    }

    /// One connection attempt: socket, registry entry, file-transfer and
    /// state-map services, player-state aggregation, connected event. Any
    /// error propagates to the retry loop.
    async fn connect_to_player(&self, info: ConnectionInfo) -> Result<()> {
        let network = Arc::new(NetworkDevice::new(info.clone()));
        network.connect().await?;

        let device_id = network.id();
        self.registry.add(info.clone()).await;

        let file_transfer = Arc::new(network.connect_file_transfer().await?);
        self.registry
            .add_service(&device_id, file_transfer.session_handle())
            .await;

        self.tracked.lock().unwrap().insert(
            info.address,
            TrackedDevice {
                network: Arc::clone(&network),
                file_transfer: Arc::clone(&file_transfer),
            },
        );

        if self.options.download_db_sources {
            let sources = file_transfer.sources().await?;
            info!(device = %device_id, count = sources.len(), "Database sources fetched");
        }

        let state_map = network.connect_state_map(self.event_tx.clone()).await?;
        self.registry.add_service(&device_id, state_map).await;

        let _ = self.event_tx.send(StageLinqEvent::Connected(info));
        Ok(())
    }

    /// Starts beat synchronization on a connected device.
    pub async fn start_beat_info(
        &self,
        address: IpAddr,
        options: BeatOptions,
        callback: BeatCallback,
    ) -> Result<()> {
        let network = {
            let tracked = self.tracked.lock().unwrap();
            Arc::clone(
                &tracked
                    .get(&address)
                    .ok_or(Error::DeviceNotTracked(address))?
                    .network,
            )
        };
        let handle = network.connect_beat_info(options, callback).await?;
        self.registry.add_service(&network.id(), handle).await;
        Ok(())
    }

    /// Downloads a file from a tracked device.
    pub async fn download_file(&self, address: IpAddr, path: &str) -> Result<Bytes> {
        let file_transfer = {
            let tracked = self.tracked.lock().unwrap();
            Arc::clone(
                &tracked
                    .get(&address)
                    .ok_or(Error::DeviceNotTracked(address))?
                    .file_transfer,
            )
        };
        file_transfer.download(path).await
    }

    /// Best-effort teardown of every tracked device connection.
    pub async fn disconnect_all(&self) {
        let tracked: Vec<_> = self.tracked.lock().unwrap().drain().collect();
        for (address, device) in tracked {
            debug!(%address, "Disconnecting");
            device.file_transfer.disconnect();
            device.network.disconnect().await;
        }
    }

    #[cfg(test)]
    fn status_of(&self, identity: &str) -> Option<ConnectionStatus> {
        self.status.lock().unwrap().get(identity).copied()
    }
}
