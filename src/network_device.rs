//! Per-endpoint connection brokering.
//!
//! A [`NetworkDevice`] owns connection establishment for one remote endpoint
//! and brokers "connect to service" requests: each service session gets its
//! own socket, opened here and handed to the concrete service.

use std::net::IpAddr;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::beat_info::{BeatCallback, BeatInfo, BeatOptions};
use crate::device::DeviceId;
use crate::discovery::ConnectionInfo;
use crate::event::StageLinqEvent;
use crate::file_transfer::FileTransfer;
use crate::service::ServiceHandle;
use crate::state_map::StateMap;
use crate::Result;

/// Live connection state for one remote endpoint.
pub struct NetworkDevice {
    info: ConnectionInfo,
    id: DeviceId,
    primary: AsyncMutex<Option<TcpStream>>,
    sessions: std::sync::Mutex<Vec<ServiceHandle>>,
}

impl NetworkDevice {
    pub fn new(info: ConnectionInfo) -> Self {
        let id = DeviceId::from_token(info.token);
        Self {
            info,
            id,
            primary: AsyncMutex::new(None),
            sessions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn address(&self) -> IpAddr {
        self.info.address
    }

    /// Establishes the primary socket to the endpoint.
    pub async fn connect(&self) -> Result<()> {
        debug!(address = %self.info.address, port = self.info.port, "Connecting");
        let socket = TcpStream::connect((self.info.address, self.info.port)).await?;
        *self.primary.lock().await = Some(socket);
        info!(device = %self.id, address = %self.info.address, "Device connected");
        Ok(())
    }

    /// Opens a dedicated socket for one service session.
    async fn open_service_socket(&self) -> Result<TcpStream> {
        let socket = TcpStream::connect((self.info.address, self.info.port)).await?;
        Ok(socket)
    }

    /// Starts beat synchronization on its own socket.
    pub async fn connect_beat_info(
        &self,
        options: BeatOptions,
        callback: BeatCallback,
    ) -> Result<ServiceHandle> {
        let socket = self.open_service_socket().await?;
        let handle = BeatInfo::start(options, callback, socket).await?;
        self.sessions.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    /// Starts state notifications on its own socket.
    pub async fn connect_state_map(
        &self,
        event_tx: mpsc::UnboundedSender<StageLinqEvent>,
    ) -> Result<ServiceHandle> {
        let socket = self.open_service_socket().await?;
        let handle = StateMap::connect(self.id, self.info.address, event_tx, socket).await?;
        self.sessions.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    /// Starts the file request service on its own socket.
    pub async fn connect_file_transfer(&self) -> Result<FileTransfer> {
        let socket = self.open_service_socket().await?;
        let transfer = FileTransfer::connect(socket).await?;
        self.sessions.lock().unwrap().push(transfer.session_handle());
        Ok(transfer)
    }

    /// Best-effort teardown of the primary socket and every service session.
    pub async fn disconnect(&self) {
        for session in self.sessions.lock().unwrap().drain(..) {
            debug!(device = %self.id, service = session.name(), "Stopping service session");
            session.disconnect();
        }
        if self.primary.lock().await.take().is_some() {
            info!(device = %self.id, "Device disconnected");
        }
    }
}
