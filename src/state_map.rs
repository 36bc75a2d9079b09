//! Track/player state notification service.
//!
//! Each frame carries one state path and its JSON value. Every parsed frame
//! is passed through raw as a [`StageLinqEvent::Message`], and a player-state
//! aggregator derives track lifecycle events from the paths beat-sync
//! consumers care about. State field semantics beyond those paths are
//! deliberately not modeled.

use std::net::IpAddr;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::{ReadContext, WriteContext};
use crate::device::DeviceId;
use crate::event::{PlayerStatus, StageLinqEvent};
use crate::service::{self, ServiceHandle, ServiceHandler, ServiceMessage};
use crate::{Error, Result};

/// Fixed subscription request: command id 3, zero-length payload.
const SUBSCRIBE_REQUEST: [u8; 8] = [0, 0, 0, 3, 0, 0, 0, 0];

/// One state path update from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub name: String,
    pub value: Value,
}

/// Derives track lifecycle events from raw state updates.
struct PlayerStateAggregator {
    device: DeviceId,
    address: IpAddr,
    event_tx: mpsc::UnboundedSender<StageLinqEvent>,
}

impl PlayerStateAggregator {
    fn apply(&self, update: &StateUpdate) {
        let status = PlayerStatus {
            device: self.device,
            address: self.address,
            name: update.name.clone(),
            value: update.value.clone(),
        };

        if update.name.ends_with("/Track/SongLoaded") && is_engaged(&update.value) {
            let _ = self.event_tx.send(StageLinqEvent::TrackLoaded(status.clone()));
        } else if update.name.ends_with("/PlayState") && is_engaged(&update.value) {
            let _ = self.event_tx.send(StageLinqEvent::NowPlaying(status.clone()));
        }
        let _ = self.event_tx.send(StageLinqEvent::StateChanged(status));
    }
}

/// Devices report booleans either bare or wrapped as `{"state": true, ...}`.
fn is_engaged(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Object(map) => map.get("state").and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    }
}

/// Handler for the state message family.
pub struct StateMapHandler {
    device: DeviceId,
    event_tx: mpsc::UnboundedSender<StageLinqEvent>,
    aggregator: PlayerStateAggregator,
}

impl StateMapHandler {
    pub fn new(
        device: DeviceId,
        address: IpAddr,
        event_tx: mpsc::UnboundedSender<StageLinqEvent>,
    ) -> Self {
        Self {
            device,
            event_tx: event_tx.clone(),
            aggregator: PlayerStateAggregator {
                device,
                address,
                event_tx,
            },
        }
    }
}

impl ServiceHandler for StateMapHandler {
    const NAME: &'static str = "StateMap";
    type Message = StateUpdate;

    fn parse(&mut self, ctx: &mut ReadContext) -> Result<ServiceMessage<StateUpdate>> {
        let id = ctx.read_u32()?;

        let name_len = ctx.read_u32()? as usize;
        let name = String::from_utf8(ctx.read_bytes(name_len)?.to_vec()).map_err(|_| {
            Error::Decode {
                service: Self::NAME,
                message_id: Some(id),
                detail: "state name is not UTF-8".to_string(),
            }
        })?;

        let value_len = ctx.read_u32()? as usize;
        let raw = ctx.read_bytes(value_len)?;
        let value = serde_json::from_slice(&raw).map_err(|e| Error::Decode {
            service: Self::NAME,
            message_id: Some(id),
            detail: format!("state value is not JSON: {e}"),
        })?;

        Ok(ServiceMessage {
            id,
            message: StateUpdate { name, value },
        })
    }

    fn handle(&mut self, message: ServiceMessage<StateUpdate>) {
        let update = message.message.clone();
        let _ = self.event_tx.send(StageLinqEvent::Message {
            device: self.device,
            message,
        });
        self.aggregator.apply(&update);
    }
}

/// State notification entry point.
pub struct StateMap;

impl StateMap {
    /// Sends the subscription request and spawns the session read loop on
    /// the supplied socket, fanning events into `event_tx`.
    pub async fn connect<S>(
        device: DeviceId,
        address: IpAddr,
        event_tx: mpsc::UnboundedSender<StageLinqEvent>,
        socket: S,
    ) -> Result<ServiceHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(socket);

        let mut ctx = WriteContext::with_capacity(SUBSCRIBE_REQUEST.len());
        ctx.write_bytes(&SUBSCRIBE_REQUEST);
        service::write(ctx, &mut write_half).await?;
        debug!(device = %device, "TX: state-map subscribe");

        let handler = StateMapHandler::new(device, address, event_tx);
        Ok(service::spawn(handler, read_half))
    }
}
