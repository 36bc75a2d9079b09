//! Unified event surface.
//!
//! Every component (registry, orchestrator, state-map sessions) fans its
//! events into one unbounded channel handed out at construction. Ordering is
//! preserved per emitting component; consumers match on what they need.

use std::net::IpAddr;

use serde_json::Value;

use crate::device::DeviceId;
use crate::discovery::ConnectionInfo;
use crate::service::ServiceMessage;
use crate::state_map::StateUpdate;

/// Snapshot of the player state behind a track/playback event.
#[derive(Debug, Clone)]
pub struct PlayerStatus {
    pub device: DeviceId,
    pub address: IpAddr,
    /// State path that triggered the event.
    pub name: String,
    pub value: Value,
}

/// Events emitted across all connected devices.
#[derive(Debug, Clone)]
pub enum StageLinqEvent {
    /// A device was added to the registry.
    NewDevice(ConnectionInfo),

    /// A live service was attached to a registered device.
    NewService { device: DeviceId, service: String },

    /// A device finished its connection sequence.
    Connected(ConnectionInfo),

    /// A connection sequence completed and the device is usable.
    Ready,

    /// Raw per-frame state-map pass-through.
    Message {
        device: DeviceId,
        message: ServiceMessage<StateUpdate>,
    },

    /// A track was loaded on a player.
    TrackLoaded(PlayerStatus),

    /// A player state value changed.
    StateChanged(PlayerStatus),

    /// A player started playing.
    NowPlaying(PlayerStatus),
}
