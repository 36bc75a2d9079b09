//! # stagelinq
//!
//! Rust client for the StageLinq device-link protocol spoken by networked
//! DJ hardware and software. Devices exchange real-time performance state
//! (beat position, tempo, track-loaded/now-playing status) and serve file
//! requests over persistent per-device socket connections.
//!
//! Discovery announcements come from an external listener; feed them to
//! [`StageLinqDevices::handle_device`] and consume the unified event stream.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stagelinq::{StageLinqDevices, StageLinqOptions, StageLinqEvent};
//!
//! #[tokio::main]
//! async fn main() -> stagelinq::Result<()> {
//!     let (manager, mut events) = StageLinqDevices::new(StageLinqOptions::default());
//!
//!     // One task per announcement; duplicates are no-ops.
//!     let m = manager.clone();
//!     tokio::spawn(async move {
//!         while let Some(info) = my_discovery_listener.recv().await {
//!             let m = m.clone();
//!             tokio::spawn(async move { m.handle_device(info).await });
//!         }
//!     });
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             StageLinqEvent::NowPlaying(status) => {
//!                 println!("{} started playing", status.address);
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod beat_info;
pub mod context;
pub mod device;
pub mod discovery;
pub mod error;
pub mod event;
pub mod file_transfer;
pub mod manager;
pub mod network_device;
pub mod service;
pub mod state_map;

// Re-export main public API
pub use beat_info::{BeatCallback, BeatData, BeatInfo, BeatOptions, PlayerBeatData};
pub use device::{Device, DeviceId, Devices};
pub use discovery::{ConnectionInfo, Software};
pub use error::Error;
pub use event::{PlayerStatus, StageLinqEvent};
pub use file_transfer::FileTransfer;
pub use manager::{StageLinqDevices, StageLinqOptions};
pub use network_device::NetworkDevice;
pub use service::{ServiceHandle, ServiceMessage};
pub use state_map::{StateMap, StateUpdate};

/// Result type for stagelinq operations.
pub type Result<T> = std::result::Result<T, Error>;
