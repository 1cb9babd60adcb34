//! MeshSignal - Mesh Radio Discovery and Ephemeral Signal Sync
//!
//! Finds LoRa mesh radios over Bluetooth LE, works out which radio family
//! they speak, and keeps a feed of short-lived location-tagged signals in
//! sync over the mesh and an optional cloud relay.

pub mod bluetooth;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod error;
pub mod protocol;
pub mod signal;
pub mod storage;

pub use bluetooth::{
    ConnectionCoordinator, ConnectionState, DeviceAdvertisement, DeviceInfo, ProtocolKind,
};
pub use config::AppConfig;
pub use error::{
    CloudError, ConnectionError, ProtocolError, SignalError, StoreError, TransportError,
};
pub use signal::{NewSignal, Signal, SignalSyncEngine, SignalSyncHandle};
