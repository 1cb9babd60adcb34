//! Bluetooth LE Radio Discovery and Links
//!
//! Scanning, radio family classification, the raw byte transports and the
//! coordinator that owns the active radio connection.

pub mod advertisement;
pub mod classifier;
pub mod coordinator;
pub mod direction;
pub mod scanner;
pub mod simulated;
pub mod transport;

pub use advertisement::{DeviceAdvertisement, ProtocolKind};
pub use classifier::{classify, Classification, Evidence};
pub use coordinator::{
    BatteryReading, ConnectionCoordinator, ConnectionState, DeviceInfo, LivenessEvidence, MeshLink,
    PingReport,
};
pub use direction::{DirectionEstimate, DirectionEstimator, RssiHeadingSample};
pub use scanner::BleScanner;
pub use simulated::{RadioBehavior, SimulatedProvider, SimulatedRadio};
pub use transport::{
    BleTransport, BleTransportProvider, GattProfile, RawTransport, TransportProvider,
};
