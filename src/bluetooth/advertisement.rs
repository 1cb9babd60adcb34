//! Advertisement data produced by a BLE scan.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// A single scan result, consumed once by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAdvertisement {
    /// Platform identifier of the peripheral
    pub id: String,
    pub local_name: Option<String>,
    /// Advertised service UUIDs, lowercase hyphenated
    pub services: BTreeSet<String>,
    /// Manufacturer specific data keyed by Bluetooth SIG company id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
}

impl DeviceAdvertisement {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: impl AsRef<str>) -> Self {
        self.services.insert(uuid.as_ref().to_ascii_lowercase());
        self
    }

    pub fn with_manufacturer_data(mut self, vendor_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(vendor_id, data);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Name shown to the user before a handshake has completed
    pub fn display_name(&self) -> &str {
        match &self.local_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.id,
        }
    }
}

/// Radio family detected from an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    Unknown,
    Meshtastic,
    MeshCore,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Unknown => write!(f, "unknown"),
            ProtocolKind::Meshtastic => write!(f, "meshtastic"),
            ProtocolKind::MeshCore => write!(f, "meshcore"),
        }
    }
}
