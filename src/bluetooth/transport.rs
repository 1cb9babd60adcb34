//! Raw byte transport to a companion radio.

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::{uuid, Uuid};

use super::advertisement::{DeviceAdvertisement, ProtocolKind};
use crate::error::TransportError;

/// Byte oriented link the session layer talks through.
#[async_trait]
pub trait RawTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Frames pushed by the radio. The stream ends when the link drops.
    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    /// Addressable endpoints, for diagnostics.
    async fn endpoints(&self) -> Result<Vec<String>, TransportError>;

    async fn is_connected(&self) -> bool;
}

/// Opens a transport for a scanned device.
pub trait TransportProvider: Send + Sync {
    fn open(
        &self,
        advertisement: &DeviceAdvertisement,
        kind: ProtocolKind,
    ) -> Result<Arc<dyn RawTransport>, TransportError>;
}

/// GATT layout of a radio family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl GattProfile {
    pub const MESHTASTIC: GattProfile = GattProfile {
        service: uuid!("6ba1b218-15a8-461f-9fa8-5dcae273eafd"),
        write: uuid!("f75c76d2-129e-4dad-a1dd-7866124401e7"),
        notify: uuid!("2c55e69e-4993-11ed-b878-0242ac120002"),
    };

    pub const MESHCORE: GattProfile = GattProfile {
        service: uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e"),
        write: uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e"),
        notify: uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e"),
    };

    pub fn for_kind(kind: ProtocolKind) -> Option<Self> {
        match kind {
            ProtocolKind::Meshtastic => Some(Self::MESHTASTIC),
            ProtocolKind::MeshCore => Some(Self::MESHCORE),
            ProtocolKind::Unknown => None,
        }
    }

    pub fn endpoints(&self) -> Vec<String> {
        vec![
            format!("service {}", self.service),
            format!("write {}", self.write),
            format!("notify {}", self.notify),
        ]
    }
}

fn io_error(err: btleplug::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

/// A btleplug peripheral speaking one family's GATT profile.
pub struct BleTransport {
    peripheral: Peripheral,
    profile: GattProfile,
    write_char: Mutex<Option<Characteristic>>,
}

impl BleTransport {
    pub fn new(peripheral: Peripheral, profile: GattProfile) -> Self {
        Self {
            peripheral,
            profile,
            write_char: Mutex::new(None),
        }
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == self.profile.service)
            .ok_or_else(|| TransportError::MissingEndpoint(uuid.to_string()))
    }
}

#[async_trait]
impl RawTransport for BleTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await.map_err(io_error)? {
            self.peripheral.connect().await.map_err(io_error)?;
        }
        self.peripheral.discover_services().await.map_err(io_error)?;

        let write = self.find_characteristic(self.profile.write)?;
        let notify = self.find_characteristic(self.profile.notify)?;

        self.peripheral.subscribe(&notify).await.map_err(io_error)?;
        *self.write_char.lock() = Some(write);

        info!("BLE link up: {:?}", self.peripheral.id());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.write_char.lock().take();
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Failed to disconnect from {:?}: {}", self.peripheral.id(), e);
            return Err(io_error(e));
        }
        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let characteristic = self
            .write_char
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        self.peripheral
            .write(&characteristic, frame, WriteType::WithoutResponse)
            .await
            .map_err(io_error)?;
        debug!("Sent {} bytes to {:?}", frame.len(), self.peripheral.id());
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let notify = self.profile.notify;
        let stream = self.peripheral.notifications().await.map_err(io_error)?;
        Ok(stream
            .filter_map(move |n| futures::future::ready((n.uuid == notify).then_some(n.value)))
            .boxed())
    }

    async fn endpoints(&self) -> Result<Vec<String>, TransportError> {
        let mut endpoints = Vec::new();
        for service in self.peripheral.services() {
            endpoints.push(format!("service {}", service.uuid));
            for characteristic in &service.characteristics {
                endpoints.push(format!(
                    "characteristic {} {:?}",
                    characteristic.uuid, characteristic.properties
                ));
            }
        }
        Ok(endpoints)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

/// Opens [`BleTransport`]s for peripherals the scanner has seen.
#[derive(Clone, Default)]
pub struct BleTransportProvider {
    peripherals: Arc<DashMap<String, Peripheral>>,
}

impl BleTransportProvider {
    pub fn new(peripherals: Arc<DashMap<String, Peripheral>>) -> Self {
        Self { peripherals }
    }
}

impl TransportProvider for BleTransportProvider {
    fn open(
        &self,
        advertisement: &DeviceAdvertisement,
        kind: ProtocolKind,
    ) -> Result<Arc<dyn RawTransport>, TransportError> {
        let profile = GattProfile::for_kind(kind)
            .ok_or_else(|| TransportError::MissingEndpoint(format!("no GATT profile for {kind}")))?;
        let peripheral = self
            .peripherals
            .get(&advertisement.id)
            .map(|p| p.value().clone())
            .ok_or_else(|| TransportError::MissingEndpoint(advertisement.id.clone()))?;

        Ok(Arc::new(BleTransport::new(peripheral, profile)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::classifier::{MESHCORE_SERVICE_UUID, MESHTASTIC_SERVICE_UUID};

    #[test]
    fn profiles_use_advertised_services() {
        assert_eq!(
            GattProfile::MESHTASTIC.service.to_string(),
            MESHTASTIC_SERVICE_UUID
        );
        assert_eq!(GattProfile::MESHCORE.service.to_string(), MESHCORE_SERVICE_UUID);
        assert!(GattProfile::for_kind(ProtocolKind::Unknown).is_none());
    }

    #[test]
    fn unknown_peripheral_cannot_be_opened() {
        let provider = BleTransportProvider::default();
        let adv = DeviceAdvertisement::new("nowhere");

        assert!(matches!(
            provider.open(&adv, ProtocolKind::Meshtastic),
            Err(TransportError::MissingEndpoint(_))
        ));
    }
}
