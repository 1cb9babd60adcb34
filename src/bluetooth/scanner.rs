//! BLE discovery through btleplug.

use anyhow::{Context, Result};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::advertisement::DeviceAdvertisement;
use super::transport::BleTransportProvider;

const ADVERTISEMENT_BUFFER: usize = 64;

pub struct BleScanner {
    adapter: Adapter,
    peripherals: Arc<DashMap<String, Peripheral>>,
}

impl BleScanner {
    /// Use the first Bluetooth adapter on the system.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to create Bluetooth manager")?;

        let adapter = manager
            .adapters()
            .await
            .context("Failed to get Bluetooth adapters")?
            .into_iter()
            .next()
            .context("No Bluetooth adapters found")?;

        info!("Using Bluetooth adapter: {:?}", adapter.adapter_info().await?);

        Ok(Self {
            adapter,
            peripherals: Arc::new(DashMap::new()),
        })
    }

    /// Start scanning. Every discovery or update becomes an advertisement on
    /// the returned channel until the receiver is dropped.
    pub async fn start(&self) -> Result<mpsc::Receiver<DeviceAdvertisement>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .context("Failed to start BLE scan")?;

        let mut events = self.adapter.events().await?;
        let (tx, rx) = mpsc::channel(ADVERTISEMENT_BUFFER);
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };

                match read_advertisement(&adapter, &id).await {
                    Ok(Some((advertisement, peripheral))) => {
                        peripherals.insert(advertisement.id.clone(), peripheral);
                        if tx.send(advertisement).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Skipping {:?}: {}", id, e),
                }
            }
            debug!("Scan event stream closed");
        });

        info!("BLE scan started");
        Ok(rx)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
        Ok(())
    }

    /// Transports for any peripheral this scanner has reported.
    pub fn transport_provider(&self) -> BleTransportProvider {
        BleTransportProvider::new(self.peripherals.clone())
    }
}

async fn read_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<(DeviceAdvertisement, Peripheral)>> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    let mut advertisement = DeviceAdvertisement::new(format!("{:?}", peripheral.id()));
    advertisement.local_name = properties.local_name;
    advertisement.rssi = properties.rssi;
    advertisement.manufacturer_data = properties.manufacturer_data;
    advertisement.services = properties
        .services
        .iter()
        .map(|uuid| uuid.to_string())
        .collect();

    Ok(Some((advertisement, peripheral)))
}
