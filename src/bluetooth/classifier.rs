//! Radio family classification
//!
//! Pure and deterministic. An advertisement is run through an ordered chain
//! of detectors; the first detector that recognises any family wins. Inside
//! each detector families are tried in [`FAMILY_PRIORITY`] order, so an
//! advertisement carrying both families' markers resolves to Meshtastic.

use serde::{Deserialize, Serialize};

use super::advertisement::{DeviceAdvertisement, ProtocolKind};

/// Meshtastic BLE service
pub const MESHTASTIC_SERVICE_UUID: &str = "6ba1b218-15a8-461f-9fa8-5dcae273eafd";

/// Nordic UART service used by MeshCore companion radios
pub const MESHCORE_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Tie-break order when an advertisement matches more than one family.
pub const FAMILY_PRIORITY: [ProtocolKind; 2] = [ProtocolKind::Meshtastic, ProtocolKind::MeshCore];

/// Manufacturer data signature: company id plus a payload prefix.
#[derive(Debug, Clone, Copy)]
pub struct ManufacturerSignature {
    pub vendor_id: u16,
    pub prefix: &'static [u8],
}

const MESHTASTIC_MANUFACTURER: ManufacturerSignature = ManufacturerSignature {
    vendor_id: 0x02E5,
    prefix: b"MT",
};

const MESHCORE_MANUFACTURER: ManufacturerSignature = ManufacturerSignature {
    vendor_id: 0xFFFF,
    prefix: b"MC",
};

const SERVICE_CONFIDENCE: f32 = 0.95;
const MANUFACTURER_CONFIDENCE: f32 = 0.7;
const NAME_CONFIDENCE: f32 = 0.4;

/// What made the classifier decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Evidence {
    ServiceUuid(String),
    ManufacturerData { vendor_id: u16 },
    NamePrefix(String),
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ProtocolKind,
    pub confidence: f32,
    pub evidence: Evidence,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            kind: ProtocolKind::Unknown,
            confidence: 0.0,
            evidence: Evidence::None,
        }
    }
}

pub type Detector = fn(&DeviceAdvertisement, ProtocolKind) -> Option<(f32, Evidence)>;

/// Detectors in descending order of confidence.
const DETECTION_CHAIN: [Detector; 3] = [by_service_uuid, by_manufacturer_data, by_name_prefix];

/// Classify an advertisement. Never fails; Unknown is the safe default.
pub fn classify(advertisement: &DeviceAdvertisement) -> Classification {
    first_match(advertisement, &DETECTION_CHAIN).unwrap_or_else(Classification::unknown)
}

/// Run `chain` in order and return the first family any detector recognises.
pub fn first_match(
    advertisement: &DeviceAdvertisement,
    chain: &[Detector],
) -> Option<Classification> {
    chain.iter().find_map(|detector| {
        FAMILY_PRIORITY.iter().find_map(|&kind| {
            detector(advertisement, kind).map(|(confidence, evidence)| Classification {
                kind,
                confidence,
                evidence,
            })
        })
    })
}

fn service_uuid(kind: ProtocolKind) -> Option<&'static str> {
    match kind {
        ProtocolKind::Meshtastic => Some(MESHTASTIC_SERVICE_UUID),
        ProtocolKind::MeshCore => Some(MESHCORE_SERVICE_UUID),
        ProtocolKind::Unknown => None,
    }
}

fn manufacturer_signature(kind: ProtocolKind) -> Option<ManufacturerSignature> {
    match kind {
        ProtocolKind::Meshtastic => Some(MESHTASTIC_MANUFACTURER),
        ProtocolKind::MeshCore => Some(MESHCORE_MANUFACTURER),
        ProtocolKind::Unknown => None,
    }
}

fn name_prefix(kind: ProtocolKind) -> Option<&'static str> {
    match kind {
        ProtocolKind::Meshtastic => Some("meshtastic"),
        ProtocolKind::MeshCore => Some("meshcore"),
        ProtocolKind::Unknown => None,
    }
}

fn by_service_uuid(
    advertisement: &DeviceAdvertisement,
    kind: ProtocolKind,
) -> Option<(f32, Evidence)> {
    let uuid = service_uuid(kind)?;
    advertisement
        .services
        .iter()
        .any(|service| service.eq_ignore_ascii_case(uuid))
        .then(|| (SERVICE_CONFIDENCE, Evidence::ServiceUuid(uuid.to_string())))
}

fn by_manufacturer_data(
    advertisement: &DeviceAdvertisement,
    kind: ProtocolKind,
) -> Option<(f32, Evidence)> {
    let signature = manufacturer_signature(kind)?;
    let data = advertisement.manufacturer_data.get(&signature.vendor_id)?;
    data.starts_with(signature.prefix).then_some((
        MANUFACTURER_CONFIDENCE,
        Evidence::ManufacturerData {
            vendor_id: signature.vendor_id,
        },
    ))
}

fn by_name_prefix(
    advertisement: &DeviceAdvertisement,
    kind: ProtocolKind,
) -> Option<(f32, Evidence)> {
    let prefix = name_prefix(kind)?;
    let name = advertisement.local_name.as_deref()?;
    name.to_ascii_lowercase()
        .starts_with(prefix)
        .then(|| (NAME_CONFIDENCE, Evidence::NamePrefix(name.to_string())))
}
