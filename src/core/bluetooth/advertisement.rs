//! Advertisement decoding
//! Turns the advertised name and manufacturer data of a nearby device into a
//! `DeviceStatus`, or rejects it when it is not one of our scanners.

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{
    MAX_PERCENT, MIN_MANUFACTURER_DATA_LEN, VENDOR_NAME_PREFIX, VENDOR_SIGNATURE,
};

/// Availability of the scanner, bits 0-2 of the packed status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Available,
    ListenOnly,
    NotAvailable,
    Reserved3,
    Reserved4,
    Reserved5,
    Reserved6,
    Reserved7,
}

impl TryFrom<u8> for Availability {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Available),
            1 => Ok(Self::ListenOnly),
            2 => Ok(Self::NotAvailable),
            3 => Ok(Self::Reserved3),
            4 => Ok(Self::Reserved4),
            5 => Ok(Self::Reserved5),
            6 => Ok(Self::Reserved6),
            7 => Ok(Self::Reserved7),
            other => Err(other),
        }
    }
}

/// Listen policy used by casting clients, bits 3-4 of the packed status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenPolicy {
    Disabled,
    Institution,
    Global,
    Research,
}

impl TryFrom<u8> for ListenPolicy {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Institution),
            2 => Ok(Self::Global),
            3 => Ok(Self::Research),
            other => Err(other),
        }
    }
}

/// Charging status, bits 6-7 of the packed status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingStatus {
    None,
    Pre,
    Fast,
    Done,
}

impl TryFrom<u8> for ChargingStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Pre),
            2 => Ok(Self::Fast),
            3 => Ok(Self::Done),
            other => Err(other),
        }
    }
}

/// Status of a scanner as seen in a single advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Serial number, the advertised name without the vendor prefix
    pub serial: String,
    /// Battery level in 0-100%
    pub battery_percent: u8,
    /// Temperature in 0-100%
    pub temperature_percent: u8,
    /// True if the scanner is powered on
    pub powered_on: bool,
    pub availability: Availability,
    pub listen_policy: ListenPolicy,
    pub charging_status: ChargingStatus,
    /// Link-layer RSSI
    pub signal_strength: i16,
}

/// Extracts the serial number from an advertised name.
pub fn serial_from_name(name: &str) -> Option<&str> {
    name.strip_prefix(VENDOR_NAME_PREFIX)
        .filter(|serial| !serial.is_empty())
}

/// Decodes an advertisement.
///
/// `manufacturer_data` is the raw manufacturer specific field, starting with
/// the two signature bytes. Returns `None` for anything that is not a scanner
/// or that is malformed; never panics.
pub fn decode_advertisement(
    name: &str,
    manufacturer_data: &[u8],
    signal_strength: i16,
) -> Option<DeviceStatus> {
    let serial = serial_from_name(name)?;
    if manufacturer_data.len() < MIN_MANUFACTURER_DATA_LEN {
        return None;
    }
    if manufacturer_data[..2] != VENDOR_SIGNATURE {
        return None;
    }

    let packed = manufacturer_data[4];
    let availability = Availability::try_from(packed & 0x07).ok()?;
    let listen_policy = ListenPolicy::try_from((packed >> 3) & 0x03).ok()?;
    let charging_status = ChargingStatus::try_from((packed >> 6) & 0x03).ok()?;

    Some(DeviceStatus {
        serial: serial.to_string(),
        battery_percent: manufacturer_data[2].min(MAX_PERCENT),
        temperature_percent: manufacturer_data[3].min(MAX_PERCENT),
        powered_on: manufacturer_data[5] & 0x01 != 0,
        availability,
        listen_policy,
        charging_status,
        signal_strength,
    })
}
