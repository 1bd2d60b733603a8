//! Constants used throughout the bluetooth layer
//! This module contains the advertised identity of the scanners, the UUIDs of
//! the Wi-Fi and power services, and the timing values used for link operations.

use uuid::Uuid;

/// Prefix of the advertised name; the serial number is the remainder
pub const VENDOR_NAME_PREFIX: &str = "CUS-";

/// First two bytes of the manufacturer data (company id 0x02FB, little endian)
pub const VENDOR_SIGNATURE: [u8; 2] = [0xFB, 0x02];

/// Minimum manufacturer data length: signature, battery, temperature, packed status, power
pub const MIN_MANUFACTURER_DATA_LEN: usize = 6;

/// Upper bound of the percentage fields in the advertisement
pub const MAX_PERCENT: u8 = 100;

/// Wi-Fi info service
pub const UUID_WIFI_SERVICE: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed780);
/// Wi-Fi info characteristic (read/notify)
pub const UUID_WIFI_INFO_CHAR: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed781);
/// Wi-Fi request characteristic (write)
pub const UUID_WIFI_REQUEST_CHAR: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed782);

/// Power service
pub const UUID_POWER_SERVICE: Uuid = Uuid::from_u128(0x8c853b6a_2297_44c1_8277_73627c8d2abc);
/// Power info characteristic (read/notify)
pub const UUID_POWER_INFO_CHAR: Uuid = Uuid::from_u128(0x8c853b6a_2297_44c1_8277_73627c8d2abd);
/// Power request characteristic (write)
pub const UUID_POWER_REQUEST_CHAR: Uuid = Uuid::from_u128(0x8c853b6a_2297_44c1_8277_73627c8d2abe);

/// Payload written to the power request characteristic to power on
pub const POWER_ON_KEY: u8 = 0x01;
/// Payload written to the power request characteristic to power off
pub const POWER_OFF_KEY: u8 = 0x00;

/// Timeout for Bluetooth operations in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;
