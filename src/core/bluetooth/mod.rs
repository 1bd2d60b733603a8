//! Bluetooth functionality for the scanner link
//! This module handles all bluetooth operations including scanning,
//! decoding advertisements, connecting, and exchanging Wi-Fi and power data
//! with the scanners.

mod advertisement;
mod connection;
mod constants;
mod manager;
mod notification;
mod protocol;
mod scanner;
mod session;
mod session_manager;
#[cfg(test)]
mod testing;
mod transport;

// Re-export types that should be publicly accessible
pub use advertisement::{
    Availability, ChargingStatus, DeviceStatus, ListenPolicy, decode_advertisement,
    serial_from_name,
};
pub use connection::ConnectionManager;
pub use constants::*; // Re-export all constants
pub use manager::BluetoothManager;
pub use notification::NotificationHandler;
pub use protocol::{
    ProbeCommand, WifiConfig, decode_power_status, decode_wifi_info, encode_power_request,
    encode_wifi_request,
};
pub use scanner::{BluetoothScanner, manufacturer_bytes};
pub use session::{SessionRegistry, SessionSnapshot, SessionState, WriteRequest};
pub use session_manager::{SessionHandle, SessionManager};
pub use transport::{BluestLink, InfoProperties, ProbeLink, ServiceGroup, ValueStream};
