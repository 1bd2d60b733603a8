//! Core functionality for the scanner link
//! This module contains the Bluetooth side, the cloud catalog, and the event
//! channel both report through.

pub mod bluetooth;
pub mod cloud;
pub mod error;
pub mod events;

// Re-export commonly used types
pub use bluetooth::BluetoothManager;
pub use cloud::CatalogFetcher;
pub use error::{CoreError, ErrorKind};
pub use events::{CoreEvent, EventReceiver, EventSink, event_channel};
