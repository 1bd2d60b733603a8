use serde::{Deserialize, Serialize};

use crate::core::bluetooth::BLUETOOTH_OPERATION_TIMEOUT_SECS;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Upper bound for every connect, discover, subscribe, read and write
    pub operation_timeout_secs: u64,

    /// Advertisements weaker than this are ignored; `None` accepts all
    pub min_rssi: Option<i16>,

    /// Number of sessions kept before idle ones are evicted; `None` keeps all
    pub max_sessions: Option<usize>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            operation_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            min_rssi: None,
            max_sessions: None,
        }
    }
}
