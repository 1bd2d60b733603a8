//! Scanner configuration protocol
//! Requests written to and status read from the Wi-Fi and power characteristics.
//! Wi-Fi payloads are small YAML mappings, power payloads are a single byte.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::core::bluetooth::constants::{POWER_OFF_KEY, POWER_ON_KEY};
use crate::core::bluetooth::transport::ServiceGroup;

/// Wi-Fi settings reported by the scanner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    /// SSID of the scanner's current network
    pub ssid: String,
    /// Password of the network, only meaningful when the scanner hosts it
    pub password: String,
    /// IPv4 address if reported, otherwise IPv6, otherwise empty
    pub address: String,
    /// TCP port for control connections
    pub control_port: u16,
}

/// A request the user wants the scanner to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCommand {
    /// Host its own network (`ap: true`); the scanner picks the credentials
    WifiDirect,
    /// Join an existing network
    JoinNetwork { ssid: String, password: String },
    /// Power on or off
    Power(bool),
}

impl ProbeCommand {
    /// The characteristic group whose request characteristic receives this command
    pub fn group(&self) -> ServiceGroup {
        match self {
            Self::WifiDirect | Self::JoinNetwork { .. } => ServiceGroup::Wifi,
            Self::Power(_) => ServiceGroup::Power,
        }
    }

    /// Convert the command to its wire representation
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::WifiDirect => encode_wifi_request(true, None, None),
            Self::JoinNetwork { ssid, password } => {
                encode_wifi_request(false, Some(ssid), Some(password))
            }
            Self::Power(on) => Some(encode_power_request(*on)),
        }
    }
}

#[derive(Serialize)]
struct WifiRequestBody<'a> {
    ap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pw: Option<&'a str>,
}

/// Formats a request for the scanner to change Wi-Fi networks.
///
/// With `wifi_direct` the scanner assigns its own credentials, so `ssid` and
/// `password` are left out of the payload.
pub fn encode_wifi_request(
    wifi_direct: bool,
    ssid: Option<&str>,
    password: Option<&str>,
) -> Option<Vec<u8>> {
    let body = if wifi_direct {
        WifiRequestBody { ap: true, ssid: None, pw: None }
    } else {
        WifiRequestBody { ap: false, ssid, pw: password }
    };
    serde_yaml::to_string(&body).ok().map(String::into_bytes)
}

fn string_field(map: &Mapping, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Parses the Wi-Fi info reported by the scanner.
///
/// Every field is optional; only a payload that is not UTF-8 or not a
/// mapping is rejected.
pub fn decode_wifi_info(payload: &[u8]) -> Option<WifiConfig> {
    let text = std::str::from_utf8(payload).ok()?;
    debug!("Wi-Fi info received: {}", text);
    let value: Value = serde_yaml::from_str(text).ok()?;
    let map = value.as_mapping()?;

    let address = string_field(map, "ip4")
        .or_else(|| string_field(map, "ip6"))
        .unwrap_or_default();
    let control_port = map
        .get("ctl")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .unwrap_or(0);

    Some(WifiConfig {
        ssid: string_field(map, "ssid").unwrap_or_default(),
        password: string_field(map, "pw").unwrap_or_default(),
        address,
        control_port,
    })
}

pub fn encode_power_request(on: bool) -> Vec<u8> {
    vec![if on { POWER_ON_KEY } else { POWER_OFF_KEY }]
}

/// Parses the power info characteristic; powered when the first byte is 1.
pub fn decode_power_status(payload: &[u8]) -> Option<bool> {
    payload.first().map(|byte| *byte == 1)
}
