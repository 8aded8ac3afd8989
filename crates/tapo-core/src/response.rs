//! Typed response structures for Tapo device JSON responses.
//!
//! Both protocols wrap every reply as `{"error_code": n, "result": {...}}`.
//! [`TapoResponse::into_result`] unwraps that envelope into the typed payload.
//!
//! # Example
//!
//! ```
//! use tapo_core::response::{DeviceInfo, TapoResponse};
//!
//! let json = r#"{"error_code":0,"result":{"device_id":"80AB","model":"P110",
//!     "fw_ver":"1.3.0","device_on":true,"rssi":-48}}"#;
//! let response: TapoResponse<DeviceInfo> = serde_json::from_str(json).unwrap();
//! let info = response.into_result("get_device_info").unwrap();
//! assert_eq!(info.model, "P110");
//! assert!(info.is_on);
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Generic reply envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct TapoResponse<T> {
    pub error_code: i32,
    pub result: Option<T>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl<T> TapoResponse<T> {
    /// Returns the payload, or a protocol error if the device reported a
    /// non-zero code or omitted the result.
    pub fn into_result(self, method: &str) -> Result<T, Error> {
        if self.error_code != 0 {
            return Err(Error::Protocol(match self.msg {
                Some(msg) => format!("{} failed with error code {}: {}", method, self.error_code, msg),
                None => format!("{} failed with error code {}", method, self.error_code),
            }));
        }
        self.result
            .ok_or_else(|| Error::Protocol(format!("{} response has no result", method)))
    }
}

/// Device metadata returned by `get_device_info`.
///
/// Replaced wholesale on every successful query.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,

    /// Model name, e.g. "P110".
    pub model: String,

    #[serde(rename = "fw_ver")]
    pub firmware_version: String,

    /// Relay state.
    #[serde(rename = "device_on")]
    pub is_on: bool,

    /// WiFi signal strength in dBm.
    #[serde(default)]
    pub rssi: i32,

    /// Base64-encoded name set in the Tapo app.
    #[serde(default)]
    pub nickname: Option<String>,

    #[serde(default)]
    pub hw_ver: Option<String>,

    #[serde(default)]
    pub mac: Option<String>,
}

impl DeviceInfo {
    /// Decodes the app nickname, falling back to the raw value when it is not
    /// base64.
    pub fn display_name(&self) -> Option<String> {
        let raw = self.nickname.as_deref()?;
        match BASE64.decode(raw) {
            Ok(bytes) => Some(String::from_utf8(bytes).unwrap_or_else(|_| raw.to_string())),
            Err(_) => Some(raw.to_string()),
        }
    }
}

/// Energy counters returned by `get_energy_usage`.
///
/// Point-in-time snapshot; the client never accumulates across readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnergyUsage {
    /// Instantaneous draw in milliwatts.
    #[serde(rename = "current_power")]
    pub current_power_milliwatts: u64,

    #[serde(rename = "today_energy")]
    pub today_energy_wh: u64,

    #[serde(rename = "month_energy")]
    pub month_energy_wh: u64,

    #[serde(rename = "today_runtime")]
    pub today_runtime_minutes: u64,

    #[serde(rename = "month_runtime", default)]
    pub month_runtime_minutes: u64,
}

impl EnergyUsage {
    pub fn current_power_watts(&self) -> f64 {
        self.current_power_milliwatts as f64 / 1000.0
    }
}
