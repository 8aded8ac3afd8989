//! Typed configuration for devices, protocol clients and the supervisor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Credentials;
use crate::error::Error;
use crate::http::DEFAULT_PORT;

/// Poll interval used when a device is configured with zero.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for a complete connect (handshake) attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single steady-state request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests served by one KLAP session before the client re-handshakes.
pub const DEFAULT_MAX_REQUESTS_PER_SESSION: u32 = 100_000;

/// The wire protocol a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Handshake-based protocol used by current firmware.
    Klap,
    /// RSA/AES protocol used by older firmware.
    Legacy,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Klap => "klap",
            ProtocolKind::Legacy => "legacy",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "klap" => Ok(ProtocolKind::Klap),
            "legacy" => Ok(ProtocolKind::Legacy),
            other => Err(Error::Configuration(format!("unknown protocol: {}", other))),
        }
    }
}

/// Timeouts and session limits for a protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Bounds a whole `connect` call, all handshake rounds included.
    pub connect_timeout: Duration,
    /// Bounds each request after the session is established.
    pub request_timeout: Duration,
    /// KLAP sessions are replaced by a fresh handshake after this many
    /// requests. Zero disables the limit; sequence exhaustion still forces one.
    pub max_requests_per_session: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_requests_per_session: DEFAULT_MAX_REQUESTS_PER_SESSION,
        }
    }
}

/// Configuration of one polled device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_name: String,
    pub room_id: String,
    /// `host` or `host:port`.
    pub ip_address: String,
    pub credentials: Credentials,
    pub protocol: ProtocolKind,
    /// Zero means [`DEFAULT_POLL_INTERVAL`].
    pub poll_interval: Duration,
}

impl DeviceConfig {
    /// Creates a configuration with empty name/room and the default interval.
    pub fn new(
        device_id: impl Into<String>,
        ip_address: impl Into<String>,
        credentials: Credentials,
        protocol: ProtocolKind,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: String::new(),
            room_id: String::new(),
            ip_address: ip_address.into(),
            credentials,
            protocol,
            poll_interval: Duration::ZERO,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces a zero poll interval with `default`.
    pub fn normalized(mut self, default: Duration) -> Self {
        if self.poll_interval.is_zero() {
            self.poll_interval = default;
        }
        self
    }

    /// Rejects configurations that can never work, before any network I/O.
    pub fn validate(&self) -> Result<(), Error> {
        if self.device_id.trim().is_empty() {
            return Err(Error::Configuration("device_id must not be empty".into()));
        }
        if self.credentials.is_blank() {
            return Err(Error::Configuration(format!(
                "device {}: username must not be empty",
                self.device_id
            )));
        }
        self.address().map(|_| ())
    }

    /// Splits `ip_address` into host and port.
    pub fn address(&self) -> Result<(String, u16), Error> {
        let raw = self.ip_address.trim();
        if raw.is_empty() {
            return Err(Error::Configuration(format!(
                "device {}: ip_address must not be empty",
                self.device_id
            )));
        }

        match raw.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                if host.is_empty() {
                    return Err(Error::Configuration(format!(
                        "device {}: missing host in {}",
                        self.device_id, raw
                    )));
                }
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Configuration(format!("device {}: invalid port in {}", self.device_id, raw))
                })?;
                Ok((host.to_string(), port))
            }
            _ => Ok((raw.to_string(), DEFAULT_PORT)),
        }
    }
}

/// Supervisor-wide policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Consecutive failures after which a device is reported offline.
    ///
    /// Authentication failures skip the count: the device goes offline on the
    /// first one and its loop stops polling until the device is re-added.
    pub offline_threshold: u32,
    /// `get_device_info` is refreshed every this many polls (1 = every poll).
    pub device_info_every: u32,
    /// Substituted for a zero `poll_interval`.
    pub default_poll_interval: Duration,
    pub client: ClientOptions,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            offline_threshold: 3,
            device_info_every: 10,
            default_poll_interval: DEFAULT_POLL_INTERVAL,
            client: ClientOptions::default(),
        }
    }
}
