//! Device inventory file.
//!
//! The poller reads its device list from a TOML file:
//!
//! ```toml
//! poll_interval_secs = 30
//!
//! [[devices]]
//! id = "kitchen-kettle"
//! name = "Kettle"
//! room = "kitchen"
//! address = "192.168.1.40"
//! protocol = "klap"
//! ```
//!
//! Devices without their own `username`/`password` use the account given on
//! the command line.

use std::{path::Path, time::Duration};

use serde::Deserialize;
use tapo_core::{Credentials, DeviceConfig, Error, ProtocolKind};

/// Top-level inventory file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    /// Fallback poll interval for devices that do not set one.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// One `[[devices]]` table.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    pub address: String,
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

fn default_protocol() -> ProtocolKind {
    ProtocolKind::Klap
}

impl Inventory {
    /// Reads and parses an inventory file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Resolves every entry into a [`DeviceConfig`].
    ///
    /// `default_credentials` is used for entries without their own account.
    /// An entry that sets only one of `username` and `password` is rejected.
    pub fn device_configs(
        &self,
        default_credentials: Option<&Credentials>,
    ) -> Result<Vec<DeviceConfig>, Error> {
        self.devices
            .iter()
            .map(|entry| entry.to_config(default_credentials, self.poll_interval_secs))
            .collect()
    }
}

impl DeviceEntry {
    fn to_config(
        &self,
        default_credentials: Option<&Credentials>,
        default_interval: Option<u64>,
    ) -> Result<DeviceConfig, Error> {
        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Credentials::new(username, password),
            (None, None) => default_credentials.cloned().ok_or_else(|| {
                Error::Configuration(format!(
                    "device {}: no credentials in file or on the command line",
                    self.id
                ))
            })?,
            _ => {
                return Err(Error::Configuration(format!(
                    "device {}: username and password must be set together",
                    self.id
                )));
            }
        };

        let mut config = DeviceConfig::new(&self.id, &self.address, credentials, self.protocol);
        if let Some(name) = &self.name {
            config = config.with_name(name);
        }
        if let Some(room) = &self.room {
            config = config.with_room(room);
        }
        if let Some(secs) = self.poll_interval_secs.or(default_interval) {
            config = config.with_poll_interval(Duration::from_secs(secs));
        }
        Ok(config)
    }
}
