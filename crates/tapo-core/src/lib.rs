//! Core library for polling TP-Link Tapo smart plugs on a local network.
//!
//! Tapo plugs speak one of two incompatible local protocols depending on
//! firmware: the older RSA/AES "legacy" scheme or the handshake-based KLAP
//! scheme pushed out by later updates. This crate implements both behind the
//! [`ProtocolClient`] trait and adds a [`DeviceSupervisor`] that polls many
//! devices concurrently, one task per device.
//!
//! # Example
//!
//! ```no_run
//! use tapo_core::{ClientOptions, Client, Credentials, DeviceConfig, ProtocolClient, ProtocolKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tapo_core::Error> {
//!     let config = DeviceConfig::new(
//!         "living-room-tv",
//!         "192.168.1.42",
//!         Credentials::new("user@example.com", "password"),
//!         ProtocolKind::Klap,
//!     );
//!
//!     let mut client = Client::from_config(&config, ClientOptions::default())?;
//!     client.connect().await?;
//!
//!     let info = client.get_device_info().await?;
//!     let usage = client.get_energy_usage().await?;
//!     println!("{} draws {} W", info.model, usage.current_power_watts());
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! Both protocols authenticate with the same credential digest,
//! `sha256(sha1(username) ++ sha1(password))` (see [`crypto::auth`]).
//!
//! - **KLAP**: two handshake rounds prove both sides hold the digest, then
//!   every request is AES-128-CBC encrypted and signed under a per-request
//!   sequence number. Telemetry only.
//! - **Legacy**: an RSA exchange delivers an AES key, a login yields a token,
//!   and commands travel as encrypted JSON. Telemetry and relay control.

pub mod commands;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod http;
pub mod response;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ClientOptions, DeviceConfig, ProtocolKind, SupervisorConfig};
pub use credentials::Credentials;
pub use error::{Error, ErrorKind};
pub use http::{HttpClient, HttpResponse, HttpTransport};
pub use response::{DeviceInfo, EnergyUsage};
pub use supervisor::{
    ClientFactory, DeviceEvent, DeviceStatus, DeviceSupervisor, EnergyReading, ReadingSink,
    SupervisorBuilder, TcpClientFactory, TracingSink,
};
pub use transport::{Client, KlapClient, LegacyClient, ProtocolClient};

/// The version of the tapo-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
