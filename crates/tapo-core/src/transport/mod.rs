//! Protocol clients for Tapo devices.
//!
//! Two mutually incompatible protocols are in the field:
//!
//! - [`KlapClient`]: two-round seed handshake, per-request signed AES framing
//!   (current firmware; telemetry only)
//! - [`LegacyClient`]: RSA key exchange, AES-wrapped JSON with a login token
//!   (older firmware; telemetry and actuation)
//!
//! Both implement [`ProtocolClient`]. [`Client`] is the closed set of the two,
//! so callers pick a variant once from [`ProtocolKind`] and stay
//! protocol-agnostic afterwards.

pub mod klap;
pub mod legacy;

pub use klap::KlapClient;
pub use legacy::LegacyClient;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    Credentials,
    config::{ClientOptions, DeviceConfig, ProtocolKind},
    error::Error,
    http::{HttpClient, HttpTransport},
    response::{DeviceInfo, EnergyUsage},
};

/// Operations shared by both protocol sessions.
///
/// `connect` must succeed before anything else; otherwise the other calls
/// fail with a `"not connected"` protocol error. A client owns its session
/// exclusively, hence `&mut self` throughout.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Runs the handshake. A no-op when a session is already established.
    async fn connect(&mut self) -> Result<(), Error>;

    async fn get_device_info(&mut self) -> Result<DeviceInfo, Error>;

    async fn get_energy_usage(&mut self) -> Result<EnergyUsage, Error>;

    /// Switches the relay. Only the legacy protocol supports this.
    async fn set_device_on(&mut self, on: bool) -> Result<(), Error>;

    /// Discards the session. The next call needs a fresh `connect`.
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    fn protocol(&self) -> ProtocolKind;
}

/// A protocol client of either kind.
#[derive(Debug)]
pub enum Client {
    Klap(KlapClient),
    Legacy(LegacyClient),
}

impl Client {
    /// Builds an unconnected client of `kind` over `transport`.
    pub fn new(
        kind: ProtocolKind,
        transport: Arc<dyn HttpTransport>,
        credentials: Credentials,
        options: ClientOptions,
    ) -> Self {
        match kind {
            ProtocolKind::Klap => Client::Klap(KlapClient::new(transport, credentials, options)),
            ProtocolKind::Legacy => {
                Client::Legacy(LegacyClient::new(transport, credentials, options))
            }
        }
    }

    /// Validates `config` and builds a client that talks TCP to its address.
    pub fn from_config(config: &DeviceConfig, options: ClientOptions) -> Result<Self, Error> {
        config.validate()?;
        let (host, port) = config.address()?;
        let transport: Arc<dyn HttpTransport> = Arc::new(HttpClient::new(host, port));
        Ok(Self::new(
            config.protocol,
            transport,
            config.credentials.clone(),
            options,
        ))
    }
}

#[async_trait]
impl ProtocolClient for Client {
    async fn connect(&mut self) -> Result<(), Error> {
        match self {
            Client::Klap(c) => c.connect().await,
            Client::Legacy(c) => c.connect().await,
        }
    }

    async fn get_device_info(&mut self) -> Result<DeviceInfo, Error> {
        match self {
            Client::Klap(c) => c.get_device_info().await,
            Client::Legacy(c) => c.get_device_info().await,
        }
    }

    async fn get_energy_usage(&mut self) -> Result<EnergyUsage, Error> {
        match self {
            Client::Klap(c) => c.get_energy_usage().await,
            Client::Legacy(c) => c.get_energy_usage().await,
        }
    }

    async fn set_device_on(&mut self, on: bool) -> Result<(), Error> {
        match self {
            Client::Klap(c) => c.set_device_on(on).await,
            Client::Legacy(c) => c.set_device_on(on).await,
        }
    }

    fn close(&mut self) {
        match self {
            Client::Klap(c) => c.close(),
            Client::Legacy(c) => c.close(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Client::Klap(c) => c.is_connected(),
            Client::Legacy(c) => c.is_connected(),
        }
    }

    fn protocol(&self) -> ProtocolKind {
        match self {
            Client::Klap(_) => ProtocolKind::Klap,
            Client::Legacy(_) => ProtocolKind::Legacy,
        }
    }
}
