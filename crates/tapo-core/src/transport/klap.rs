//! KLAP client for current Tapo firmware.
//!
//! # Protocol Overview
//!
//! 1. **Handshake 1**: client POSTs a fresh 16-byte `local_seed` to
//!    `/app/handshake1`; the device answers `remote_seed(16) ++ server_hash(32)`
//!    and sets a `TP_SESSIONID` cookie.
//! 2. The client checks `server_hash == sha256(local_seed ++ remote_seed ++
//!    auth_hash)`. A mismatch means the device was set up with different
//!    credentials.
//! 3. **Handshake 2**: client POSTs `sha256(remote_seed ++ local_seed ++
//!    auth_hash)` to `/app/handshake2` with the cookie.
//! 4. **Request**: each command is framed by [`KlapCipher`] and POSTed to
//!    `/app/request?seq=<n>`.
//!
//! The session is replaced by a new handshake after
//! [`ClientOptions::max_requests_per_session`] requests, and always before the
//! sequence counter would wrap.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    Credentials, commands,
    config::{ClientOptions, ProtocolKind},
    crypto::klap::{KlapCipher, SEED_LEN, client_hash, server_hash},
    error::Error,
    http::HttpTransport,
    response::{DeviceInfo, EnergyUsage, TapoResponse},
    transport::ProtocolClient,
};

const HANDSHAKE1_PATH: &str = "/app/handshake1";
const HANDSHAKE2_PATH: &str = "/app/handshake2";

/// Minimum handshake-1 reply: `remote_seed(16) ++ server_hash(32)`.
const HANDSHAKE1_RESPONSE_LEN: usize = SEED_LEN + 32;

struct KlapSession {
    cipher: KlapCipher,
    cookie: Option<String>,
    requests: u32,
}

/// Client speaking KLAP to one device.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tapo_core::{ClientOptions, Credentials, HttpClient, KlapClient, ProtocolClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), tapo_core::Error> {
///     let transport = Arc::new(HttpClient::new("192.168.1.50", 80));
///     let credentials = Credentials::new("user@example.com", "password");
///     let mut client = KlapClient::new(transport, credentials, ClientOptions::default());
///
///     client.connect().await?;
///     let usage = client.get_energy_usage().await?;
///     println!("{} W", usage.current_power_watts());
///     Ok(())
/// }
/// ```
pub struct KlapClient {
    transport: Arc<dyn HttpTransport>,
    credentials: Credentials,
    options: ClientOptions,
    session: Option<KlapSession>,
}

impl KlapClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Credentials,
        options: ClientOptions,
    ) -> Self {
        Self {
            transport,
            credentials,
            options,
            session: None,
        }
    }

    /// Sequence number of the last request, if connected.
    pub fn seq(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.cipher.seq())
    }

    async fn handshake(&self) -> Result<KlapSession, Error> {
        timeout(self.options.connect_timeout, self.perform_handshake())
            .await
            .map_err(|_| Error::Connection("KLAP handshake timed out".into()))?
    }

    async fn perform_handshake(&self) -> Result<KlapSession, Error> {
        let io_timeout = self.options.connect_timeout;

        // Fresh seed on every attempt, never reused after a failure.
        let mut local_seed = [0u8; SEED_LEN];
        rand::rng().fill_bytes(&mut local_seed);

        debug!("Performing KLAP handshake1");
        let response = self
            .transport
            .post(HANDSHAKE1_PATH, &local_seed, None, io_timeout)
            .await?;

        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "handshake1 returned status {}",
                response.status
            )));
        }
        if response.body.len() < HANDSHAKE1_RESPONSE_LEN {
            return Err(Error::Protocol(format!(
                "handshake1 response has unexpected length: {} (expected {})",
                response.body.len(),
                HANDSHAKE1_RESPONSE_LEN
            )));
        }

        let remote_seed = &response.body[..SEED_LEN];
        let device_hash = &response.body[SEED_LEN..HANDSHAKE1_RESPONSE_LEN];
        let auth_hash = self.credentials.auth_hash();

        if server_hash(&local_seed, remote_seed, &auth_hash) != device_hash {
            return Err(Error::Authentication("server hash verification failed".into()));
        }

        let cookie = response.cookie.clone();
        let payload = client_hash(&local_seed, remote_seed, &auth_hash);

        debug!("Performing KLAP handshake2");
        let response2 = self
            .transport
            .post(HANDSHAKE2_PATH, &payload, cookie.as_deref(), io_timeout)
            .await?;

        if response2.status != 200 {
            return Err(Error::Protocol(format!(
                "handshake2 returned status {}",
                response2.status
            )));
        }

        let cipher = KlapCipher::derive(&local_seed, remote_seed, &auth_hash);
        debug!(seq = cipher.seq(), "KLAP handshake completed");

        Ok(KlapSession {
            cipher,
            cookie,
            requests: 0,
        })
    }

    fn needs_rehandshake(&self, session: &KlapSession) -> bool {
        let limit = self.options.max_requests_per_session;
        session.cipher.seq() == u32::MAX || (limit > 0 && session.requests >= limit)
    }

    async fn request<T: DeserializeOwned>(&mut self, method: &str, body: &str) -> Result<T, Error> {
        let session = self.session.as_ref().ok_or_else(Error::not_connected)?;

        if self.needs_rehandshake(session) {
            debug!(requests = session.requests, "Renewing KLAP session");
            self.session = None;
            self.session = Some(self.handshake().await?);
        }

        let transport = Arc::clone(&self.transport);
        let request_timeout = self.options.request_timeout;
        let session = self.session.as_mut().ok_or_else(Error::not_connected)?;

        let (seq, framed) = session
            .cipher
            .encrypt(body.as_bytes())
            .map_err(|e| Error::Protocol(e.to_string()))?;
        session.requests += 1;

        debug!(method, seq, len = framed.len(), "Sending KLAP request");
        let path = format!("/app/request?seq={}", seq);
        let response = timeout(
            request_timeout,
            transport.post(&path, &framed, session.cookie.as_deref(), request_timeout),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!("{} timed out after {:?}", method, request_timeout))
        })??;

        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "request returned status {}",
                response.status
            )));
        }

        let plain = session
            .cipher
            .decrypt(&response.body, seq)
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let envelope: TapoResponse<T> = serde_json::from_slice(&plain)?;
        envelope.into_result(method)
    }
}

#[async_trait]
impl ProtocolClient for KlapClient {
    async fn connect(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            return Ok(());
        }
        match self.handshake().await {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                if matches!(err, Error::Authentication(_)) {
                    warn!(error = %err, "KLAP authentication rejected");
                }
                Err(err)
            }
        }
    }

    async fn get_device_info(&mut self) -> Result<DeviceInfo, Error> {
        self.request(commands::GET_DEVICE_INFO, &commands::get_device_info())
            .await
    }

    async fn get_energy_usage(&mut self) -> Result<EnergyUsage, Error> {
        self.request(commands::GET_ENERGY_USAGE, &commands::get_energy_usage())
            .await
    }

    async fn set_device_on(&mut self, _on: bool) -> Result<(), Error> {
        Err(Error::UnsupportedOperation(
            "device control is not available over KLAP".into(),
        ))
    }

    fn close(&mut self) {
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Klap
    }
}

// Implement Debug manually to avoid exposing session material
impl fmt::Debug for KlapClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapClient")
            .field("credentials", &self.credentials)
            .field("connected", &self.session.is_some())
            .field("seq", &self.seq())
            .finish()
    }
}
