//! Legacy RSA/AES client for older Tapo firmware.
//!
//! All traffic goes to `POST /app`:
//!
//! 1. `handshake` carries a freshly generated RSA public key; the device
//!    replies with its AES key and IV encrypted to that key.
//! 2. `login_device`, wrapped in `securePassthrough`, exchanges the account
//!    credentials for a session token.
//! 3. Every later command is wrapped the same way and sent to
//!    `/app?token=<token>`.
//!
//! A device that reports the session as expired gets exactly one fresh
//! handshake before the error is surfaced.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    Credentials, commands,
    config::{ClientOptions, ProtocolKind},
    crypto::legacy::{LegacyCipher, LegacyKeyPair},
    error::Error,
    http::HttpTransport,
    response::{DeviceInfo, EnergyUsage, TapoResponse},
    transport::ProtocolClient,
};

const APP_PATH: &str = "/app";

/// Device error code for rejected credentials.
pub const ERROR_CODE_LOGIN_FAILED: i32 = -1501;

/// Device error code for an expired or unknown session.
pub const ERROR_CODE_SESSION_EXPIRED: i32 = 9999;

#[derive(Deserialize)]
struct HandshakeResult {
    key: String,
}

#[derive(Deserialize)]
struct LoginResult {
    token: String,
}

#[derive(Deserialize)]
struct PassthroughResult {
    response: String,
}

struct LegacySession {
    cipher: LegacyCipher,
    cookie: Option<String>,
    token: String,
}

/// Outcome of one wrapped exchange.
enum CallError {
    SessionExpired,
    Failed(Error),
}

impl From<Error> for CallError {
    fn from(err: Error) -> Self {
        CallError::Failed(err)
    }
}

impl CallError {
    fn into_error(self, method: &str) -> Error {
        match self {
            CallError::SessionExpired => Error::Protocol(format!(
                "{} failed: session expired (error code {})",
                method, ERROR_CODE_SESSION_EXPIRED
            )),
            CallError::Failed(err) => err,
        }
    }
}

/// Maps a non-zero device error code.
fn check_error_code(method: &str, code: i32) -> Result<(), CallError> {
    match code {
        0 => Ok(()),
        ERROR_CODE_SESSION_EXPIRED => Err(CallError::SessionExpired),
        ERROR_CODE_LOGIN_FAILED => Err(CallError::Failed(Error::Authentication(format!(
            "{} rejected the credentials (error code {})",
            method, code
        )))),
        other => Err(CallError::Failed(Error::Protocol(format!(
            "{} failed with error code {}",
            method, other
        )))),
    }
}

/// Client speaking the legacy protocol to one device.
pub struct LegacyClient {
    transport: Arc<dyn HttpTransport>,
    credentials: Credentials,
    options: ClientOptions,
    session: Option<LegacySession>,
}

impl LegacyClient {
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

    async fn handshake(&self) -> Result<LegacySession, Error> {
        timeout(self.options.connect_timeout, self.perform_handshake())
            .await
            .map_err(|_| Error::Connection("legacy handshake timed out".into()))?
    }

    async fn perform_handshake(&self) -> Result<LegacySession, Error> {
        let io_timeout = self.options.connect_timeout;

        let key_pair = tokio::task::spawn_blocking(LegacyKeyPair::generate)
            .await
            .map_err(|e| Error::Protocol(format!("RSA key generation task failed: {}", e)))??;

        debug!("Performing legacy handshake");
        let body = commands::handshake(key_pair.public_key_pem());
        let response = self
            .transport
            .post(APP_PATH, body.as_bytes(), None, io_timeout)
            .await?;

        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "handshake returned status {}",
                response.status
            )));
        }

        let envelope: TapoResponse<HandshakeResult> = serde_json::from_slice(&response.body)?;
        let result = envelope.into_result(commands::HANDSHAKE)?;
        let cipher = key_pair.decrypt_session_key(&result.key)?;
        let cookie = response.cookie;

        debug!("Logging in to legacy session");
        let login: TapoResponse<LoginResult> = exchange(
            self.transport.as_ref(),
            &cipher,
            cookie.as_deref(),
            None,
            commands::LOGIN_DEVICE,
            &commands::login_device(&self.credentials),
            io_timeout,
        )
        .await
        .map_err(|e| match e {
            // An unknown session during login is as fatal as a bad login.
            CallError::SessionExpired => Error::Protocol("login rejected: session expired".into()),
            CallError::Failed(err) => err,
        })?;
        let token = login.into_result(commands::LOGIN_DEVICE)?.token;

        debug!("Legacy handshake completed");
        Ok(LegacySession {
            cipher,
            cookie,
            token,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &str,
    ) -> Result<TapoResponse<T>, CallError> {
        let session = self.session.as_ref().ok_or_else(Error::not_connected)?;
        exchange(
            self.transport.as_ref(),
            &session.cipher,
            session.cookie.as_deref(),
            Some(&session.token),
            method,
            body,
            self.options.request_timeout,
        )
        .await
    }

    async fn request<T: DeserializeOwned>(
        &mut self,
        method: &str,
        body: &str,
    ) -> Result<TapoResponse<T>, Error> {
        match self.call(method, body).await {
            Err(CallError::SessionExpired) => {
                debug!(method, "Legacy session expired, handshaking again");
                self.session = None;
                self.session = Some(self.handshake().await?);
                self.call(method, body)
                    .await
                    .map_err(|e| e.into_error(method))
            }
            other => other.map_err(|e| e.into_error(method)),
        }
    }
}

/// Sends one `securePassthrough` request and unwraps both envelopes.
async fn exchange<T: DeserializeOwned>(
    transport: &dyn HttpTransport,
    cipher: &LegacyCipher,
    cookie: Option<&str>,
    token: Option<&str>,
    method: &str,
    inner: &str,
    io_timeout: Duration,
) -> Result<TapoResponse<T>, CallError> {
    let path = match token {
        Some(token) => format!("{}?token={}", APP_PATH, token),
        None => APP_PATH.to_string(),
    };
    let body = commands::secure_passthrough(&cipher.encrypt(inner.as_bytes()));

    debug!(method, "Sending legacy request");
    let response = timeout(
        io_timeout,
        transport.post(&path, body.as_bytes(), cookie, io_timeout),
    )
    .await
    .map_err(|_| {
        Error::Connection(format!("{} timed out after {:?}", method, io_timeout))
    })??;

    if response.status != 200 {
        return Err(Error::Protocol(format!("request returned status {}", response.status)).into());
    }

    let outer: TapoResponse<PassthroughResult> =
        serde_json::from_slice(&response.body).map_err(Error::from)?;
    check_error_code(method, outer.error_code)?;
    let outer = outer.into_result(commands::SECURE_PASSTHROUGH)?;

    let plain = cipher.decrypt(&outer.response)?;
    let inner: TapoResponse<T> = serde_json::from_slice(&plain).map_err(Error::from)?;
    check_error_code(method, inner.error_code)?;
    Ok(inner)
}

#[async_trait]
impl ProtocolClient for LegacyClient {
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
                    warn!(error = %err, "Legacy login rejected");
                }
                Err(err)
            }
        }
    }

    async fn get_device_info(&mut self) -> Result<DeviceInfo, Error> {
        self.request(commands::GET_DEVICE_INFO, &commands::get_device_info())
            .await?
            .into_result(commands::GET_DEVICE_INFO)
    }

    async fn get_energy_usage(&mut self) -> Result<EnergyUsage, Error> {
        self.request(commands::GET_ENERGY_USAGE, &commands::get_energy_usage())
            .await?
            .into_result(commands::GET_ENERGY_USAGE)
    }

    async fn set_device_on(&mut self, on: bool) -> Result<(), Error> {
        // Some firmware omits `result` on success.
        self.request::<serde_json::Value>(commands::SET_DEVICE_INFO, &commands::set_device_on(on))
            .await
            .map(|_| ())
    }

    fn close(&mut self) {
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Legacy
    }
}

impl fmt::Debug for LegacyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyClient")
            .field("credentials", &self.credentials)
            .field("connected", &self.session.is_some())
            .finish()
    }
}
