//! Account credentials for Tapo devices.
//!
//! Both local protocols authenticate against the TP-Link account the plug was
//! set up with. Passwords are stored using [`SecretString`] from the `secrecy`
//! crate so they never end up in logs by accident; use
//! [`Credentials::expose_password()`] when the raw value is genuinely needed.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

use crate::crypto::auth::{AuthHash, auth_hash};

/// TP-Link account credentials for one plug.
///
/// # Example
///
/// ```
/// use tapo_core::Credentials;
///
/// let account = Credentials::new("owner@example.net", "plug-pass");
/// assert_eq!(account.username, "owner@example.net");
/// assert_eq!(account.auth_hash().len(), 32);
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The account username (an email address for TP-Link cloud accounts).
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Whether the username is empty or whitespace. Both protocols need one,
    /// so such credentials fail validation before any traffic is sent.
    pub fn is_blank(&self) -> bool {
        self.username.trim().is_empty()
    }

    /// Raw password, for the legacy login and the handshake digest only.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Credential digest used on the wire. See [`auth_hash`].
    pub fn auth_hash(&self) -> AuthHash {
        auth_hash(&self.username, self.expose_password())
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username && self.expose_password() == other.expose_password()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
