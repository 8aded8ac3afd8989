//! JSON request bodies for Tapo device methods.
//!
//! Every request is `{"method": ..., "params": ...}`. Methods without
//! parameters omit `params` entirely.
//!
//! # Example
//!
//! ```
//! use tapo_core::commands;
//!
//! assert_eq!(commands::get_device_info(), r#"{"method":"get_device_info"}"#);
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::Credentials;
use crate::crypto::auth::sha1;

/// Query device metadata and relay state.
pub const GET_DEVICE_INFO: &str = "get_device_info";

/// Query energy counters.
pub const GET_ENERGY_USAGE: &str = "get_energy_usage";

/// Change device settings such as the relay state.
pub const SET_DEVICE_INFO: &str = "set_device_info";

/// Legacy RSA key exchange.
pub const HANDSHAKE: &str = "handshake";

/// Legacy login inside the encrypted channel.
pub const LOGIN_DEVICE: &str = "login_device";

/// Legacy envelope carrying an encrypted inner request.
pub const SECURE_PASSTHROUGH: &str = "securePassthrough";

fn request(method: &str) -> String {
    json!({ "method": method }).to_string()
}

fn request_with(method: &str, params: Value) -> String {
    json!({ "method": method, "params": params }).to_string()
}

pub fn get_device_info() -> String {
    request(GET_DEVICE_INFO)
}

pub fn get_energy_usage() -> String {
    request(GET_ENERGY_USAGE)
}

/// Switch the relay on or off.
pub fn set_device_on(on: bool) -> String {
    request_with(SET_DEVICE_INFO, json!({ "device_on": on }))
}

/// Legacy handshake carrying the client's PEM public key.
pub fn handshake(public_key_pem: &str) -> String {
    request_with(HANDSHAKE, json!({ "key": public_key_pem }))
}

/// Legacy login. The username travels as `base64(hex(sha1(username)))` and the
/// password as `base64(password)`, both inside the AES channel.
pub fn login_device(credentials: &Credentials) -> String {
    let username = BASE64.encode(hex::encode(sha1(credentials.username.as_bytes())));
    let password = BASE64.encode(credentials.expose_password());
    request_with(
        LOGIN_DEVICE,
        json!({ "username": username, "password": password }),
    )
}

/// Wraps an encrypted, base64-encoded inner request.
pub fn secure_passthrough(encrypted_request: &str) -> String {
    request_with(SECURE_PASSTHROUGH, json!({ "request": encrypted_request }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameterless_requests() {
        assert_eq!(get_device_info(), r#"{"method":"get_device_info"}"#);
        assert_eq!(get_energy_usage(), r#"{"method":"get_energy_usage"}"#);
    }

    #[test]
    fn test_set_device_on() {
        let value: Value = serde_json::from_str(&set_device_on(true)).unwrap();
        assert_eq!(value["method"], "set_device_info");
        assert_eq!(value["params"]["device_on"], true);
    }

    #[test]
    fn test_login_device_encoding() {
        let creds = Credentials::new("alice", "secret");
        let value: Value = serde_json::from_str(&login_device(&creds)).unwrap();
        let username = value["params"]["username"].as_str().unwrap();
        let decoded = String::from_utf8(BASE64.decode(username).unwrap()).unwrap();
        assert_eq!(decoded, hex::encode(sha1(b"alice")));
        assert_eq!(value["params"]["password"], BASE64.encode("secret"));
    }

    #[test]
    fn test_handshake_carries_key() {
        let value: Value = serde_json::from_str(&handshake("-----BEGIN PUBLIC KEY-----")).unwrap();
        assert_eq!(value["method"], "handshake");
        assert_eq!(value["params"]["key"], "-----BEGIN PUBLIC KEY-----");
    }

    #[test]
    fn test_secure_passthrough() {
        let value: Value = serde_json::from_str(&secure_passthrough("ZW5j")).unwrap();
        assert_eq!(value["method"], "securePassthrough");
        assert_eq!(value["params"]["request"], "ZW5j");
    }
}
