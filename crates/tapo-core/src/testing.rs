//! In-process fake devices for unit tests.
//!
//! Each fake implements [`HttpTransport`] by playing the device side of its
//! protocol, so clients and the supervisor run their real code paths without
//! sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey, pkcs8::DecodePublicKey, rand_core::OsRng};
use serde_json::{Value, json};

use crate::{
    Credentials,
    config::{ClientOptions, DeviceConfig},
    crypto::{
        auth::{AuthHash, auth_hash, sha1},
        klap::{KlapCipher, client_hash, server_hash},
        legacy::LegacyCipher,
    },
    error::Error,
    http::{HttpResponse, HttpTransport},
    supervisor::ClientFactory,
    transport::Client,
};

fn reply(status: u16, body: Vec<u8>, cookie: Option<String>) -> HttpResponse {
    HttpResponse {
        status,
        body,
        cookie,
    }
}

/// Relay and meter state shared by both fakes.
struct PlugState {
    device_on: bool,
    power_mw: u64,
}

impl PlugState {
    fn new() -> Self {
        Self {
            device_on: true,
            power_mw: 1_000,
        }
    }

    fn device_info(&self, device_id: &str) -> Value {
        json!({
            "device_id": device_id,
            "model": "P110",
            "fw_ver": "1.2.3 Build 240101",
            "hw_ver": "1.0",
            "device_on": self.device_on,
            "rssi": -50,
            "nickname": BASE64.encode("Fake plug"),
        })
    }

    fn energy_usage(&self) -> Value {
        json!({
            "current_power": self.power_mw,
            "today_energy": 120,
            "month_energy": 3400,
            "today_runtime": 60,
            "month_runtime": 1800,
        })
    }

    /// Answers an inner `{"method", "params"}` request.
    fn handle(&mut self, device_id: &str, request: &Value) -> Value {
        match request["method"].as_str() {
            Some("get_device_info") => json!({"error_code": 0, "result": self.device_info(device_id)}),
            Some("get_energy_usage") => json!({"error_code": 0, "result": self.energy_usage()}),
            Some("set_device_info") => {
                if let Some(on) = request["params"]["device_on"].as_bool() {
                    self.device_on = on;
                }
                json!({"error_code": 0})
            }
            _ => json!({"error_code": -1002}),
        }
    }
}

#[derive(Default)]
struct KlapState {
    pending: Option<([u8; 16], [u8; 16])>,
    cookie: Option<String>,
    cipher: Option<KlapCipher>,
    local_seeds: Vec<[u8; 16]>,
    request_seqs: Vec<u32>,
    handshakes: usize,
}

/// Device side of KLAP.
pub(crate) struct FakeKlapDevice {
    auth_hash: Mutex<AuthHash>,
    state: Mutex<KlapState>,
    plug: Mutex<PlugState>,
    calls: AtomicUsize,
    unreachable: AtomicBool,
    reject_handshake2: AtomicBool,
    truncate_handshake1: AtomicBool,
    tamper_responses: AtomicBool,
}

impl FakeKlapDevice {
    pub(crate) fn new(username: &str, password: &str) -> Self {
        Self {
            auth_hash: Mutex::new(auth_hash(username, password)),
            state: Mutex::new(KlapState::default()),
            plug: Mutex::new(PlugState::new()),
            calls: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            reject_handshake2: AtomicBool::new(false),
            truncate_handshake1: AtomicBool::new(false),
            tamper_responses: AtomicBool::new(false),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Completed handshakes.
    pub(crate) fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    pub(crate) fn local_seeds(&self) -> Vec<[u8; 16]> {
        self.state.lock().unwrap().local_seeds.clone()
    }

    pub(crate) fn request_seqs(&self) -> Vec<u32> {
        self.state.lock().unwrap().request_seqs.clone()
    }

    pub(crate) fn is_on(&self) -> bool {
        self.plug.lock().unwrap().device_on
    }

    pub(crate) fn set_power_milliwatts(&self, power: u64) {
        self.plug.lock().unwrap().power_mw = power;
    }

    pub(crate) fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    /// Re-provisions the device with another account, ending the session.
    pub(crate) fn change_credentials(&self, username: &str, password: &str) {
        *self.auth_hash.lock().unwrap() = auth_hash(username, password);
        let mut state = self.state.lock().unwrap();
        state.cipher = None;
        state.cookie = None;
    }

    fn auth_hash(&self) -> AuthHash {
        *self.auth_hash.lock().unwrap()
    }

    pub(crate) fn reject_handshake2(&self, value: bool) {
        self.reject_handshake2.store(value, Ordering::SeqCst);
    }

    pub(crate) fn truncate_handshake1(&self, value: bool) {
        self.truncate_handshake1.store(value, Ordering::SeqCst);
    }

    pub(crate) fn tamper_responses(&self, value: bool) {
        self.tamper_responses.store(value, Ordering::SeqCst);
    }

    fn handshake1(&self, body: &[u8]) -> HttpResponse {
        let mut local = [0u8; 16];
        local.copy_from_slice(&body[..16]);
        let mut remote = [0u8; 16];
        rand::rng().fill_bytes(&mut remote);

        let mut state = self.state.lock().unwrap();
        state.local_seeds.push(local);
        state.pending = Some((local, remote));
        let cookie = format!("KLAP-{}", state.local_seeds.len());
        state.cookie = Some(cookie.clone());
        state.cipher = None;

        let mut payload = remote.to_vec();
        payload.extend_from_slice(&server_hash(&local, &remote, &self.auth_hash()));
        if self.truncate_handshake1.load(Ordering::SeqCst) {
            payload.truncate(40);
        }
        reply(200, payload, Some(cookie))
    }

    fn handshake2(&self, body: &[u8], cookie: Option<&str>) -> HttpResponse {
        let auth_hash = self.auth_hash();
        let mut state = self.state.lock().unwrap();
        let Some((local, remote)) = state.pending else {
            return reply(400, Vec::new(), None);
        };
        if self.reject_handshake2.load(Ordering::SeqCst)
            || cookie != state.cookie.as_deref()
            || body != client_hash(&local, &remote, &auth_hash)
        {
            return reply(403, Vec::new(), None);
        }
        state.pending = None;
        state.cipher = Some(KlapCipher::derive(&local, &remote, &auth_hash));
        state.handshakes += 1;
        reply(200, Vec::new(), None)
    }

    fn request(&self, path: &str, body: &[u8], cookie: Option<&str>) -> HttpResponse {
        let Some(seq) = path
            .split_once("seq=")
            .and_then(|(_, seq)| seq.parse::<u32>().ok())
        else {
            return reply(400, Vec::new(), None);
        };

        let mut state = self.state.lock().unwrap();
        if cookie != state.cookie.as_deref() {
            return reply(403, Vec::new(), None);
        }
        let Some(cipher) = state.cipher.clone() else {
            return reply(403, Vec::new(), None);
        };
        let Ok(plain) = cipher.decrypt(body, seq) else {
            return reply(400, Vec::new(), None);
        };
        state.request_seqs.push(seq);
        drop(state);

        let request: Value = serde_json::from_slice(&plain).unwrap_or(Value::Null);
        let answer = self.plug.lock().unwrap().handle("FAKE-KLAP", &request);

        let mut framed = cipher.encrypt_with_seq(answer.to_string().as_bytes(), seq);
        if self.tamper_responses.load(Ordering::SeqCst) {
            framed[0] ^= 0x01;
        }
        reply(200, framed, None)
    }
}

#[async_trait]
impl HttpTransport for FakeKlapDevice {
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Connection("connect to fake device failed".into()));
        }
        match path {
            "/app/handshake1" => Ok(self.handshake1(body)),
            "/app/handshake2" => Ok(self.handshake2(body, cookie)),
            p if p.starts_with("/app/request") => Ok(self.request(p, body, cookie)),
            _ => Ok(reply(404, Vec::new(), None)),
        }
    }
}

#[derive(Default)]
struct LegacyState {
    cipher: Option<LegacyCipher>,
    cookie: Option<String>,
    token: Option<String>,
    handshakes: usize,
    logins: usize,
}

/// Device side of the legacy protocol.
pub(crate) struct FakeLegacyDevice {
    credentials: Credentials,
    state: Mutex<LegacyState>,
    plug: Mutex<PlugState>,
    unreachable: AtomicBool,
    always_expire: AtomicBool,
    garble_key: AtomicBool,
    garble_responses: AtomicBool,
}

impl FakeLegacyDevice {
    pub(crate) fn new(username: &str, password: &str) -> Self {
        Self {
            credentials: Credentials::new(username, password),
            state: Mutex::new(LegacyState::default()),
            plug: Mutex::new(PlugState::new()),
            unreachable: AtomicBool::new(false),
            always_expire: AtomicBool::new(false),
            garble_key: AtomicBool::new(false),
            garble_responses: AtomicBool::new(false),
        }
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    pub(crate) fn is_on(&self) -> bool {
        self.plug.lock().unwrap().device_on
    }

    pub(crate) fn set_power_milliwatts(&self, power: u64) {
        self.plug.lock().unwrap().power_mw = power;
    }

    pub(crate) fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    /// Invalidates the current token once.
    pub(crate) fn expire_session(&self) {
        self.state.lock().unwrap().token = None;
    }

    /// Rejects every token-bearing request as expired.
    pub(crate) fn always_expire(&self, value: bool) {
        self.always_expire.store(value, Ordering::SeqCst);
    }

    /// Answers the handshake with a key blob that is not RSA ciphertext.
    pub(crate) fn garble_key(&self, value: bool) {
        self.garble_key.store(value, Ordering::SeqCst);
    }

    /// Answers post-login requests with a payload that cannot be decrypted.
    pub(crate) fn garble_responses(&self, value: bool) {
        self.garble_responses.store(value, Ordering::SeqCst);
    }

    fn handshake(&self, request: &Value) -> HttpResponse {
        let Some(pem) = request["params"]["key"].as_str() else {
            return reply(200, json!({"error_code": -1010}).to_string().into_bytes(), None);
        };
        let Ok(public) = RsaPublicKey::from_public_key_pem(pem) else {
            return reply(200, json!({"error_code": -1010}).to_string().into_bytes(), None);
        };

        let mut blob = [0u8; 32];
        rand::rng().fill_bytes(&mut blob);
        let Ok(encrypted) = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &blob) else {
            return reply(500, Vec::new(), None);
        };

        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&blob[..16]);
        iv.copy_from_slice(&blob[16..]);

        let mut state = self.state.lock().unwrap();
        state.handshakes += 1;
        state.cipher = Some(LegacyCipher::new(key, iv));
        state.token = None;
        let cookie = format!("LEGACY-{}", state.handshakes);
        state.cookie = Some(cookie.clone());

        let key = if self.garble_key.load(Ordering::SeqCst) {
            BASE64.encode(b"not an RSA ciphertext")
        } else {
            BASE64.encode(encrypted)
        };
        let body = json!({"error_code": 0, "result": {"key": key}});
        reply(200, body.to_string().into_bytes(), Some(cookie))
    }

    fn passthrough(&self, path: &str, request: &Value, cookie: Option<&str>) -> HttpResponse {
        let expired = || reply(200, json!({"error_code": 9999}).to_string().into_bytes(), None);

        let mut state = self.state.lock().unwrap();
        let Some(cipher) = state.cipher.clone() else {
            return expired();
        };
        if cookie != state.cookie.as_deref() {
            return expired();
        }
        let Some(encoded) = request["params"]["request"].as_str() else {
            return reply(400, Vec::new(), None);
        };
        let Ok(plain) = cipher.decrypt(encoded) else {
            return reply(400, Vec::new(), None);
        };
        let inner: Value = serde_json::from_slice(&plain).unwrap_or(Value::Null);

        let is_login = inner["method"] == "login_device";
        let answer = if is_login {
            if self.login_matches(&inner) {
                state.logins += 1;
                let token = format!("TOKEN-{}", state.logins);
                state.token = Some(token.clone());
                json!({"error_code": 0, "result": {"token": token}})
            } else {
                json!({"error_code": -1501})
            }
        } else {
            let token = path.split_once("token=").map(|(_, t)| t);
            if self.always_expire.load(Ordering::SeqCst)
                || token.is_none()
                || token != state.token.as_deref()
            {
                return expired();
            }
            drop(state);
            self.plug.lock().unwrap().handle("FAKE-LEGACY", &inner)
        };

        // 15 bytes is never a whole number of AES blocks.
        let response = if !is_login && self.garble_responses.load(Ordering::SeqCst) {
            BASE64.encode([0u8; 15])
        } else {
            cipher.encrypt(answer.to_string().as_bytes())
        };
        let body = json!({
            "error_code": 0,
            "result": {"response": response},
        });
        reply(200, body.to_string().into_bytes(), None)
    }

    fn login_matches(&self, inner: &Value) -> bool {
        let username = BASE64.encode(hex::encode(sha1(self.credentials.username.as_bytes())));
        let password = BASE64.encode(self.credentials.expose_password());
        inner["params"]["username"] == username.as_str()
            && inner["params"]["password"] == password.as_str()
    }
}

#[async_trait]
impl HttpTransport for FakeLegacyDevice {
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Connection("connect to fake device failed".into()));
        }
        let request: Value = serde_json::from_slice(body)?;
        match request["method"].as_str() {
            Some("handshake") => Ok(self.handshake(&request)),
            Some("securePassthrough") => Ok(self.passthrough(path, &request, cookie)),
            _ => Ok(reply(200, json!({"error_code": -1002}).to_string().into_bytes(), None)),
        }
    }
}

/// Transport that only counts calls and always fails.
pub(crate) struct CountingTransport {
    calls: AtomicUsize,
}

impl CountingTransport {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for CountingTransport {
    async fn post(
        &self,
        _path: &str,
        _body: &[u8],
        _cookie: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Connection("no device".into()))
    }
}

/// Delays calls whose path starts with `prefix` before forwarding them.
pub(crate) struct SlowTransport {
    inner: Arc<dyn HttpTransport>,
    prefix: &'static str,
    delay: Duration,
}

impl SlowTransport {
    pub(crate) fn new(
        inner: Arc<dyn HttpTransport>,
        prefix: &'static str,
        delay: Duration,
    ) -> Self {
        Self {
            inner,
            prefix,
            delay,
        }
    }
}

#[async_trait]
impl HttpTransport for SlowTransport {
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        if path.starts_with(self.prefix) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.post(path, body, cookie, timeout).await
    }
}

/// Hands out fake transports by device id; unknown ids get real TCP clients.
#[derive(Default)]
pub(crate) struct FakeFactory {
    transports: Mutex<HashMap<String, Arc<dyn HttpTransport>>>,
}

impl FakeFactory {
    pub(crate) fn with(self, device_id: &str, transport: Arc<dyn HttpTransport>) -> Self {
        self.transports
            .lock()
            .unwrap()
            .insert(device_id.to_string(), transport);
        self
    }
}

impl ClientFactory for FakeFactory {
    fn create(&self, config: &DeviceConfig, options: ClientOptions) -> Result<Client, Error> {
        config.validate()?;
        match self.transports.lock().unwrap().get(&config.device_id) {
            Some(transport) => Ok(Client::new(
                config.protocol,
                Arc::clone(transport),
                config.credentials.clone(),
                options,
            )),
            None => Client::from_config(config, options),
        }
    }
}
