//! End-to-end KLAP exchange over a real socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tapo_core::crypto::auth::auth_hash;
use tapo_core::crypto::klap::{KlapCipher, client_hash, server_hash};
use tapo_core::{
    Client, ClientOptions, Credentials, DeviceConfig, DeviceEvent, ErrorKind, ProtocolClient,
    ProtocolKind, SupervisorBuilder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct Session {
    seeds: Option<([u8; 16], [u8; 16])>,
    cipher: Option<KlapCipher>,
}

struct Request {
    path: String,
    cookie: Option<String>,
    body: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let path = headers.split_whitespace().nth(1)?.to_string();
    let mut content_length = 0;
    let mut cookie = None;
    for line in headers.lines().skip(1) {
        let (name, value) = line.split_once(':')?;
        match name {
            "Content-Length" => content_length = value.trim().parse().ok()?,
            "Cookie" => cookie = value.trim().strip_prefix("TP_SESSIONID=").map(String::from),
            _ => {}
        }
    }

    while raw.len() < header_end + 4 + content_length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
    }
    let body = raw[header_end + 4..header_end + 4 + content_length].to_vec();
    Some(Request { path, cookie, body })
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &[u8], cookie: Option<&str>) {
    let mut head = format!(
        "HTTP/1.1 {} OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n",
        status,
        body.len()
    );
    if let Some(cookie) = cookie {
        head.push_str(&format!("Set-Cookie: TP_SESSIONID={};TIMEOUT=86400\r\n", cookie));
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body).await;
    let _ = stream.shutdown().await;
}

async fn handle(mut stream: TcpStream, session: Arc<Mutex<Session>>, hash: [u8; 32]) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };

    match request.path.as_str() {
        "/app/handshake1" => {
            let mut local = [0u8; 16];
            local.copy_from_slice(&request.body[..16]);
            let remote = [0x5au8; 16];
            session.lock().unwrap().seeds = Some((local, remote));

            let mut body = remote.to_vec();
            body.extend_from_slice(&server_hash(&local, &remote, &hash));
            write_response(&mut stream, 200, &body, Some("ABCDEF0123")).await;
        }
        "/app/handshake2" => {
            let seeds = session.lock().unwrap().seeds;
            let ok = request.cookie.as_deref() == Some("ABCDEF0123")
                && seeds.is_some_and(|(l, r)| request.body == client_hash(&l, &r, &hash));
            if let (true, Some((l, r))) = (ok, seeds) {
                session.lock().unwrap().cipher = Some(KlapCipher::derive(&l, &r, &hash));
                write_response(&mut stream, 200, b"", None).await;
            } else {
                write_response(&mut stream, 403, b"", None).await;
            }
        }
        path if path.starts_with("/app/request?seq=") => {
            let seq: u32 = path["/app/request?seq=".len()..].parse().unwrap();
            let cipher = session.lock().unwrap().cipher.clone().unwrap();
            let plain = cipher.decrypt(&request.body, seq).unwrap();
            let request: serde_json::Value = serde_json::from_slice(&plain).unwrap();

            let answer = match request["method"].as_str() {
                Some("get_device_info") => json!({"error_code": 0, "result": {
                    "device_id": "TCP-1", "model": "P115", "fw_ver": "1.0.0",
                    "device_on": true, "rssi": -42
                }}),
                Some("get_energy_usage") => json!({"error_code": 0, "result": {
                    "current_power": 7_250, "today_energy": 55, "month_energy": 900,
                    "today_runtime": 33, "month_runtime": 700
                }}),
                _ => json!({"error_code": -1002}),
            };
            let framed = cipher.encrypt_with_seq(answer.to_string().as_bytes(), seq);
            write_response(&mut stream, 200, &framed, None).await;
        }
        _ => write_response(&mut stream, 404, b"", None).await,
    }
}

/// Starts a fake plug provisioned for `username`/`password`.
async fn spawn_device(username: &str, password: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let hash = auth_hash(username, password);
    let session = Arc::new(Mutex::new(Session::default()));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle(stream, Arc::clone(&session), hash));
        }
    });
    addr
}

fn config(addr: &str, password: &str) -> DeviceConfig {
    DeviceConfig::new(
        "tcp-plug",
        addr,
        Credentials::new("carol@example.com", password),
        ProtocolKind::Klap,
    )
}

#[tokio::test]
async fn test_client_talks_to_tcp_device() {
    let addr = spawn_device("carol@example.com", "pa55").await;
    let mut client = Client::from_config(&config(&addr, "pa55"), ClientOptions::default()).unwrap();

    client.connect().await.unwrap();
    let info = client.get_device_info().await.unwrap();
    assert_eq!(info.device_id, "TCP-1");
    assert_eq!(info.rssi, -42);

    let usage = client.get_energy_usage().await.unwrap();
    assert_eq!(usage.current_power_milliwatts, 7_250);
    assert_eq!(usage.month_runtime_minutes, 700);
}

#[tokio::test]
async fn test_wrong_password_over_tcp() {
    let addr = spawn_device("carol@example.com", "pa55").await;
    let mut client =
        Client::from_config(&config(&addr, "guess"), ClientOptions::default()).unwrap();

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_supervisor_polls_tcp_device() {
    let addr = spawn_device("carol@example.com", "pa55").await;
    let supervisor = SupervisorBuilder::new().build();
    let mut events = supervisor.subscribe();

    let config = config(&addr, "pa55").with_poll_interval(Duration::from_millis(50));
    supervisor.add_device(config).await.unwrap();

    let reading = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(DeviceEvent::Reading(reading)) = events.recv().await {
                return reading;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reading.usage.today_energy_wh, 55);
    assert_eq!(reading.is_on, Some(true));

    let statuses = supervisor.get_device_status();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].online);

    supervisor.stop().await;
}
