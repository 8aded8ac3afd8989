//! Minimal HTTP/1.1 client for talking to Tapo devices.
//!
//! Tapo firmware ships an HTTP server that only understands HTTP/1.1 with
//! title-case headers, so requests are written by hand over a raw
//! [`TcpStream`] instead of going through a general-purpose HTTP library.
//! The [`HttpTransport`] trait is the seam the protocol clients are built on;
//! tests substitute an in-process fake device for [`HttpClient`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::error::Error;

/// Default HTTP port of Tapo devices.
pub const DEFAULT_PORT: u16 = 80;

/// Upper bound on a whole response, headers included.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Session cookie name issued by both protocols.
pub const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// Response to an HTTP POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Value of the `TP_SESSIONID` cookie, if the device set one.
    pub cookie: Option<String>,
}

/// Sends POST requests to a single device.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POSTs `body` to `path`, echoing `cookie` as `TP_SESSIONID` when given.
    ///
    /// `timeout` bounds the whole exchange, from connect to the last body
    /// byte.
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, Error>;
}

/// [`HttpTransport`] over plain TCP.
#[derive(Debug, Clone)]
pub struct HttpClient {
    host: String,
    port: u16,
}

impl HttpClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn build_request(&self, path: &str, body: &[u8], cookie: Option<&str>) -> Vec<u8> {
        let mut request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Accept: */*\r\n\
             Connection: close\r\n",
            path,
            self.host,
            self.port,
            content_type_for(body),
            body.len()
        );

        if let Some(value) = cookie {
            request.push_str(&format!("Cookie: {}={}\r\n", SESSION_COOKIE_NAME, value));
        }
        request.push_str("\r\n");

        let mut bytes = request.into_bytes();
        bytes.extend_from_slice(body);
        bytes
    }
}

#[async_trait]
impl HttpTransport for HttpClient {
    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
        deadline: Duration,
    ) -> Result<HttpResponse, Error> {
        let response = timeout(deadline, self.exchange(path, body, cookie))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "request to {}:{}{} timed out after {:?}",
                    self.host, self.port, path, deadline
                ))
            })??;

        trace!(
            path,
            status = response.status,
            len = response.body.len(),
            "HTTP response"
        );
        Ok(response)
    }
}

impl HttpClient {
    async fn exchange(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Connection(format!("connect to {} failed: {}", addr, e)))?;

        let request = self.build_request(path, body, cookie);
        stream
            .write_all(&request)
            .await
            .map_err(|e| Error::Connection(format!("write failed: {}", e)))?;

        let raw = read_response(&mut stream).await?;
        parse_response(&raw)
    }
}

/// Reads headers, then the body up to `Content-Length` (or EOF when absent).
///
/// Responses larger than [`MAX_RESPONSE_BYTES`] are rejected.
async fn read_response<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut response = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];
    let mut expected_total: Option<usize> = None;

    loop {
        if let Some(total) = expected_total
            && response.len() >= total
        {
            break;
        }

        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| Error::Connection(format!("read failed: {}", e)))?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.len() > MAX_RESPONSE_BYTES {
            return Err(too_large());
        }

        if expected_total.is_none()
            && let Some(header_end) = find_header_end(&response)
        {
            let headers = String::from_utf8_lossy(&response[..header_end]);
            if let Some(len) = parse_content_length(&headers) {
                let total = header_end + 4 + len;
                if total > MAX_RESPONSE_BYTES {
                    return Err(too_large());
                }
                expected_total = Some(total);
            }
        }
    }

    Ok(response)
}

fn too_large() -> Error {
    Error::Protocol(format!("response exceeds {} bytes", MAX_RESPONSE_BYTES))
}

fn parse_response(raw: &[u8]) -> Result<HttpResponse, Error> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no header end".into()))?;
    let headers = String::from_utf8_lossy(&raw[..header_end]);

    let status = parse_status_code(&headers)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no status code".into()))?;

    let body_start = header_end + 4;
    let body_end = match parse_content_length(&headers) {
        Some(len) => (body_start + len).min(raw.len()),
        None => raw.len(),
    };

    Ok(HttpResponse {
        status,
        body: raw[body_start..body_end].to_vec(),
        cookie: parse_session_cookie(&headers),
    })
}

fn content_type_for(body: &[u8]) -> &'static str {
    if body.first() == Some(&b'{') {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

/// Find the position of "\r\n\r\n" (end of headers).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_code(headers: &str) -> Option<u16> {
    headers.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

fn parse_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Extracts `TP_SESSIONID` from any `Set-Cookie` header.
fn parse_session_cookie(headers: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("set-cookie") {
            return None;
        }
        value
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == SESSION_COOKIE_NAME)
            .map(|(_, v)| v.to_string())
    })
}
