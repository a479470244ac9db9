//! Upstream connection and request forwarding
//!
//! This module connects to a selected endpoint, sends an equivalent copy of
//! the caller's request and hands back the upstream response head together
//! with the still-unread body, so the body can be relayed as it arrives.

use crate::error::{GatewayError, Result};
use crate::http::chunked;
use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;
use crate::proxy::backend::Endpoint;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default buffer size for upstream reads
const BUFFER_SIZE: usize = 8192;

/// Upper bound on an upstream status line plus headers
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Request headers that describe the caller's connection rather than the
/// message; they are replaced when talking to the upstream.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "Content-Length",
    // answered by the gateway itself
    "Expect",
];

/// How the upstream delimits its response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body (HEAD request, 1xx, 204, 304)
    Empty,
    /// Exactly this many bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Everything until the upstream closes the connection
    UntilClose,
}

/// Forwards requests to upstream endpoints.
///
/// Every forwarded request uses a fresh connection with `Connection: close`;
/// there is no retry.
#[derive(Debug, Clone)]
pub struct Forwarder {
    /// Connection timeout duration
    connect_timeout: Duration,

    /// Bound on sending the request and receiving the response head
    request_timeout: Duration,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Forward an HTTP request to `endpoint` and wait for the response head.
    pub async fn forward(&self, request: &Request, endpoint: &Endpoint) -> Result<UpstreamResponse> {
        tracing::debug!(
            backend = %endpoint,
            method = ?request.method,
            path = %request.path,
            "Forwarding request to backend"
        );

        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect(endpoint.socket_addr()),
        )
        .await
        {
            Err(_) => return Err(timed_out(endpoint)),
            Ok(Err(e)) => return Err(unavailable(endpoint, e)),
            Ok(Ok(stream)) => stream,
        };

        tracing::trace!(backend = %endpoint, "Connected to backend");

        timeout(self.request_timeout, self.exchange(stream, request, endpoint))
            .await
            .map_err(|_| timed_out(endpoint))?
    }

    /// Send the request and read the final (non-1xx) response head.
    async fn exchange(
        &self,
        mut stream: TcpStream,
        request: &Request,
        endpoint: &Endpoint,
    ) -> Result<UpstreamResponse> {
        let request_bytes = self.build_http_request(request, endpoint);
        stream
            .write_all(&request_bytes)
            .await
            .map_err(|e| unavailable(endpoint, e))?;
        stream.flush().await.map_err(|e| unavailable(endpoint, e))?;

        tracing::trace!(backend = %endpoint, "Request sent to backend");

        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        loop {
            let (status, headers) = read_head(&mut stream, &mut buffer, endpoint).await?;

            if status.as_u16() == 101 {
                return Err(failed(endpoint, "protocol upgrades are not supported"));
            }
            if status.is_informational() {
                // e.g. 100 Continue; the final response follows
                continue;
            }

            let framing = body_framing(request.method, status, &headers)
                .map_err(|reason| failed(endpoint, reason))?;

            return Ok(UpstreamResponse {
                status,
                headers,
                endpoint: endpoint.clone(),
                framing,
                idle_timeout: self.request_timeout,
                buffer,
                stream,
            });
        }
    }

    /// Build HTTP request bytes to send to the upstream.
    ///
    /// Headers are copied verbatim (names, order, duplicates, `Host` and
    /// `Authorization` included) apart from the connection-level ones in
    /// `HOP_BY_HOP`. The body is already de-chunked, so it is always sent
    /// with a Content-Length.
    pub fn build_http_request(&self, request: &Request, endpoint: &Endpoint) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(
            format!(
                "{} {} HTTP/1.1\r\n",
                request.method,
                endpoint.target_for(&request.path)
            )
            .as_bytes(),
        );

        for (key, value) in request.headers.iter() {
            if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(key)) {
                continue;
            }
            buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }

        if !request.headers.contains("Host") {
            buffer.extend_from_slice(format!("Host: {}\r\n", endpoint.host_header()).as_bytes());
        }

        let had_body_framing = request.headers.contains("Content-Length")
            || request.headers.contains("Transfer-Encoding");
        if had_body_framing || !request.body.is_empty() {
            buffer.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
        }

        buffer.extend_from_slice(b"Connection: close\r\n");

        // End of headers
        buffer.extend_from_slice(b"\r\n");

        buffer.extend_from_slice(&request.body);

        buffer
    }
}

/// An upstream response whose head has been read but whose body is still
/// on the wire.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: Headers,
    endpoint: Endpoint,
    framing: BodyFraming,
    /// Longest wait for the next body bytes while relaying
    idle_timeout: Duration,
    buffer: BytesMut,
    stream: TcpStream,
}

impl UpstreamResponse {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Streams the raw body bytes to `writer` unchanged, chunk framing
    /// included. Returns the number of bytes relayed.
    ///
    /// Fails with `TimedOut` when the upstream sends nothing for the idle
    /// timeout.
    pub async fn relay<W>(mut self, writer: &mut W) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let relayed = match self.framing {
            BodyFraming::Empty => 0,
            BodyFraming::Length(length) => {
                let from_buffer = (self.buffer.len() as u64).min(length) as usize;
                writer.write_all(&self.buffer[..from_buffer]).await?;

                let remaining = length - from_buffer as u64;
                let copied = self.copy_body(writer, Some(remaining)).await?;
                if copied < remaining {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "upstream closed before complete body was relayed",
                    ));
                }
                length
            }
            // The upstream was asked for `Connection: close`, so it closes
            // the connection once the body (last chunk included) is sent.
            BodyFraming::Chunked | BodyFraming::UntilClose => {
                writer.write_all(&self.buffer).await?;
                let copied = self.copy_body(writer, None).await?;
                self.buffer.len() as u64 + copied
            }
        };

        writer.flush().await?;
        Ok(relayed)
    }

    /// Copies from the upstream socket until EOF or until `limit` bytes,
    /// bounding every read by the idle timeout.
    async fn copy_body<W>(&mut self, writer: &mut W, limit: Option<u64>) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunk = vec![0u8; BUFFER_SIZE];
        let mut copied = 0u64;

        loop {
            let want = match limit {
                Some(limit) if copied >= limit => break,
                Some(limit) => (limit - copied).min(BUFFER_SIZE as u64) as usize,
                None => BUFFER_SIZE,
            };
            let n = timeout(self.idle_timeout, self.stream.read(&mut chunk[..want]))
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "upstream body stalled",
                    )
                })??;
            if n == 0 {
                break;
            }
            writer.write_all(&chunk[..n]).await?;
            copied += n as u64;
        }

        Ok(copied)
    }

    /// Reads the whole body into memory, de-chunking it if needed.
    pub async fn read_body(mut self, limit: usize) -> Result<Vec<u8>> {
        let endpoint = self.endpoint.clone();

        match self.framing {
            BodyFraming::Empty => Ok(Vec::new()),
            BodyFraming::Length(length) => {
                let length = usize::try_from(length)
                    .ok()
                    .filter(|l| *l <= limit)
                    .ok_or_else(|| failed(&endpoint, "response body exceeds limit"))?;
                while self.buffer.len() < length {
                    if self.fill().await? == 0 {
                        return Err(failed(&endpoint, "connection closed before complete body"));
                    }
                }
                Ok(self.buffer[..length].to_vec())
            }
            BodyFraming::Chunked => {
                let mut decoder = chunked::Decoder::new(limit);
                loop {
                    match decoder.decode(&self.buffer) {
                        Ok(Some(_)) => return Ok(decoder.into_body()),
                        Ok(None) => {}
                        Err(e) => return Err(failed(&endpoint, e.to_string())),
                    }
                    if self.buffer.len() > limit.saturating_mul(2) {
                        return Err(failed(&endpoint, "response body exceeds limit"));
                    }
                    if self.fill().await? == 0 {
                        return Err(failed(&endpoint, "connection closed inside chunked body"));
                    }
                }
            }
            BodyFraming::UntilClose => {
                while self.fill().await? > 0 {
                    if self.buffer.len() > limit {
                        return Err(failed(&endpoint, "response body exceeds limit"));
                    }
                }
                Ok(self.buffer.to_vec())
            }
        }
    }

    async fn fill(&mut self) -> Result<usize> {
        self.buffer.reserve(BUFFER_SIZE);
        self.stream
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| unavailable(&self.endpoint, e))
    }
}

async fn read_head(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    endpoint: &Endpoint,
) -> Result<(StatusCode, Headers)> {
    loop {
        // Check if we've received complete headers (look for \r\n\r\n)
        if let Some(headers_end) = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
        {
            let head = buffer.split_to(headers_end + 4);
            return parse_response_head(&head).map_err(|reason| failed(endpoint, reason));
        }

        // Prevent unbounded header growth
        if buffer.len() > MAX_RESPONSE_HEAD {
            return Err(failed(endpoint, "response headers too large"));
        }

        let n = stream
            .read_buf(buffer)
            .await
            .map_err(|e| unavailable(endpoint, e))?;
        if n == 0 {
            return Err(failed(endpoint, "connection closed before response head"));
        }
    }
}

/// Parses an upstream status line and headers.
pub fn parse_response_head(bytes: &[u8]) -> std::result::Result<(StatusCode, Headers), String> {
    let head = std::str::from_utf8(bytes).map_err(|_| "invalid UTF-8 in response head")?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().ok_or("empty response")?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(format!("invalid status line: {status_line}"));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| format!("invalid status code in: {status_line}"))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line: {line}"))?;
        headers.append(key.trim(), value.trim());
    }

    Ok((status, headers))
}

/// Decides how the body following a response head is delimited.
pub fn body_framing(
    method: Method,
    status: StatusCode,
    headers: &Headers,
) -> std::result::Result<BodyFraming, String> {
    let code = status.as_u16();
    if method == Method::HEAD || status.is_informational() || code == 204 || code == 304 {
        return Ok(BodyFraming::Empty);
    }

    if headers.contains("Transfer-Encoding") {
        return Ok(if headers.has_token("Transfer-Encoding", "chunked") {
            BodyFraming::Chunked
        } else {
            BodyFraming::UntilClose
        });
    }

    let mut length = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid Content-Length: {value}"))?;
        if length.is_some_and(|l| l != parsed) {
            return Err("conflicting Content-Length values".to_string());
        }
        length = Some(parsed);
    }

    Ok(length.map_or(BodyFraming::UntilClose, BodyFraming::Length))
}

fn unavailable(endpoint: &Endpoint, source: std::io::Error) -> GatewayError {
    GatewayError::UpstreamUnavailable {
        endpoint: endpoint.to_string(),
        source,
    }
}

fn timed_out(endpoint: &Endpoint) -> GatewayError {
    GatewayError::UpstreamTimeout {
        endpoint: endpoint.to_string(),
    }
}

fn failed(endpoint: &Endpoint, reason: impl Into<String>) -> GatewayError {
    GatewayError::ForwardFailed {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_prefers_transfer_encoding() {
        let headers: Headers = [("Transfer-Encoding", "chunked"), ("Content-Length", "10")]
            .into_iter()
            .collect();
        assert_eq!(
            body_framing(Method::GET, StatusCode::OK, &headers),
            Ok(BodyFraming::Chunked)
        );
    }

    #[test]
    fn head_and_no_content_have_no_body() {
        let headers: Headers = [("Content-Length", "10")].into_iter().collect();
        assert_eq!(
            body_framing(Method::HEAD, StatusCode::OK, &headers),
            Ok(BodyFraming::Empty)
        );
        let no_content = StatusCode::from_u16(204).unwrap();
        assert_eq!(
            body_framing(Method::GET, no_content, &Headers::new()),
            Ok(BodyFraming::Empty)
        );
    }

    #[test]
    fn missing_length_reads_until_close() {
        assert_eq!(
            body_framing(Method::GET, StatusCode::OK, &Headers::new()),
            Ok(BodyFraming::UntilClose)
        );
    }
}
