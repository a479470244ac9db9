//! Shared helpers for the integration tests: canned upstreams, token
//! minting and reply rendering.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use identity_gateway::gateway::Reply;
use identity_gateway::http::headers::Headers;
use identity_gateway::http::parser::{parse_http_request, ParseError};
use identity_gateway::http::response::StatusCode;
use identity_gateway::proxy::upstream::parse_response_head;
use jsonwebtoken::{encode, get_current_timestamp, Algorithm, EncodingKey, Header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const SECRET: &[u8] = b"test-secret";

/// An upstream that answers every request with the same bytes and records
/// what it received.
pub struct MockUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockUpstream {
    pub async fn start(response: impl Into<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = Arc::new(response.into());
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (task_hits, task_requests) = (hits.clone(), requests.clone());
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                task_hits.fetch_add(1, Ordering::SeqCst);
                let response = response.clone();
                let requests = task_requests.clone();

                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut temp = [0u8; 4096];
                    loop {
                        match parse_http_request(&buf) {
                            Ok((_, consumed)) => {
                                buf.truncate(consumed);
                                break;
                            }
                            Err(ParseError::Incomplete) => {}
                            Err(_) => break,
                        }
                        match stream.read(&mut temp).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => buf.extend_from_slice(&temp[..n]),
                        }
                    }
                    requests.lock().unwrap().push(buf);

                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            addr,
            hits,
            requests,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Raw requests received so far, as text.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect()
    }
}

/// Accepts connections and never answers.
pub async fn silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// Answers the first request with a head promising ten body bytes, then
/// sends nothing more. The receiver fires once the gateway closes its end.
pub async fn stalled_upstream() -> (SocketAddr, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = Vec::new();
        let mut temp = [0u8; 4096];
        while !matches!(parse_http_request(&buf), Ok(_)) {
            match stream.read(&mut temp).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&temp[..n]),
            }
        }
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
            .await;
        loop {
            match stream.read(&mut temp).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });
    (addr, closed_rx)
}

/// An address nothing listens on.
pub async fn closed_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn json_response(status_line: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
    .into_bytes()
}

/// Signs an HS256 token for `user-1` expiring `exp_offset` seconds from now.
pub fn mint_token(secret: &[u8], exp_offset: i64) -> String {
    let exp = get_current_timestamp() as i64 + exp_offset;
    let claims = serde_json::json!({ "sub": "user-1", "exp": exp });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .unwrap()
}

/// Writes `reply` as a keep-alive response and parses it back.
pub async fn render(reply: Reply) -> (StatusCode, Headers, Vec<u8>) {
    let mut out: Vec<u8> = Vec::new();
    reply.write_to(&mut out, false, true).await.unwrap();

    let head_end = out
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head")
        + 4;
    let (status, headers) = parse_response_head(&out[..head_end]).unwrap();
    (status, headers, out[head_end..].to_vec())
}

pub const TIMEOUT: Duration = Duration::from_secs(5);
