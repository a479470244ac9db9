//! End-to-end tests over real sockets

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{json_response, mint_token, stalled_upstream, MockUpstream, SECRET, TIMEOUT};
use identity_gateway::auth::CredentialVerifier;
use identity_gateway::gateway::routes::IDENTITY_SERVICE;
use identity_gateway::gateway::{identity_routes, Dispatcher};
use identity_gateway::http::headers::Headers;
use identity_gateway::http::response::StatusCode;
use identity_gateway::proxy::backend::Balancer;
use identity_gateway::proxy::upstream::parse_response_head;
use identity_gateway::server::listener::serve;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Gateway {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start_gateway(upstream: &str) -> Gateway {
    let dispatcher = Dispatcher::builder()
        .upstream(IDENTITY_SERVICE, Balancer::from_addresses(upstream).unwrap())
        .routes(identity_routes())
        .verifier(CredentialVerifier::new(SECRET))
        .build()
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(serve(
        listener,
        Arc::new(dispatcher),
        async move {
            let _ = stopped.await;
        },
        Duration::from_secs(2),
    ));

    Gateway { addr, stop, task }
}

/// Reads one Content-Length delimited response.
async fn read_response(stream: &mut TcpStream) -> (StatusCode, Headers, Vec<u8>) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut temp).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&temp[..n]);
    };

    let (status, headers) = parse_response_head(&buf[..head_end]).unwrap();
    let length: usize = headers.get("Content-Length").unwrap().parse().unwrap();
    while buf.len() < head_end + length {
        let n = stream.read(&mut temp).await.unwrap();
        assert!(n > 0, "connection closed inside response body");
        buf.extend_from_slice(&temp[..n]);
    }

    (status, headers, buf[head_end..head_end + length].to_vec())
}

#[tokio::test]
async fn test_issuance_end_to_end() {
    let upstream = MockUpstream::start(json_response(
        "200 OK",
        r#"{"access_token":"A","refresh_token":"R"}"#,
    ))
    .await;
    let gateway = start_gateway(&upstream.url()).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(
            b"POST /auth/token HTTP/1.1\r\nHost: gw\r\nTransfer-Encoding: chunked\r\n\r\n5\r\n{\"a\":\r\n2\r\n1}\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let (status, headers, body) = timeout(TIMEOUT, read_response(&mut client)).await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("Set-Cookie"),
        Some("refresh_token=R; Path=/; Max-Age=2592000; HttpOnly; Secure")
    );
    assert_eq!(body, br#"{"access_token":"A"}"#.to_vec());

    // the chunked caller body reaches the upstream de-chunked
    let forwarded = &upstream.requests()[0];
    assert!(forwarded.contains("Content-Length: 7\r\n"));
    assert!(forwarded.ends_with(r#"{"a":1}"#));
    assert!(forwarded.contains("Host: gw\r\n"));
}

#[tokio::test]
async fn test_expect_continue_is_answered_by_the_gateway() {
    let upstream = MockUpstream::start(json_response("201 Created", "{}")).await;
    let gateway = start_gateway(&upstream.url()).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(
            b"POST /auth/register HTTP/1.1\r\nHost: gw\r\nExpect: 100-continue\r\nContent-Length: 7\r\n\r\n",
        )
        .await
        .unwrap();

    let mut interim = [0u8; 25];
    timeout(TIMEOUT, client.read_exact(&mut interim)).await.unwrap().unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(br#"{"a":1}"#).await.unwrap();
    let (status, _, body) = timeout(TIMEOUT, read_response(&mut client)).await.unwrap();
    assert_eq!(status.as_u16(), 201);
    assert_eq!(body, b"{}".to_vec());

    let forwarded = &upstream.requests()[0];
    assert!(!forwarded.contains("Expect"));
    assert!(forwarded.ends_with(r#"{"a":1}"#));
}

#[tokio::test]
async fn test_client_leaving_mid_relay_releases_the_upstream() {
    let (upstream, upstream_closed) = stalled_upstream().await;
    let gateway = start_gateway(&format!("http://{}", upstream)).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET /auth/session HTTP/1.1\r\nHost: gw\r\n\r\n")
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut temp = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = timeout(TIMEOUT, client.read(&mut temp)).await.unwrap().unwrap();
        assert!(n > 0, "connection closed before response head");
        head.extend_from_slice(&temp[..n]);
    }
    assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));

    // the body never comes; leaving must not pin the upstream connection
    drop(client);
    timeout(TIMEOUT, upstream_closed).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_keep_alive_serves_several_requests() {
    let upstream = MockUpstream::start(json_response("200 OK", r#"{"ok":true}"#)).await;
    let gateway = start_gateway(&upstream.url()).await;
    let authorization = format!("Authorization: Bearer {}\r\n", mint_token(SECRET, 3600));

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    for _ in 0..2 {
        let request = format!("GET /users/me HTTP/1.1\r\nHost: gw\r\n{}\r\n", authorization);
        client.write_all(request.as_bytes()).await.unwrap();

        let (status, _, body) = timeout(TIMEOUT, read_response(&mut client)).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, br#"{"ok":true}"#.to_vec());
    }

    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn test_unauthenticated_request_end_to_end() {
    let upstream = MockUpstream::start(json_response("200 OK", "{}")).await;
    let gateway = start_gateway(&upstream.url()).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET /users/me HTTP/1.1\r\nHost: gw\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    timeout(TIMEOUT, client.read_to_end(&mut raw)).await.unwrap().unwrap();
    let raw = String::from_utf8(raw).unwrap();

    assert!(raw.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert!(raw.contains("WWW-Authenticate: Bearer\r\n"));
    assert!(raw.contains("Connection: close\r\n"));
    assert!(raw.ends_with("401 Unauthorized"));
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn test_chunked_upstream_body_is_relayed_verbatim() {
    let chunked = "4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let canned = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n{}",
        chunked
    );
    let upstream = MockUpstream::start(canned).await;
    let gateway = start_gateway(&upstream.url()).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET /auth/.well-known/jwks.json HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    timeout(TIMEOUT, client.read_to_end(&mut raw)).await.unwrap().unwrap();
    let raw = String::from_utf8(raw).unwrap();

    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.contains("Transfer-Encoding: chunked\r\n"));
    assert!(raw.ends_with(&format!("\r\n\r\n{}", chunked)));
}

#[tokio::test]
async fn test_malformed_request_is_rejected() {
    let upstream = MockUpstream::start(json_response("200 OK", "{}")).await;
    let gateway = start_gateway(&upstream.url()).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client.write_all(b"garbage\r\n\r\n").await.unwrap();

    let mut raw = Vec::new();
    timeout(TIMEOUT, client.read_to_end(&mut raw)).await.unwrap().unwrap();

    assert!(raw.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn test_graceful_shutdown_closes_idle_connections() {
    let upstream = MockUpstream::start(json_response("200 OK", "{}")).await;
    let gateway = start_gateway(&upstream.url()).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    client
        .write_all(b"GET /auth/session HTTP/1.1\r\nHost: gw\r\n\r\n")
        .await
        .unwrap();
    let (status, _, _) = timeout(TIMEOUT, read_response(&mut client)).await.unwrap();
    assert_eq!(status, StatusCode::OK);

    gateway.stop.send(()).unwrap();
    timeout(TIMEOUT, gateway.task).await.unwrap().unwrap().unwrap();

    // the idle keep-alive connection was closed by the server
    let mut rest = Vec::new();
    let n = timeout(TIMEOUT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    assert!(TcpStream::connect(gateway.addr).await.is_err());
}
