use identity_gateway::http::headers::Headers;
use identity_gateway::http::request::{Method, Request, RequestBuilder};

fn request_with(version: &str, headers: &[(&str, &str)]) -> Request {
    Request {
        method: Method::GET,
        path: "/".to_string(),
        version: version.to_string(),
        headers: headers.iter().copied().collect::<Headers>(),
        body: vec![],
    }
}

#[test]
fn test_request_header_retrieval() {
    let req = request_with(
        "HTTP/1.1",
        &[("Host", "example.com"), ("Content-Type", "application/json")],
    );

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_content_length_parsing() {
    let req = request_with("HTTP/1.1", &[("Content-Length", "42")]);
    assert_eq!(req.content_length(), 42);
}

#[test]
fn test_request_content_length_missing_or_invalid() {
    assert_eq!(request_with("HTTP/1.1", &[]).content_length(), 0);
    assert_eq!(
        request_with("HTTP/1.1", &[("Content-Length", "not-a-number")]).content_length(),
        0
    );
}

#[test]
fn test_request_keep_alive_http11_default() {
    assert!(request_with("HTTP/1.1", &[]).keep_alive());
}

#[test]
fn test_request_connection_close() {
    assert!(!request_with("HTTP/1.1", &[("Connection", "close")]).keep_alive());
    assert!(!request_with("HTTP/1.1", &[("Connection", "Close")]).keep_alive());
}

#[test]
fn test_request_http10_needs_explicit_keep_alive() {
    assert!(!request_with("HTTP/1.0", &[]).keep_alive());
    assert!(request_with("HTTP/1.0", &[("Connection", "keep-alive")]).keep_alive());
}

#[test]
fn test_request_path_only_strips_query() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/users/7?expand=roles")
        .build()
        .unwrap();

    assert_eq!(req.path_only(), "/users/7");
}

#[test]
fn test_request_clean_path() {
    let clean = |path: &str| {
        RequestBuilder::new()
            .method(Method::GET)
            .path(path)
            .build()
            .unwrap()
            .has_clean_path()
    };

    assert!(clean("/users/7"));
    assert!(clean("/users/7?next=../x"));
    assert!(clean("/files/v1.2/..data"));
    assert!(clean("*"));

    assert!(!clean("/auth/../users/1"));
    assert!(!clean("/users/.."));
    assert!(!clean("/./users"));
    assert!(!clean("/auth/%2E%2e/users"));
    assert!(!clean("/auth/%2e/users"));
    assert!(!clean("/auth%2F..%2Fusers"));
    assert!(!clean("/auth/..%5Cusers"));
    assert!(!clean("/auth\\..\\users"));
}

#[test]
fn test_request_builder_defaults() {
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/auth/token")
        .header("Content-Type", "application/json")
        .body(b"{}".to_vec())
        .build()
        .unwrap();

    assert_eq!(req.version, "HTTP/1.1");
    assert_eq!(req.body, b"{}".to_vec());
    assert_eq!(req.header("Content-Type"), Some("application/json"));
}

#[test]
fn test_request_builder_keeps_repeated_headers() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("Cookie", "a=1")
        .header("Cookie", "b=2")
        .build()
        .unwrap();

    assert_eq!(req.headers.get_all("cookie").count(), 2);
}

#[test]
fn test_request_builder_requires_method_and_path() {
    assert_eq!(
        RequestBuilder::new().path("/").build().unwrap_err(),
        "method missing"
    );
    assert_eq!(
        RequestBuilder::new().method(Method::GET).build().unwrap_err(),
        "path missing"
    );
}

#[test]
fn test_method_display() {
    assert_eq!(Method::PATCH.to_string(), "PATCH");
    assert_eq!(Method::from_str(Method::DELETE.as_str()), Some(Method::DELETE));
}
