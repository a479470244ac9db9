use crate::http::chunked::{self, ChunkedError};
use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;
use thiserror::Error;

/// Upper bound on the request line plus headers.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Upper bound on a (de-chunked) request body.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unsupported method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("request headers too large")]
    HeadersTooLarge,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("incomplete request")]
    Incomplete,
}

impl ParseError {
    /// Status sent to the client before the connection is closed.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::InvalidMethod => StatusCode::NOT_IMPLEMENTED,
            ParseError::HeadersTooLarge => StatusCode::HEADERS_TOO_LARGE,
            ParseError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` when more data is needed.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    RequestParser::new().parse(buf)
}

/// Request parser that keeps its progress between reads.
///
/// The head is parsed once; the body is then resumed on every call, so a
/// large chunked body costs one pass over its bytes. The buffer passed to
/// [`RequestParser::parse`] must keep its earlier contents until a request
/// is returned.
#[derive(Debug, Default)]
pub struct RequestParser {
    head: Option<Head>,
}

#[derive(Debug)]
struct Head {
    method: Method,
    path: String,
    version: String,
    headers: Headers,
    body_start: usize,
    body: BodyState,
    continue_pending: bool,
}

#[derive(Debug)]
enum BodyState {
    Length(usize),
    Chunked(chunked::Decoder),
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, buf: &[u8]) -> Result<(Request, usize), ParseError> {
        let mut head = match self.head.take() {
            Some(head) => head,
            None => parse_head(buf)?,
        };
        let body_bytes = &buf[head.body_start..];

        let progress = match &mut head.body {
            BodyState::Length(length) => Ok((body_bytes.len() >= *length).then_some(*length)),
            BodyState::Chunked(decoder) => decoder.decode(body_bytes).map_err(|e| match e {
                ChunkedError::TooLarge(_) => ParseError::BodyTooLarge,
                _ => ParseError::InvalidChunk,
            }),
        };
        let Some(body_len) = progress? else {
            self.head = Some(head);
            return Err(ParseError::Incomplete);
        };

        let body = match head.body {
            BodyState::Length(length) => body_bytes[..length].to_vec(),
            BodyState::Chunked(decoder) => decoder.into_body(),
        };

        let request = Request {
            method: head.method,
            path: head.path,
            version: head.version,
            headers: head.headers,
            body,
        };

        Ok((request, head.body_start + body_len))
    }

    /// True once per request whose head asked for `Expect: 100-continue`
    /// while its body has not arrived yet.
    pub fn take_continue(&mut self) -> bool {
        self.head
            .as_mut()
            .is_some_and(|head| std::mem::take(&mut head.continue_pending))
    }
}

fn parse_head(buf: &[u8]) -> Result<Head, ParseError> {
    // Look for header/body separator
    let headers_end = match find_headers_end(buf) {
        Some(end) if end > MAX_HEADER_BYTES => return Err(ParseError::HeadersTooLarge),
        Some(end) => end,
        None if buf.len() > MAX_HEADER_BYTES => return Err(ParseError::HeadersTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    let header_bytes = &buf[..headers_end];
    let body_start = headers_end + 4;

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || !(path.starts_with('/') || path == "*") {
        return Err(ParseError::InvalidRequest);
    }
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidVersion);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    // Headers
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        // obsolete line folding
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::InvalidHeader);
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    // Body
    let body = if headers.contains("Transfer-Encoding") {
        if !headers.has_token("Transfer-Encoding", "chunked") {
            return Err(ParseError::InvalidRequest);
        }
        BodyState::Chunked(chunked::Decoder::new(MAX_BODY_BYTES))
    } else {
        let content_length = content_length(&headers)?;
        if content_length > MAX_BODY_BYTES {
            return Err(ParseError::BodyTooLarge);
        }
        BodyState::Length(content_length)
    };

    let continue_pending = version != "HTTP/1.0"
        && headers.has_token("Expect", "100-continue")
        && buf.len() == body_start
        && !matches!(body, BodyState::Length(0));

    Ok(Head {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body_start,
        body,
        continue_pending,
    })
}

/// Content-Length, rejecting unparsable or conflicting values.
fn content_length(headers: &Headers) -> Result<usize, ParseError> {
    let mut length = None;
    for value in headers.get_all("Content-Length") {
        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        if length.is_some_and(|l| l != parsed) {
            return Err(ParseError::InvalidContentLength);
        }
        length = Some(parsed);
    }
    Ok(length.unwrap_or(0))
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
}
