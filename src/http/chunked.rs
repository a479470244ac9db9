//! `Transfer-Encoding: chunked` decoding.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkedError {
    #[error("invalid chunk size line")]
    InvalidSize,
    #[error("missing CRLF after chunk data")]
    MissingCrlf,
    #[error("chunked body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("chunk size or trailer line too long")]
    LineTooLong,
}

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4096;

/// Decodes a complete chunked body from the start of `buf`.
///
/// Returns `Ok(None)` while the body is incomplete, otherwise the decoded
/// payload and the number of bytes consumed (trailers included). Trailer
/// fields are discarded.
pub fn decode(buf: &[u8], limit: usize) -> Result<Option<(Vec<u8>, usize)>, ChunkedError> {
    let mut decoder = Decoder::new(limit);
    Ok(decoder.decode(buf)?.map(|consumed| (decoder.into_body(), consumed)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental chunked decoder.
///
/// Each call to [`Decoder::decode`] gets the whole body buffer seen so far
/// and resumes where the previous call stopped, so a body that arrives in
/// many reads is scanned and copied once.
#[derive(Debug, Clone)]
pub struct Decoder {
    limit: usize,
    pos: usize,
    body: Vec<u8>,
    state: State,
}

impl Decoder {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            pos: 0,
            body: Vec::new(),
            state: State::Size,
        }
    }

    /// Advances over `buf`, which must start with the same bytes as on the
    /// previous call. Returns the number of bytes the body occupies once
    /// the last chunk and trailers are complete.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<usize>, ChunkedError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line_len) = find_line(&buf[self.pos..])? else {
                        return Ok(None);
                    };
                    let size = parse_size(&buf[self.pos..self.pos + line_len])?;
                    self.pos += line_len + 2;

                    if size == 0 {
                        self.state = State::Trailers;
                        continue;
                    }
                    match self.body.len().checked_add(size) {
                        Some(total) if total <= self.limit => {}
                        _ => return Err(ChunkedError::TooLarge(self.limit)),
                    }
                    self.body.reserve(size);
                    self.state = State::Data(size);
                }
                State::Data(remaining) => {
                    let available = (buf.len() - self.pos).min(remaining);
                    self.body.extend_from_slice(&buf[self.pos..self.pos + available]);
                    self.pos += available;
                    if available < remaining {
                        self.state = State::Data(remaining - available);
                        return Ok(None);
                    }
                    self.state = State::DataEnd;
                }
                State::DataEnd => {
                    if buf.len() < self.pos + 2 {
                        return Ok(None);
                    }
                    if &buf[self.pos..self.pos + 2] != b"\r\n" {
                        return Err(ChunkedError::MissingCrlf);
                    }
                    self.pos += 2;
                    self.state = State::Size;
                }
                State::Trailers => {
                    let Some(line_len) = find_line(&buf[self.pos..])? else {
                        return Ok(None);
                    };
                    self.pos += line_len + 2;
                    if line_len == 0 {
                        self.state = State::Done;
                    }
                }
                State::Done => return Ok(Some(self.pos)),
            }
        }
    }

    /// The payload decoded so far.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Length of the line at the start of `buf`, without its CRLF.
fn find_line(buf: &[u8]) -> Result<Option<usize>, ChunkedError> {
    match find_crlf(buf) {
        Some(len) if len > MAX_LINE => Err(ChunkedError::LineTooLong),
        Some(len) => Ok(Some(len)),
        None if buf.len() > MAX_LINE + 1 => Err(ChunkedError::LineTooLong),
        None => Ok(None),
    }
}

fn parse_size(line: &[u8]) -> Result<usize, ChunkedError> {
    let line = std::str::from_utf8(line).map_err(|_| ChunkedError::InvalidSize)?;
    // chunk extensions are ignored
    let hex = line.split(';').next().unwrap_or_default().trim();
    if hex.is_empty() {
        return Err(ChunkedError::InvalidSize);
    }
    usize::from_str_radix(hex, 16).map_err(|_| ChunkedError::InvalidSize)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
