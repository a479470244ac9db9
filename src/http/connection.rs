use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;

use crate::gateway::dispatcher::{Dispatcher, Reply};
use crate::http::parser::{ParseError, RequestParser};
use crate::http::request::{Method, Request};
use crate::http::response::Response;

/// Bytes a client may pipeline while its previous request is in flight.
const MAX_PIPELINED_BYTES: usize = 64 * 1024;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

pub struct Connection<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    buffer: Vec<u8>,
    parser: RequestParser,
    state: ConnectionState,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing {
        reply: Reply,
        head_only: bool,
        keep_alive: bool,
    },
    Closed,
}

enum ReadOutcome {
    Request(Request),
    Rejected(ParseError),
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, dispatcher: Arc<Dispatcher>, shutdown: watch::Receiver<bool>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            buffer: Vec::with_capacity(4096),
            parser: RequestParser::new(),
            state: ConnectionState::Reading,
            dispatcher,
            shutdown,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await? {
                        ReadOutcome::Request(req) => ConnectionState::Processing(req),
                        ReadOutcome::Rejected(err) => {
                            tracing::debug!(error = %err, "Rejecting malformed request");
                            ConnectionState::Writing {
                                reply: Reply::Full(Response::status_only(err.status())),
                                head_only: false,
                                keep_alive: false,
                            }
                        }
                        ReadOutcome::Closed => ConnectionState::Closed,
                    };
                }

                ConnectionState::Processing(req) => {
                    // A client that goes away mid-request drops the dispatch
                    // future, which closes the upstream connection with it.
                    let reply = tokio::select! {
                        reply = self.dispatcher.dispatch(&req) => Some(reply),
                        _ = watch_disconnect(&mut self.reader, &mut self.buffer) => None,
                    };

                    let Some(reply) = reply else {
                        tracing::debug!(
                            method = ?req.method,
                            path = %req.path,
                            "Client disconnected, abandoning request"
                        );
                        continue;
                    };

                    let keep_alive =
                        req.keep_alive() && reply.keeps_connection() && !*self.shutdown.borrow();
                    self.state = ConnectionState::Writing {
                        reply,
                        head_only: req.method == Method::HEAD,
                        keep_alive,
                    };
                }

                ConnectionState::Writing {
                    reply,
                    head_only,
                    keep_alive,
                } => {
                    // a client that leaves mid-relay stops the upstream read too
                    let written = tokio::select! {
                        written = reply.write_to(&mut self.writer, head_only, keep_alive) => Some(written),
                        _ = watch_disconnect(&mut self.reader, &mut self.buffer) => None,
                    };

                    match written {
                        Some(result) => result?,
                        None => {
                            tracing::debug!("Client disconnected while the response was written");
                            continue;
                        }
                    }

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    }
                }

                ConnectionState::Closed => {
                    let _ = self.writer.shutdown().await;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        loop {
            // Try parsing whatever we already have
            match self.parser.parse(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(ReadOutcome::Request(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                    if self.parser.take_continue() {
                        self.writer.write_all(CONTINUE).await?;
                        self.writer.flush().await?;
                    }
                }

                Err(e) => return Ok(ReadOutcome::Rejected(e)),
            }

            let idle = self.buffer.is_empty();
            if idle && *self.shutdown.borrow() {
                return Ok(ReadOutcome::Closed);
            }

            // Read more data; an idle connection also gives way to shutdown
            let mut temp = [0u8; 4096];
            let n = tokio::select! {
                n = self.reader.read(&mut temp) => n?,
                _ = self.shutdown.changed(), if idle => return Ok(ReadOutcome::Closed),
            };

            if n == 0 {
                // Client closed connection
                return Ok(ReadOutcome::Closed);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

/// Resolves once the client closes its side of the connection. Pipelined
/// bytes read meanwhile are kept in `buffer` for the next request.
async fn watch_disconnect<R>(reader: &mut R, buffer: &mut Vec<u8>)
where
    R: AsyncRead + Unpin,
{
    let mut temp = [0u8; 1024];
    loop {
        let room = MAX_PIPELINED_BYTES.saturating_sub(buffer.len()).min(temp.len());
        if room == 0 {
            // stop reading until the current request completes
            return std::future::pending().await;
        }
        match reader.read(&mut temp[..room]).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buffer.extend_from_slice(&temp[..n]),
        }
    }
}
