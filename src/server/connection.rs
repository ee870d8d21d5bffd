//! Client connection handling.
//!
//! Each connection runs a framed read loop dispatching requests to the
//! handler and a writer task draining an outbound queue, so server-pushed
//! Publish requests interleave with responses on the same stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::constants::{DEFAULT_REQUEST_HANDLER_TIMEOUT_SECS, DEFAULT_REQUEST_READ_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::protocol::codec::{decode_binary, encode_frame, split_frame};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, Status};
use crate::protocol::Message;
use crate::types::{ClientId, SessionId};

use super::handler::{Handler, RequestContext};

/// A client connection to the coordination server.
pub struct ClientConnection {
    stream: TcpStream,
    addr: SocketAddr,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self { stream, addr }
    }

    /// Handle requests from this connection until it closes.
    pub async fn handle_requests<H: Handler>(self, handler: Arc<H>) -> Result<()> {
        let read_timeout = Duration::from_secs(DEFAULT_REQUEST_READ_TIMEOUT_SECS);
        let handler_timeout = Duration::from_secs(DEFAULT_REQUEST_HANDLER_TIMEOUT_SECS);
        let addr = self.addr;

        let (mut read_half, mut write_half) = self.stream.into_split();

        // Writer task: responses and server-pushed publishes share one
        // outbound queue so frames never interleave mid-write.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let frame = match encode_frame(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(client = %addr, error = %e, "Failed to encode frame");
                        break;
                    }
                };
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        // The session this connection serves events for, once known.
        let mut attached: Option<SessionId> = None;
        let mut publish_pump: Option<tokio::task::JoinHandle<()>> = None;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let result = 'outer: loop {
            let frame = loop {
                match split_frame(&mut buf) {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(client = %addr, error = %e, "Malformed frame");
                        break 'outer Err(e);
                    }
                }

                let read = match timeout(read_timeout, read_half.read_buf(&mut buf)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => break 'outer Err(Error::IoError(e.kind())),
                    Err(_) => {
                        warn!(client = %addr, "Request read timeout");
                        break 'outer Err(Error::MissingData("request read timeout".to_owned()));
                    }
                };
                if read == 0 {
                    debug!(client = %addr, "Client disconnected");
                    break 'outer Ok(());
                }
            };

            let message = match decode_binary(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(client = %addr, error = %e, "Undecodable message");
                    break Err(e);
                }
            };

            match message {
                Message::Request(request) => {
                    let ctx = RequestContext {
                        client_addr: addr,
                        request_id: uuid::Uuid::new_v4(),
                    };
                    debug!(
                        request_id = %ctx.request_id,
                        kind = request.kind().as_str(),
                        client = %addr,
                        correlation_id = %request.id(),
                        "Handling request"
                    );

                    // Commands and queries may wait on other traffic from
                    // this very connection (sequence gaps, causal reads),
                    // so they must not block the read loop. Responses are
                    // matched by correlation id, not arrival order.
                    if matches!(request, Request::Command(_) | Request::Query(_)) {
                        let handler = handler.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            match timeout(handler_timeout, dispatch(&handler, &ctx, request)).await
                            {
                                Ok(dispatched) => {
                                    let _ = out_tx.send(Message::Response(dispatched.response));
                                }
                                Err(_) => {
                                    error!(client = %addr, "Request handler timeout");
                                }
                            }
                        });
                        continue;
                    }

                    let Ok(dispatched) =
                        timeout(handler_timeout, dispatch(&handler, &ctx, request)).await
                    else {
                        error!(client = %addr, "Request handler timeout");
                        break Err(Error::MissingData("request handler timeout".to_owned()));
                    };

                    if let Some(stream) = dispatched.stream {
                        if let Some(old) = publish_pump.take() {
                            old.abort();
                        }
                        attached = Some(stream.session_id);
                        publish_pump = Some(spawn_publish_pump(stream, out_tx.clone()));
                    }

                    if out_tx.send(Message::Response(dispatched.response)).is_err() {
                        break Ok(());
                    }
                }
                // The only response a client sends is a Publish ack.
                Message::Response(Response::Publish(ack)) => {
                    if ack.status == Status::Ok {
                        handler.acknowledge_publish(ack.session_id, ack.index);
                    }
                }
                Message::Response(other) => {
                    warn!(client = %addr, kind = other.kind().as_str(), "Unexpected response from client");
                    break Err(Error::Codec("unexpected response from client".to_owned()));
                }
            }
        };

        if let Some(pump) = publish_pump {
            pump.abort();
        }
        if let Some(session_id) = attached {
            handler.close_session_stream(session_id);
        }
        drop(out_tx);
        let _ = writer.await;
        result
    }
}

struct SessionStream {
    session_id: SessionId,
    events: mpsc::UnboundedReceiver<crate::protocol::request::PublishRequest>,
}

struct Dispatched {
    response: Response,
    /// Event stream to start pumping after this response, if the request
    /// established one.
    stream: Option<SessionStream>,
}

async fn dispatch<H: Handler>(
    handler: &Arc<H>,
    ctx: &RequestContext,
    request: Request,
) -> Dispatched {
    match request {
        Request::Connect(req) => {
            let client_id = req.client_id;
            let response = handler.handle_connect(ctx, req).await;
            let stream = if response.status == Status::Ok && client_id != ClientId::UNSET {
                handler
                    .resume_session_stream(client_id)
                    .map(|(session_id, events)| SessionStream { session_id, events })
            } else {
                None
            };
            Dispatched {
                response: Response::Connect(response),
                stream,
            }
        }
        Request::Register(req) => {
            let response = handler.handle_register(ctx, req).await;
            let stream = if response.status == Status::Ok {
                handler
                    .open_session_stream(response.session_id)
                    .map(|events| SessionStream {
                        session_id: response.session_id,
                        events,
                    })
            } else {
                None
            };
            Dispatched {
                response: Response::Register(response),
                stream,
            }
        }
        Request::KeepAlive(req) => Dispatched {
            response: Response::KeepAlive(handler.handle_keep_alive(ctx, req).await),
            stream: None,
        },
        Request::Unregister(req) => Dispatched {
            response: Response::Unregister(handler.handle_unregister(ctx, req).await),
            stream: None,
        },
        Request::Command(req) => Dispatched {
            response: Response::Command(handler.handle_command(ctx, req).await),
            stream: None,
        },
        Request::Query(req) => Dispatched {
            response: Response::Query(handler.handle_query(ctx, req).await),
            stream: None,
        },
        // Publish flows server-to-client; a client sending one is a
        // protocol violation answered with an error ack.
        Request::Publish(req) => Dispatched {
            response: Response::Publish(crate::protocol::response::PublishResponse {
                id: req.id,
                status: Status::Error,
                error: Some(crate::protocol::response::ResponseError::new(
                    crate::error::ErrorCode::ProtocolError,
                    "publish is server-initiated",
                )),
                session_id: req.session_id,
                index: crate::types::EventIndex::ZERO,
            }),
            stream: None,
        },
    }
}

fn spawn_publish_pump(
    mut stream: SessionStream,
    out_tx: mpsc::UnboundedSender<Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(publish) = stream.events.recv().await {
            if out_tx
                .send(Message::Request(Request::Publish(publish)))
                .is_err()
            {
                break;
            }
        }
    })
}
