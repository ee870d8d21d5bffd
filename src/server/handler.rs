//! Request handling.
//!
//! [`Handler`] defines how a server responds to protocol requests, with
//! defaults that reject operations the implementation does not support.
//! [`CoreHandler`] is the production implementation wiring requests to the
//! replicated log and the session manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::constants::DEFAULT_REAPER_INTERVAL_MS;
use crate::error::{CoordError, ErrorCode};
use crate::log::{ApplyResult, LogEntry, LocalLog, ReplicatedLog};
use crate::protocol::request::*;
use crate::protocol::response::*;
use crate::session::SessionManager;
use crate::types::{ClientId, CommitIndex, CorrelationId, EventIndex, SessionId};

/// Context for a single request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_addr: SocketAddr,
    pub request_id: Uuid,
}

/// Defines how the server responds to protocol requests.
///
/// Defaults answer every operation with `PROTOCOL_ERROR`, so a partial
/// implementation fails loudly rather than silently succeeding.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_connect(&self, _ctx: &RequestContext, request: ConnectRequest) -> ConnectResponse {
        ConnectResponse {
            id: request.id,
            status: Status::Ok,
            error: None,
            leader: None,
            members: Vec::new(),
        }
    }

    async fn handle_register(
        &self,
        _ctx: &RequestContext,
        request: RegisterRequest,
    ) -> RegisterResponse {
        RegisterResponse {
            id: request.id,
            status: Status::Error,
            error: Some(ResponseError::new(
                ErrorCode::ProtocolError,
                "registration not supported",
            )),
            session_id: SessionId::NONE,
            timeout_ms: 0,
            leader: None,
            members: Vec::new(),
        }
    }

    async fn handle_keep_alive(
        &self,
        _ctx: &RequestContext,
        request: KeepAliveRequest,
    ) -> KeepAliveResponse {
        KeepAliveResponse {
            id: request.id,
            status: Status::Error,
            error: Some(ResponseError::new(
                ErrorCode::ProtocolError,
                "keep-alive not supported",
            )),
            leader: None,
            members: Vec::new(),
        }
    }

    async fn handle_unregister(
        &self,
        _ctx: &RequestContext,
        request: UnregisterRequest,
    ) -> UnregisterResponse {
        UnregisterResponse {
            id: request.id,
            status: Status::Error,
            error: Some(ResponseError::new(
                ErrorCode::ProtocolError,
                "unregister not supported",
            )),
        }
    }

    async fn handle_command(&self, _ctx: &RequestContext, request: CommandRequest) -> CommandResponse {
        CommandResponse {
            id: request.id,
            status: Status::Error,
            error: Some(ResponseError::new(
                ErrorCode::ProtocolError,
                "commands not supported",
            )),
            index: CommitIndex::ZERO,
            event_index: EventIndex::ZERO,
            result: Vec::new(),
        }
    }

    async fn handle_query(&self, _ctx: &RequestContext, request: QueryRequest) -> QueryResponse {
        QueryResponse {
            id: request.id,
            status: Status::Error,
            error: Some(ResponseError::new(
                ErrorCode::ProtocolError,
                "queries not supported",
            )),
            index: CommitIndex::ZERO,
            event_index: EventIndex::ZERO,
            result: Vec::new(),
        }
    }

    /// Open the server-to-client event stream for a freshly registered
    /// session on this connection.
    fn open_session_stream(
        &self,
        _session_id: SessionId,
    ) -> Option<mpsc::UnboundedReceiver<PublishRequest>> {
        None
    }

    /// Reattach a reconnecting client to its live session's event stream.
    fn resume_session_stream(
        &self,
        _client_id: ClientId,
    ) -> Option<(SessionId, mpsc::UnboundedReceiver<PublishRequest>)> {
        None
    }

    /// Record a client's Publish acknowledgement.
    fn acknowledge_publish(&self, _session_id: SessionId, _index: EventIndex) {}

    /// The connection serving this session went away.
    fn close_session_stream(&self, _session_id: SessionId) {}
}

/// The production handler: routes mutations through the replicated log and
/// queries through the session manager.
pub struct CoreHandler {
    log: Arc<LocalLog>,
    sessions: SessionManager,
    local_addr: String,
    members: Vec<String>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CoreHandler {
    pub fn new(log: Arc<LocalLog>, sessions: SessionManager, config: &ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            log,
            sessions,
            local_addr: config.bind_addr.clone(),
            members: config.members.clone(),
            shutdown_tx,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn log(&self) -> &Arc<LocalLog> {
        &self.log
    }

    /// Start the quiescent-resource reaper. Jittered so replicas do not
    /// sweep in lockstep.
    pub fn start_background_tasks(&self) {
        let mux = self.sessions.multiplexer().clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let base = Duration::from_millis(DEFAULT_REAPER_INTERVAL_MS);
            loop {
                let jitter = Duration::from_millis(fastrand::u64(0..=DEFAULT_REAPER_INTERVAL_MS / 4));
                tokio::select! {
                    _ = tokio::time::sleep(base + jitter) => {
                        let destroyed = mux.reap().await;
                        if !destroyed.is_empty() {
                            debug!(count = destroyed.len(), "Reaped quiescent resources");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn leader_hint(&self) -> Option<String> {
        if self.log.is_leader() {
            Some(self.local_addr.clone())
        } else {
            self.log.leader()
        }
    }

    fn hint_for(&self, error: &CoordError) -> Option<String> {
        match error {
            CoordError::NoLeader { leader } => leader.clone().or_else(|| self.leader_hint()),
            _ => self.leader_hint(),
        }
    }
}

#[async_trait]
impl Handler for CoreHandler {
    async fn handle_connect(&self, ctx: &RequestContext, request: ConnectRequest) -> ConnectResponse {
        debug!(request_id = %ctx.request_id, client = %request.client_id, "Connect");
        ConnectResponse {
            id: request.id,
            status: Status::Ok,
            error: None,
            leader: self.leader_hint(),
            members: self.members.clone(),
        }
    }

    async fn handle_register(
        &self,
        ctx: &RequestContext,
        request: RegisterRequest,
    ) -> RegisterResponse {
        let entry = LogEntry::Register {
            client_id: request.client_id,
            timeout_ms: request.timeout_ms,
        };

        match self.log.append(entry).await {
            Ok((_, ApplyResult::Registered {
                session_id,
                timeout_ms,
            })) => RegisterResponse {
                id: request.id,
                status: Status::Ok,
                error: None,
                session_id,
                timeout_ms,
                leader: self.leader_hint(),
                members: self.members.clone(),
            },
            Ok(_) => register_error(
                request.id,
                &CoordError::Internal("register applied to an unexpected result".to_string()),
                self.leader_hint(),
                self.members.clone(),
            ),
            Err(error) => {
                warn!(request_id = %ctx.request_id, %error, "Register failed");
                let hint = self.hint_for(&error);
                register_error(request.id, &error, hint, self.members.clone())
            }
        }
    }

    async fn handle_keep_alive(
        &self,
        _ctx: &RequestContext,
        request: KeepAliveRequest,
    ) -> KeepAliveResponse {
        let entry = LogEntry::KeepAlive {
            session_id: request.session_id,
            command_sequence_ack: request.command_sequence_ack,
            event_index_ack: request.event_index_ack,
        };

        let outcome = match self.log.append(entry).await {
            Ok((_, ApplyResult::KeepAlive(result))) => result,
            Ok(_) => Err(CoordError::Internal(
                "keep-alive applied to an unexpected result".to_string(),
            )),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(()) => KeepAliveResponse {
                id: request.id,
                status: Status::Ok,
                error: None,
                leader: self.leader_hint(),
                members: self.members.clone(),
            },
            Err(error) => {
                let hint = self.hint_for(&error);
                KeepAliveResponse {
                    id: request.id,
                    status: Status::Error,
                    error: Some(ResponseError::from(&error)),
                    leader: hint,
                    members: self.members.clone(),
                }
            }
        }
    }

    async fn handle_unregister(
        &self,
        _ctx: &RequestContext,
        request: UnregisterRequest,
    ) -> UnregisterResponse {
        let entry = LogEntry::Unregister {
            session_id: request.session_id,
        };

        let outcome = match self.log.append(entry).await {
            Ok((_, ApplyResult::Unregistered(result))) => result,
            Ok(_) => Err(CoordError::Internal(
                "unregister applied to an unexpected result".to_string(),
            )),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(()) => UnregisterResponse {
                id: request.id,
                status: Status::Ok,
                error: None,
            },
            Err(error) => UnregisterResponse {
                id: request.id,
                status: Status::Error,
                error: Some(ResponseError::from(&error)),
            },
        }
    }

    async fn handle_command(&self, ctx: &RequestContext, request: CommandRequest) -> CommandResponse {
        let entry = LogEntry::Command {
            session_id: request.session_id,
            sequence: request.sequence,
            resource_id: request.resource_id,
            type_id: request.type_id,
            payload: request.bytes,
        };

        let completion = match self.log.append(entry).await {
            Ok((_, ApplyResult::Command(completion))) => completion,
            Ok(_) => {
                return command_error(
                    request.id,
                    &CoordError::Internal("command applied to an unexpected result".to_string()),
                );
            }
            Err(error) => {
                debug!(request_id = %ctx.request_id, %error, "Command rejected");
                return command_error(request.id, &error);
            }
        };

        // The command is committed; it resolves once earlier sequences
        // have applied. A dropped completion means the entry was
        // superseded by a retransmit of the same sequence.
        match completion.await {
            Ok(outcome) => match outcome.result {
                Ok(result) => CommandResponse {
                    id: request.id,
                    status: Status::Ok,
                    error: None,
                    index: outcome.index,
                    event_index: outcome.event_index,
                    result,
                },
                Err(error) => CommandResponse {
                    id: request.id,
                    status: Status::Error,
                    error: Some(ResponseError::from(&error)),
                    index: outcome.index,
                    event_index: outcome.event_index,
                    result: Vec::new(),
                },
            },
            Err(_) => command_error(
                request.id,
                &CoordError::CommandFailure("command superseded by a retransmission".to_string()),
            ),
        }
    }

    async fn handle_query(&self, ctx: &RequestContext, request: QueryRequest) -> QueryResponse {
        let read_index = match self.log.read_index(request.consistency).await {
            Ok(index) => index,
            Err(error) => {
                debug!(request_id = %ctx.request_id, %error, "Query rejected");
                return query_error(request.id, &error);
            }
        };

        let deadline = request.deadline_ms.map(Duration::from_millis);
        match self
            .sessions
            .query(
                request.session_id,
                request.sequence,
                request.resource_id,
                request.bytes,
                request.consistency,
                deadline,
            )
            .await
        {
            Ok((event_index, result)) => QueryResponse {
                id: request.id,
                status: Status::Ok,
                error: None,
                index: read_index,
                event_index,
                result,
            },
            Err(error) => query_error(request.id, &error),
        }
    }

    fn open_session_stream(
        &self,
        session_id: SessionId,
    ) -> Option<mpsc::UnboundedReceiver<PublishRequest>> {
        self.sessions.attach(session_id).ok()
    }

    fn resume_session_stream(
        &self,
        client_id: ClientId,
    ) -> Option<(SessionId, mpsc::UnboundedReceiver<PublishRequest>)> {
        self.sessions.resume(client_id).ok()
    }

    fn acknowledge_publish(&self, session_id: SessionId, index: EventIndex) {
        let _ = self.sessions.acknowledge_events(session_id, index);
    }

    fn close_session_stream(&self, session_id: SessionId) {
        self.sessions.detach(session_id);
    }
}

fn register_error(
    id: CorrelationId,
    error: &CoordError,
    leader: Option<String>,
    members: Vec<String>,
) -> RegisterResponse {
    RegisterResponse {
        id,
        status: Status::Error,
        error: Some(ResponseError::from(error)),
        session_id: SessionId::NONE,
        timeout_ms: 0,
        leader,
        members,
    }
}

fn command_error(id: CorrelationId, error: &CoordError) -> CommandResponse {
    CommandResponse {
        id,
        status: Status::Error,
        error: Some(ResponseError::from(error)),
        index: CommitIndex::ZERO,
        event_index: EventIndex::ZERO,
        result: Vec::new(),
    }
}

fn query_error(id: CorrelationId, error: &CoordError) -> QueryResponse {
    QueryResponse {
        id,
        status: Status::Error,
        error: Some(ResponseError::from(error)),
        index: CommitIndex::ZERO,
        event_index: EventIndex::ZERO,
        result: Vec::new(),
    }
}
