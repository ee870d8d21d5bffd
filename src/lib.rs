//! # Concord
//! Session-oriented distributed coordination core over a replicated log.
//!
//! Clients open long-lived sessions to a cluster, submit linearizable
//! commands and serializable queries against replicated state machines
//! ("resources"), and receive server-published events, all multiplexed over
//! a single replicated log. This crate is the session/ordering/event layer:
//! Raft consensus itself is consumed through the [`log::ReplicatedLog`]
//! interface, with [`log::LocalLog`] as the in-process implementation.
//!
//! # Goals
//! - Exactly-once, in-order command application per session
//! - Gap-free, contiguous event streams that survive reconnects
//! - Pluggable resource state machines behind single-writer drivers
//! - Deterministic snapshots: replicas applying the same log agree byte
//!   for byte
//!
//! ## Building a server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use concord::buffer::{BufferPool, PoolConfig};
//! use concord::config::{ServerConfig, SessionConfig};
//! use concord::log::{CompactionTracker, LocalLog, LocalLogOptions};
//! use concord::resource::{ResourceMultiplexer, registry};
//! use concord::server::{CoordinationServer, CoreHandler};
//! use concord::session::SessionManager;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     concord::telemetry::init_logging(concord::telemetry::LogFormat::from_env())?;
//!
//!     let session_config = SessionConfig::from_env();
//!     let server_config = ServerConfig::default();
//!
//!     let tracker = Arc::new(CompactionTracker::new());
//!     let registry = Arc::new(registry::ResourceTypeRegistry::with_builtins());
//!     registry.freeze();
//!
//!     let pool = BufferPool::new(PoolConfig {
//!         capacity: session_config.pool_capacity,
//!         ..Default::default()
//!     });
//!     let mux = Arc::new(ResourceMultiplexer::new(registry, tracker.clone(), pool));
//!     let sessions = SessionManager::new(session_config, mux);
//!     let log = Arc::new(LocalLog::new(
//!         Arc::new(sessions.clone()),
//!         tracker,
//!         Arc::new(object_store::memory::InMemory::new()),
//!         LocalLogOptions::default(),
//!     ));
//!     log.restore_from_store().await?;
//!
//!     let handler = CoreHandler::new(log, sessions, &server_config);
//!     handler.start_background_tasks();
//!
//!     let server = CoordinationServer::new(&server_config, handler).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod log;
pub mod machine;
pub mod protocol;
pub mod resource;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for building and embedding a coordination server.

    pub use crate::buffer::{Buffer, BufferPool, BufferReader, BufferWriter, PoolConfig};
    pub use crate::client::{ClientSession, ClientState, PublishOutcome};
    pub use crate::config::{ServerConfig, SessionConfig};
    pub use crate::error::{CoordError, CoordResult, Error, ErrorCode, Result};
    pub use crate::log::{
        CompactionTracker, LocalLog, LocalLogOptions, LogApplier, LogEntry, ReplicatedLog,
    };
    pub use crate::machine::{Driver, MachineContext, MachineError, StateMachine};
    pub use crate::protocol::{Consistency, Message, Request, Response, Status};
    pub use crate::resource::{InstanceEvent, ResourceMultiplexer, ResourceTypeRegistry};
    pub use crate::server::{CoordinationServer, CoreHandler, Handler, RequestContext};
    pub use crate::session::{SessionManager, SessionState};
    pub use crate::types::{
        ClientId, CommitIndex, CorrelationId, EventIndex, ResourceId, Sequence, SessionId, TypeId,
    };

    pub use bytes;
}
