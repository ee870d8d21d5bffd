//! Single-writer executor for one state machine.
//!
//! Each driver owns its machine behind an mpsc task queue drained by one
//! worker task: application is strictly sequential per machine while
//! distinct drivers run in parallel. The worker is also where snapshot and
//! restore run, so they serialize against command application for free.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::{MachineContext, MachineError, StateMachine};
use crate::buffer::Buffer;
use crate::error::{CoordError, CoordResult};
use crate::protocol::Consistency;
use crate::types::{CommitIndex, ResourceId, SessionId};

/// Depth of a driver's task queue.
const DRIVER_QUEUE_DEPTH: usize = 256;

/// Session lifecycle transitions forwarded to a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Register,
    Unregister,
    Expire,
    Close,
}

/// Effects of applying one command.
#[derive(Debug)]
pub struct CommandEffects {
    pub result: Result<Vec<u8>, MachineError>,
    /// Events the machine published, in publication order.
    pub published: Vec<(SessionId, Vec<u8>)>,
    /// Highest entry the machine released during this application.
    pub released: Option<CommitIndex>,
}

/// Effects of a lifecycle callback.
#[derive(Debug)]
pub struct LifecycleEffects {
    pub published: Vec<(SessionId, Vec<u8>)>,
    pub released: Option<CommitIndex>,
}

enum DriverTask {
    Command {
        session: SessionId,
        index: CommitIndex,
        payload: Vec<u8>,
        reply: oneshot::Sender<CommandEffects>,
    },
    Query {
        session: SessionId,
        payload: Vec<u8>,
        consistency: Consistency,
        reply: oneshot::Sender<Result<Vec<u8>, MachineError>>,
    },
    Lifecycle {
        kind: Lifecycle,
        session: SessionId,
        reply: oneshot::Sender<LifecycleEffects>,
    },
    IsQuiescent {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        buffer: Buffer,
        reply: oneshot::Sender<Result<Vec<u8>, MachineError>>,
    },
    Restore {
        buffer: Buffer,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), MachineError>>,
    },
}

/// Handle to a running state-machine worker.
///
/// Dropping the last handle closes the task queue; the worker drains what
/// is already queued and stops.
pub struct Driver {
    machine_id: ResourceId,
    tx: mpsc::Sender<DriverTask>,
}

impl Driver {
    /// Spawn a worker task owning `machine`.
    pub fn spawn(machine_id: ResourceId, machine: Box<dyn StateMachine>) -> Self {
        let (tx, rx) = mpsc::channel(DRIVER_QUEUE_DEPTH);
        tokio::spawn(run_worker(machine_id, machine, rx));
        debug!(machine = %machine_id, "State machine driver started");
        Self { machine_id, tx }
    }

    pub fn machine_id(&self) -> ResourceId {
        self.machine_id
    }

    /// Apply a committed command; resolves with the machine's result and
    /// any events it published.
    pub async fn apply_command(
        &self,
        session: SessionId,
        index: CommitIndex,
        payload: Vec<u8>,
    ) -> CoordResult<CommandEffects> {
        let (reply, rx) = oneshot::channel();
        self.submit(DriverTask::Command {
            session,
            index,
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.worker_died())
    }

    /// Execute a query against current state.
    pub async fn apply_query(
        &self,
        session: SessionId,
        payload: Vec<u8>,
        consistency: Consistency,
    ) -> CoordResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.submit(DriverTask::Query {
            session,
            payload,
            consistency,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| self.worker_died())?
            .map_err(|e| CoordError::Application(e.0))
    }

    /// Forward a session lifecycle transition.
    pub async fn lifecycle(
        &self,
        kind: Lifecycle,
        session: SessionId,
    ) -> CoordResult<LifecycleEffects> {
        let (reply, rx) = oneshot::channel();
        self.submit(DriverTask::Lifecycle {
            kind,
            session,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.worker_died())
    }

    pub async fn is_quiescent(&self) -> CoordResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.submit(DriverTask::IsQuiescent { reply }).await?;
        rx.await.map_err(|_| self.worker_died())
    }

    /// Capture the machine's state through `buffer` (typically pooled).
    pub async fn snapshot(&self, buffer: Buffer) -> CoordResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.submit(DriverTask::Snapshot { buffer, reply }).await?;
        rx.await
            .map_err(|_| self.worker_died())?
            .map_err(|e| CoordError::Internal(format!("snapshot failed: {e}")))
    }

    /// Rebuild the machine's state from a capture staged through `buffer`.
    pub async fn restore(&self, buffer: Buffer, data: Vec<u8>) -> CoordResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(DriverTask::Restore { buffer, data, reply }).await?;
        rx.await
            .map_err(|_| self.worker_died())?
            .map_err(|e| CoordError::Internal(format!("restore failed: {e}")))
    }

    async fn submit(&self, task: DriverTask) -> CoordResult<()> {
        self.tx.send(task).await.map_err(|_| self.worker_died())
    }

    /// A dead worker means the machine panicked: a determinism violation
    /// that is fatal to the replica. Surfaced as an internal error so the
    /// caller can abort and recover from a snapshot.
    fn worker_died(&self) -> CoordError {
        error!(machine = %self.machine_id, "State machine worker terminated");
        CoordError::Internal(format!(
            "state machine {} worker terminated",
            self.machine_id
        ))
    }
}

async fn run_worker(
    machine_id: ResourceId,
    mut machine: Box<dyn StateMachine>,
    mut rx: mpsc::Receiver<DriverTask>,
) {
    while let Some(task) = rx.recv().await {
        match task {
            DriverTask::Command {
                session,
                index,
                payload,
                reply,
            } => {
                let mut ctx = MachineContext::new(index);
                let result = machine.apply_command(&mut ctx, session, &payload);
                let (published, released) = ctx.into_effects();
                let _ = reply.send(CommandEffects {
                    result,
                    published,
                    released,
                });
            }
            DriverTask::Query {
                session,
                payload,
                consistency,
                reply,
            } => {
                let result = machine.apply_query(session, &payload, consistency);
                let _ = reply.send(result);
            }
            DriverTask::Lifecycle {
                kind,
                session,
                reply,
            } => {
                let mut ctx = MachineContext::new(CommitIndex::ZERO);
                match kind {
                    Lifecycle::Register => machine.on_register(&mut ctx, session),
                    Lifecycle::Unregister => machine.on_unregister(&mut ctx, session),
                    Lifecycle::Expire => machine.on_expire(&mut ctx, session),
                    Lifecycle::Close => machine.on_close(&mut ctx, session),
                }
                let (published, released) = ctx.into_effects();
                let _ = reply.send(LifecycleEffects {
                    published,
                    released,
                });
            }
            DriverTask::IsQuiescent { reply } => {
                let _ = reply.send(machine.is_quiescent());
            }
            DriverTask::Snapshot { buffer, reply } => {
                let mut writer = buffer.writer();
                let result = machine.snapshot(&mut writer).map(|()| {
                    drop(writer);
                    buffer.contents()
                });
                let _ = reply.send(result);
            }
            DriverTask::Restore { buffer, data, reply } => {
                buffer.writer().write_all(&data);
                let mut reader = buffer.reader();
                let _ = reply.send(machine.restore(&mut reader));
            }
        }
    }
    debug!(machine = %machine_id, "State machine driver stopped");
}
