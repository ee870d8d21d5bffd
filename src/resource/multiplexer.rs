//! Routing of session-scoped operations to state machine instances.
//!
//! The multiplexer owns the table of live resource instances, lazily
//! instantiates them from the type registry on first touch, forwards
//! commands and queries to the owning driver in FIFO order, and tags every
//! outbound event with the originating resource id.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::registry::ResourceTypeRegistry;
use super::{InstanceEvent, InstanceState};
use crate::buffer::BufferPool;
use crate::error::{CoordError, CoordResult};
use crate::log::CompactionTracker;
use crate::machine::{Driver, Lifecycle};
use crate::protocol::Consistency;
use crate::types::{CommitIndex, ResourceId, SessionId, TypeId};

/// An event addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub event: InstanceEvent,
}

/// Result of dispatching one command to a machine.
#[derive(Debug)]
pub struct CommandDispatch {
    /// The machine's result bytes, or the application error to surface.
    pub result: CoordResult<Vec<u8>>,
    /// Events the machine published during this command.
    pub events: Vec<SessionEvent>,
}

/// Serialized capture of one machine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub resource_id: ResourceId,
    pub type_id: TypeId,
    pub holders: Vec<SessionId>,
    pub state: InstanceState,
    pub data: Vec<u8>,
}

struct Instance {
    type_id: TypeId,
    driver: Arc<Driver>,
    holders: HashSet<SessionId>,
    state: InstanceState,
}

/// Maps resource ids to state machine instances and routes operations.
pub struct ResourceMultiplexer {
    resources: DashMap<ResourceId, Instance>,
    registry: Arc<ResourceTypeRegistry>,
    tracker: Arc<CompactionTracker>,
    /// Pool for the buffers that stage machine snapshots.
    pool: BufferPool,
}

impl ResourceMultiplexer {
    pub fn new(
        registry: Arc<ResourceTypeRegistry>,
        tracker: Arc<CompactionTracker>,
        pool: BufferPool,
    ) -> Self {
        Self {
            resources: DashMap::new(),
            registry,
            tracker,
            pool,
        }
    }

    /// Open a resource for a session, instantiating the machine if this is
    /// the first reference. Idempotent for sessions already holding it.
    ///
    /// Returns the events published by the machine's register callback.
    pub async fn open(
        &self,
        session: SessionId,
        resource_id: ResourceId,
        type_id: TypeId,
    ) -> CoordResult<Vec<SessionEvent>> {
        let (driver, newly_held) = {
            match self.resources.entry(resource_id) {
                Entry::Occupied(mut occupied) => {
                    let instance = occupied.get_mut();
                    if instance.type_id != type_id {
                        return Err(CoordError::Protocol(format!(
                            "resource {resource_id} is of type {}, not {type_id}",
                            instance.type_id
                        )));
                    }
                    let newly_held = instance.holders.insert(session);
                    if instance.state == InstanceState::Quiescent {
                        instance.state = InstanceState::Open;
                    }
                    (instance.driver.clone(), newly_held)
                }
                Entry::Vacant(vacant) => {
                    let machine = self.registry.create(type_id)?;
                    let driver = Arc::new(Driver::spawn(resource_id, machine));
                    self.tracker.track(resource_id);
                    let mut holders = HashSet::new();
                    holders.insert(session);
                    vacant.insert(Instance {
                        type_id,
                        driver: driver.clone(),
                        holders,
                        state: InstanceState::Created,
                    });
                    debug!(resource = %resource_id, r#type = %type_id, "Resource instantiated");
                    (driver, true)
                }
            }
        };

        if !newly_held {
            return Ok(Vec::new());
        }

        let effects = driver.lifecycle(Lifecycle::Register, session).await?;
        if let Some(mut instance) = self.resources.get_mut(&resource_id) {
            if instance.state == InstanceState::Created {
                instance.state = InstanceState::Open;
            }
        }
        self.absorb_release(resource_id, effects.released);
        Ok(self.tag(resource_id, effects.published))
    }

    /// Deliver a command to the owning driver.
    pub async fn dispatch_command(
        &self,
        session: SessionId,
        resource_id: ResourceId,
        index: CommitIndex,
        payload: Vec<u8>,
    ) -> CoordResult<CommandDispatch> {
        let driver = self.driver_for(resource_id)?;
        let effects = driver.apply_command(session, index, payload).await?;
        self.absorb_release(resource_id, effects.released);

        Ok(CommandDispatch {
            result: effects.result.map_err(|e| CoordError::Application(e.0)),
            events: self.tag(resource_id, effects.published),
        })
    }

    /// Deliver a query to the owning driver.
    pub async fn dispatch_query(
        &self,
        session: SessionId,
        resource_id: ResourceId,
        payload: Vec<u8>,
        consistency: Consistency,
    ) -> CoordResult<Vec<u8>> {
        let driver = self.driver_for(resource_id)?;
        driver.apply_query(session, payload, consistency).await
    }

    /// Close one session's handle to a resource.
    pub async fn close(
        &self,
        session: SessionId,
        resource_id: ResourceId,
    ) -> CoordResult<Vec<SessionEvent>> {
        let driver = self.driver_for(resource_id)?;
        let effects = driver.lifecycle(Lifecycle::Close, session).await?;
        self.absorb_release(resource_id, effects.released);
        self.release_holder(session, resource_id, &driver).await;
        Ok(self.tag(resource_id, effects.published))
    }

    /// Release every resource a departing session holds.
    ///
    /// `expired` selects the expire callback over the graceful unregister
    /// one. Events published by the callbacks (e.g. membership changes) are
    /// returned for delivery to surviving sessions.
    pub async fn session_closed(
        &self,
        session: SessionId,
        expired: bool,
        held: &[ResourceId],
    ) -> Vec<SessionEvent> {
        let kind = if expired {
            Lifecycle::Expire
        } else {
            Lifecycle::Unregister
        };

        let mut events = Vec::new();
        for resource_id in held {
            let Ok(driver) = self.driver_for(*resource_id) else {
                continue;
            };
            match driver.lifecycle(kind, session).await {
                Ok(effects) => {
                    self.absorb_release(*resource_id, effects.released);
                    events.extend(self.tag(*resource_id, effects.published));
                }
                Err(e) => {
                    warn!(resource = %resource_id, session = %session, error = %e,
                        "Lifecycle callback failed during session close");
                }
            }
            self.release_holder(session, *resource_id, &driver).await;
        }
        events
    }

    /// Destroy quiescent instances. Returns the destroyed resource ids.
    pub async fn reap(&self) -> Vec<ResourceId> {
        let candidates: Vec<(ResourceId, Arc<Driver>)> = self
            .resources
            .iter()
            .filter(|entry| entry.state == InstanceState::Quiescent)
            .map(|entry| (*entry.key(), entry.driver.clone()))
            .collect();

        let mut destroyed = Vec::new();
        for (resource_id, driver) in candidates {
            if !driver.is_quiescent().await.unwrap_or(false) {
                continue;
            }
            let removed = self
                .resources
                .remove_if(&resource_id, |_, instance| {
                    instance.holders.is_empty() && instance.state == InstanceState::Quiescent
                })
                .is_some();
            if removed {
                self.tracker.untrack(resource_id);
                debug!(resource = %resource_id, "Quiescent resource destroyed");
                destroyed.push(resource_id);
            }
        }
        destroyed
    }

    /// Whether a resource currently exists.
    pub fn contains(&self, resource_id: ResourceId) -> bool {
        self.resources.contains_key(&resource_id)
    }

    /// Sessions currently holding a resource open.
    pub fn holders(&self, resource_id: ResourceId) -> Vec<SessionId> {
        self.resources
            .get(&resource_id)
            .map(|instance| {
                let mut holders: Vec<_> = instance.holders.iter().copied().collect();
                holders.sort();
                holders
            })
            .unwrap_or_default()
    }

    /// Capture every instance deterministically (sorted by resource id).
    pub async fn snapshot_all(&self) -> CoordResult<Vec<MachineSnapshot>> {
        let mut ids: Vec<ResourceId> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut snapshots = Vec::with_capacity(ids.len());
        for resource_id in ids {
            let Some((type_id, driver, holders, state)) =
                self.resources.get(&resource_id).map(|instance| {
                    let mut holders: Vec<_> = instance.holders.iter().copied().collect();
                    holders.sort();
                    (instance.type_id, instance.driver.clone(), holders, instance.state)
                })
            else {
                continue;
            };
            let data = driver.snapshot(self.pool.acquire().await).await?;
            snapshots.push(MachineSnapshot {
                resource_id,
                type_id,
                holders,
                state,
                data,
            });
        }
        Ok(snapshots)
    }

    /// Rebuild every instance from a capture, replacing current state.
    pub async fn restore_all(&self, snapshots: Vec<MachineSnapshot>) -> CoordResult<()> {
        for entry in self.resources.iter() {
            self.tracker.untrack(*entry.key());
        }
        self.resources.clear();

        for snapshot in snapshots {
            let machine = self.registry.create(snapshot.type_id)?;
            let driver = Arc::new(Driver::spawn(snapshot.resource_id, machine));
            driver
                .restore(self.pool.acquire().await, snapshot.data)
                .await?;
            self.tracker.track(snapshot.resource_id);
            self.resources.insert(
                snapshot.resource_id,
                Instance {
                    type_id: snapshot.type_id,
                    driver,
                    holders: snapshot.holders.into_iter().collect(),
                    state: snapshot.state,
                },
            );
        }
        Ok(())
    }

    fn driver_for(&self, resource_id: ResourceId) -> CoordResult<Arc<Driver>> {
        self.resources
            .get(&resource_id)
            .map(|instance| instance.driver.clone())
            .ok_or(CoordError::UnknownResource(resource_id))
    }

    fn absorb_release(&self, resource_id: ResourceId, released: Option<CommitIndex>) {
        if let Some(up_to) = released {
            self.tracker.release(resource_id, up_to);
        }
    }

    fn tag(&self, resource_id: ResourceId, published: Vec<(SessionId, Vec<u8>)>) -> Vec<SessionEvent> {
        published
            .into_iter()
            .map(|(session_id, payload)| SessionEvent {
                session_id,
                event: InstanceEvent {
                    resource_id,
                    payload,
                },
            })
            .collect()
    }

    /// Drop a session from an instance's holder set, marking the instance
    /// quiescent when the last holder leaves a machine that reports itself
    /// quiescent.
    async fn release_holder(&self, session: SessionId, resource_id: ResourceId, driver: &Driver) {
        let empty = {
            let Some(mut instance) = self.resources.get_mut(&resource_id) else {
                return;
            };
            instance.holders.remove(&session);
            instance.holders.is_empty()
        };

        if empty && driver.is_quiescent().await.unwrap_or(false) {
            if let Some(mut instance) = self.resources.get_mut(&resource_id) {
                if instance.holders.is_empty() && instance.state == InstanceState::Open {
                    instance.state = InstanceState::Quiescent;
                }
            }
        }
    }
}
