//! Fixed pool of recorder identities.
//!
//! Each slot corresponds to one recorder token from the configuration. A
//! worker becomes acquirable once its client has logged in and reported its
//! Discord identity. One binding per worker, no queue: when every slot is
//! bound, new rooms simply run without a recorder.

use serenity::model::id::{ChannelId, UserId};
use tracing::{debug, info, warn};

/// Index into the recorder slot table, stable for the process lifetime.
pub type WorkerId = usize;

#[derive(Debug)]
struct WorkerSlot {
    /// Discord identity, known once the worker client has logged in.
    user: Option<UserId>,
    bound_to: Option<ChannelId>,
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size)
                .map(|_| WorkerSlot {
                    user: None,
                    bound_to: None,
                })
                .collect(),
        }
    }

    /// Record a worker client's login identity, making the slot acquirable.
    pub fn set_online(&mut self, worker: WorkerId, user: UserId) {
        match self.slots.get_mut(worker) {
            Some(slot) => {
                slot.user = Some(user);
                info!(worker, %user, "recorder worker online");
            }
            None => warn!(worker, "online report for unknown worker slot"),
        }
    }

    /// Bind any free online worker to `room`. Returns `None`, with no side
    /// effect, when every worker is bound or still offline.
    pub fn acquire(&mut self, room: ChannelId) -> Option<WorkerId> {
        let worker = self
            .slots
            .iter()
            .position(|slot| slot.user.is_some() && slot.bound_to.is_none())?;
        self.slots[worker].bound_to = Some(room);
        debug!(worker, %room, bound = self.bound_count(), "worker bound");
        Some(worker)
    }

    /// Channel the worker is currently bound to, if any.
    pub fn bound_room(&self, worker: WorkerId) -> Option<ChannelId> {
        self.slots.get(worker).and_then(|slot| slot.bound_to)
    }

    /// Unbind `worker` only if it is still bound to `room`. Teardown
    /// completions can outlive the binding they refer to; one that names a
    /// stale room must not free a slot a newer session holds.
    pub fn release_from(&mut self, worker: WorkerId, room: ChannelId) {
        if self.bound_room(worker) == Some(room) {
            self.release(worker);
        }
    }

    /// Unbind `worker`. Releasing an already-free worker is a no-op.
    pub fn release(&mut self, worker: WorkerId) {
        match self.slots.get_mut(worker) {
            Some(slot) => {
                if slot.bound_to.take().is_some() {
                    debug!(worker, "worker released");
                }
            }
            None => warn!(worker, "release for unknown worker slot"),
        }
    }

    /// True when `user` is one of the recorder identities. The occupancy
    /// router skips their voice events so recorders never count as members.
    pub fn is_worker(&self, user: UserId) -> bool {
        self.slots.iter().any(|slot| slot.user == Some(user))
    }

    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.bound_to.is_some()).count()
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }
}
