//! Epoch-based deferred reclamation.
//!
//! Readers and compaction jobs hold a [`Guard`] for their whole
//! operation. Resources retired through [`Guard::delete`] are stamped
//! with the newest guard sequence issued so far; their storage is freed
//! only once every guard at or below that stamp has ended. A reader
//! that took its snapshot before a table was removed can therefore keep
//! iterating it safely.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::l0::L0Table;

/// Storage that can be reclaimed once no pre-existing reader can reach
/// it anymore.
pub trait Reclaimable: Send {
    fn id(&self) -> u64;

    /// Frees the backing storage. Failures are logged, not propagated;
    /// reclamation runs far from any caller able to handle them.
    fn reclaim(&self);
}

impl Reclaimable for kombu_table::Table {
    fn id(&self) -> u64 {
        kombu_table::Table::id(self)
    }

    fn reclaim(&self) {
        if let Err(err) = self.delete_file() {
            tracing::warn!(id = kombu_table::Table::id(self), ?err, "failed to delete table file");
        }
    }
}

impl Reclaimable for Arc<L0Table> {
    fn id(&self) -> u64 {
        L0Table::id(self)
    }

    fn reclaim(&self) {
        if let Err(err) = self.delete_file() {
            tracing::warn!(id = L0Table::id(self), ?err, "failed to delete L0 file");
        }
    }
}

pub struct ResourceManager {
    inner: Mutex<ManagerInner>,
}

struct ManagerInner {
    next_seq: u64,
    active: BTreeSet<u64>,
    /// Retired resources, stamped with the guard-seq barrier they must
    /// outlive.
    pending: Vec<(u64, Vec<Box<dyn Reclaimable>>)>,
}

impl ResourceManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ManagerInner {
                next_seq: 0,
                active: BTreeSet::new(),
                pending: Vec::new(),
            }),
        })
    }

    /// Opens a new epoch guard.
    pub fn acquire(self: &Arc<Self>) -> Guard {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.active.insert(seq);
        Guard {
            mgr: self.clone(),
            seq,
        }
    }

    fn defer(&self, resources: Vec<Box<dyn Reclaimable>>) {
        if resources.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let barrier = inner.next_seq;
        inner.pending.push((barrier, resources));
    }

    fn release(&self, seq: u64) {
        let ready = {
            let mut inner = self.inner.lock();
            inner.active.remove(&seq);
            let min_active = inner.active.iter().next().copied();
            let mut ready = Vec::new();
            inner.pending.retain_mut(|(barrier, resources)| {
                let free = match min_active {
                    Some(min) => *barrier < min,
                    None => true,
                };
                if free {
                    ready.append(resources);
                }
                !free
            });
            ready
        };
        // Reclaim outside the lock; file deletion can block.
        for resource in ready {
            resource.reclaim();
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().pending.iter().map(|(_, r)| r.len()).sum()
    }
}

/// Scoped epoch registration. Dropping the guard ends the epoch.
pub struct Guard {
    mgr: Arc<ResourceManager>,
    seq: u64,
}

impl Guard {
    /// Schedules `resources` for reclamation after every guard alive
    /// right now has ended.
    pub fn delete(&self, resources: Vec<Box<dyn Reclaimable>>) {
        self.mgr.defer(resources);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.mgr.release(self.seq);
    }
}
