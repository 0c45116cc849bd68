//! I/O watch registry - descriptors, interest masks and their callbacks.
//!
//! Entries live in a generation-checked slot arena so a [`HandlerId`] can
//! never reach a recycled slot. Removal only tombstones an entry; the
//! reactor purges tombstones at one well-defined point per iteration, never
//! while dispatching, so a callback is never freed out from under an
//! in-flight invocation.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::dispatch::{hold, CallbackError, Dispatch};
use crate::error::RuntimeError;
use crate::poller::EventMask;
use crate::OwnerId;

/// Callback invoked on the reactor thread when a watched descriptor is
/// ready. `Dispatch::Done` or an error deactivates the handler.
pub type HandlerCallback = dyn FnMut(RawFd, EventMask) -> Result<Dispatch, CallbackError> + Send;

pub(crate) type SharedHandlerCallback = Arc<Mutex<Box<HandlerCallback>>>;

/// Generation-checked identity of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    index: u32,
    generation: u32,
}

struct HandlerEntry {
    owner: OwnerId,
    /// Watched descriptor; -1 once tombstoned.
    fd: RawFd,
    mask: EventMask,
    /// Registration sequence number, fixes dispatch order.
    seq: u64,
    callback: SharedHandlerCallback,
}

impl HandlerEntry {
    fn is_tombstoned(&self) -> bool {
        self.fd < 0
    }
}

struct Slot {
    generation: u32,
    entry: Option<HandlerEntry>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_seq: u64,
}

/// Thread-safe collection of I/O watch entries.
///
/// All mutators take the internal mutex; the lock is never held across a
/// callback invocation.
pub struct HandlerRegistry {
    inner: Mutex<Slots>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            inner: Mutex::new(Slots::default()),
        }
    }

    /// Register a watch on `fd` for the conditions in `mask`.
    ///
    /// Watching a descriptor that another owner already watches with an
    /// overlapping mask is a logic error, reported rather than merged.
    pub fn add<F>(
        &self,
        owner: OwnerId,
        fd: RawFd,
        mask: EventMask,
        callback: F,
    ) -> Result<HandlerId, RuntimeError>
    where
        F: FnMut(RawFd, EventMask) -> Result<Dispatch, CallbackError> + Send + 'static,
    {
        let mut inner = hold(&self.inner);

        for slot in &inner.slots {
            if let Some(entry) = &slot.entry {
                if !entry.is_tombstoned()
                    && entry.fd == fd
                    && entry.owner != owner
                    && entry.mask.intersects(mask)
                {
                    return Err(RuntimeError::DescriptorBusy {
                        fd,
                        owner: entry.owner,
                    });
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = HandlerEntry {
            owner,
            fd,
            mask,
            seq,
            callback: Arc::new(Mutex::new(Box::new(callback))),
        };

        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.entry = Some(entry);
                HandlerId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                HandlerId {
                    index,
                    generation: 0,
                }
            }
        };

        Ok(id)
    }

    /// Tombstone a handler. Returns false for stale or already removed ids.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut inner = hold(&self.inner);
        match Self::live_entry(&mut inner, id) {
            Some(entry) => {
                entry.fd = -1;
                true
            }
            None => false,
        }
    }

    /// Tombstone every handler registered by `owner`.
    pub fn remove_owner(&self, owner: OwnerId) -> usize {
        let mut inner = hold(&self.inner);
        let mut removed = 0;
        for slot in &mut inner.slots {
            if let Some(entry) = &mut slot.entry {
                if entry.owner == owner && !entry.is_tombstoned() {
                    entry.fd = -1;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::debug!("removed {removed} handlers of owner {owner:?}");
        }
        removed
    }

    /// Free tombstoned slots. Called by the reactor at its per-iteration
    /// purge point, never concurrently with dispatch.
    pub fn purge(&self) {
        let mut inner = hold(&self.inner);
        let mut freed = Vec::new();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            let tombstoned = slot.entry.as_ref().is_some_and(|e| e.is_tombstoned());
            if tombstoned {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index as u32);
            }
        }
        inner.free.extend(freed);
    }

    /// The immutable wait-set for one reactor iteration, in registration
    /// order. Concurrent add/remove calls take effect on the next snapshot.
    pub fn snapshot(&self) -> Vec<(HandlerId, RawFd, EventMask)> {
        let inner = hold(&self.inner);
        let mut entries: Vec<_> = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                if entry.is_tombstoned() {
                    return None;
                }
                Some((
                    entry.seq,
                    HandlerId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry.fd,
                    entry.mask,
                ))
            })
            .collect();
        entries.sort_by_key(|(seq, ..)| *seq);
        entries
            .into_iter()
            .map(|(_, id, fd, mask)| (id, fd, mask))
            .collect()
    }

    /// Locate a handler's callback for dispatch.
    ///
    /// Returns `None` when the handler was removed between snapshot and
    /// dispatch, or when the triggered conditions no longer match its
    /// interest (error and hangup always match).
    pub(crate) fn lookup(
        &self,
        id: HandlerId,
        triggered: EventMask,
    ) -> Option<(OwnerId, SharedHandlerCallback)> {
        let mut inner = hold(&self.inner);
        let entry = Self::live_entry(&mut inner, id)?;
        let relevant = entry.mask | EventMask::ERROR | EventMask::HANGUP;
        if !triggered.intersects(relevant) {
            return None;
        }
        Some((entry.owner, Arc::clone(&entry.callback)))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let inner = hold(&self.inner);
        inner
            .slots
            .iter()
            .filter(|s| s.entry.as_ref().is_some_and(|e| !e.is_tombstoned()))
            .count()
    }

    fn live_entry(inner: &mut Slots, id: HandlerId) -> Option<&mut HandlerEntry> {
        let slot = inner.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut().filter(|e| !e.is_tombstoned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(
    ) -> impl FnMut(RawFd, EventMask) -> Result<Dispatch, CallbackError> + Send + 'static {
        |_, _| Ok(Dispatch::Continue)
    }

    #[test]
    fn test_add_and_snapshot_in_registration_order() {
        let registry = HandlerRegistry::new();
        let owner = OwnerId::next();
        registry.add(owner, 10, EventMask::READABLE, noop()).unwrap();
        registry.add(owner, 11, EventMask::WRITABLE, noop()).unwrap();
        registry.add(owner, 12, EventMask::READABLE, noop()).unwrap();

        let fds: Vec<RawFd> = registry.snapshot().iter().map(|(_, fd, _)| *fd).collect();
        assert_eq!(fds, vec![10, 11, 12]);
    }

    #[test]
    fn test_duplicate_descriptor_other_owner_is_error() {
        let registry = HandlerRegistry::new();
        let a = OwnerId::next();
        let b = OwnerId::next();
        registry.add(a, 5, EventMask::READABLE, noop()).unwrap();

        let err = registry.add(b, 5, EventMask::READABLE, noop()).unwrap_err();
        assert!(matches!(err, RuntimeError::DescriptorBusy { fd: 5, .. }));

        // Disjoint mask on the same fd is allowed.
        registry.add(b, 5, EventMask::WRITABLE, noop()).unwrap();
        // Same owner may overlap.
        registry.add(a, 5, EventMask::READABLE, noop()).unwrap();
    }

    #[test]
    fn test_remove_tombstones_until_purge() {
        let registry = HandlerRegistry::new();
        let owner = OwnerId::next();
        let id = registry.add(owner, 7, EventMask::READABLE, noop()).unwrap();

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.snapshot().is_empty());
        assert!(registry.lookup(id, EventMask::READABLE).is_none());

        registry.purge();
        // Slot is recycled under a new generation; the old id stays dead.
        let id2 = registry.add(owner, 8, EventMask::READABLE, noop()).unwrap();
        assert!(registry.lookup(id, EventMask::READABLE).is_none());
        assert!(registry.lookup(id2, EventMask::READABLE).is_some());
    }

    #[test]
    fn test_remove_owner_bulk() {
        let registry = HandlerRegistry::new();
        let a = OwnerId::next();
        let b = OwnerId::next();
        registry.add(a, 1, EventMask::READABLE, noop()).unwrap();
        registry.add(a, 2, EventMask::READABLE, noop()).unwrap();
        registry.add(b, 3, EventMask::READABLE, noop()).unwrap();

        assert_eq!(registry.remove_owner(a), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_respects_mask() {
        let registry = HandlerRegistry::new();
        let owner = OwnerId::next();
        let id = registry.add(owner, 4, EventMask::READABLE, noop()).unwrap();

        assert!(registry.lookup(id, EventMask::WRITABLE).is_none());
        assert!(registry.lookup(id, EventMask::READABLE).is_some());
        // Hangup dispatches even without explicit interest.
        assert!(registry.lookup(id, EventMask::HANGUP).is_some());
    }
}
