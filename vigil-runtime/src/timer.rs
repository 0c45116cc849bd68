//! Timer registry - scheduled and recurring callbacks with due times.
//!
//! `compute_next_wait` is the scheduling core: one pass under the registry
//! lock collects everything due and folds the earliest remaining deadline
//! into the reactor's wait budget. Due callbacks are handed back to the
//! reactor and invoked after the lock is released, so a timer callback may
//! freely register or remove other timers.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::dispatch::{hold, CallbackError, Dispatch};
use crate::error::RuntimeError;
use crate::OwnerId;

/// Callback invoked on the reactor thread when a timer comes due.
/// `Dispatch::Continue` reschedules a recurring timer; `Done` or an error
/// removes it.
pub type TimerCallback = dyn FnMut() -> Result<Dispatch, CallbackError> + Send;

pub(crate) type SharedTimerCallback = Arc<Mutex<Box<TimerCallback>>>;

/// Generation-checked identity of a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

/// A timer extracted as due, ready for dispatch outside the registry lock.
pub(crate) struct DueTimer {
    pub id: TimerId,
    pub owner: OwnerId,
    pub seq: u64,
    pub one_shot: bool,
    pub callback: SharedTimerCallback,
}

struct TimerEntry {
    owner: OwnerId,
    /// Recurrence interval; zero marks a one-shot timer.
    interval: Duration,
    next_due: Instant,
    /// Registration sequence number, breaks same-instant ties.
    seq: u64,
    callback: SharedTimerCallback,
}

struct Slot {
    generation: u32,
    entry: Option<TimerEntry>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_seq: u64,
}

/// Thread-safe collection of scheduled callbacks.
///
/// External threads insert, remove and reset entries; only the reactor
/// advances due times, and only while holding the registry lock.
pub struct TimerRegistry {
    inner: Mutex<Slots>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        TimerRegistry {
            inner: Mutex::new(Slots::default()),
        }
    }

    /// Register a timer first due `interval` from now.
    ///
    /// A zero interval is a one-shot that comes due immediately and is
    /// removed when it fires, regardless of the callback's verdict.
    pub fn add<F>(&self, owner: OwnerId, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() -> Result<Dispatch, CallbackError> + Send + 'static,
    {
        let mut inner = hold(&self.inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = TimerEntry {
            owner,
            interval,
            next_due: Instant::now() + interval,
            seq,
            callback: Arc::new(Mutex::new(Box::new(callback))),
        };

        match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.entry = Some(entry);
                TimerId {
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
                TimerId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Remove a timer. Returns false for stale ids; a stale id never
    /// resurrects a recycled slot.
    pub fn remove(&self, id: TimerId) -> bool {
        let mut inner = hold(&self.inner);
        Self::free_slot(&mut inner, id)
    }

    /// Remove every timer registered by `owner`.
    pub fn remove_owner(&self, owner: OwnerId) -> usize {
        let mut inner = hold(&self.inner);
        let mut removed = 0;
        let mut freed = Vec::new();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if slot.entry.as_ref().is_some_and(|e| e.owner == owner) {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index as u32);
                removed += 1;
            }
        }
        inner.free.extend(freed);
        if removed > 0 {
            log::debug!("removed {removed} timers of owner {owner:?}");
        }
        removed
    }

    /// Change a timer's interval and restart its countdown from now.
    pub fn reset(&self, id: TimerId, interval: Duration) -> Result<(), RuntimeError> {
        let mut inner = hold(&self.inner);
        let slot = inner
            .slots
            .get_mut(id.index as usize)
            .ok_or(RuntimeError::StaleTimer)?;
        if slot.generation != id.generation {
            return Err(RuntimeError::StaleTimer);
        }
        let entry = slot.entry.as_mut().ok_or(RuntimeError::StaleTimer)?;
        entry.interval = interval;
        entry.next_due = Instant::now() + interval;
        Ok(())
    }

    /// Check that `id` still names a registered timer.
    pub(crate) fn contains(&self, id: TimerId) -> bool {
        let inner = hold(&self.inner);
        inner
            .slots
            .get(id.index as usize)
            .is_some_and(|s| s.generation == id.generation && s.entry.is_some())
    }

    /// Collect due timers and compute the reactor's wait budget.
    ///
    /// Due recurring timers are advanced to `now + interval` under the lock;
    /// due one-shots are unregistered on the spot. The budget is the time to
    /// the earliest remaining deadline, clipped to `[0, max_wait]`, and zero
    /// whenever anything is already due. Same-instant timers come back in
    /// registration order.
    pub(crate) fn compute_next_wait(
        &self,
        now: Instant,
        max_wait: Duration,
    ) -> (Duration, Vec<DueTimer>) {
        let mut inner = hold(&self.inner);
        let mut due = Vec::new();
        let mut earliest: Option<Duration> = None;
        let mut freed = Vec::new();

        for (index, slot) in inner.slots.iter_mut().enumerate() {
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };
            if entry.next_due <= now {
                let one_shot = entry.interval.is_zero();
                due.push(DueTimer {
                    id: TimerId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    owner: entry.owner,
                    seq: entry.seq,
                    one_shot,
                    callback: Arc::clone(&entry.callback),
                });
                if one_shot {
                    slot.entry = None;
                    slot.generation = slot.generation.wrapping_add(1);
                    freed.push(index as u32);
                } else {
                    entry.next_due = now + entry.interval;
                }
            } else {
                let remaining = entry.next_due - now;
                earliest = Some(match earliest {
                    Some(e) => e.min(remaining),
                    None => remaining,
                });
            }
        }
        inner.free.extend(freed);

        due.sort_by_key(|t| t.seq);

        let wait = if due.is_empty() {
            earliest.unwrap_or(max_wait).min(max_wait)
        } else {
            Duration::ZERO
        };
        (wait, due)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let inner = hold(&self.inner);
        inner.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    fn free_slot(inner: &mut Slots, id: TimerId) -> bool {
        let Some(slot) = inner.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.entry.is_none() {
            return false;
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index);
        true
    }
}
