//! Mode-gated priority queue feeding a controller's execution loop.
//!
//! Each device controller owns one [`StateQueue`]. Producers (the shot
//! pipeline, front-panel plumbing, the controller's own lifecycle methods)
//! insert operations with an explicit [`StatePolicy`]; the controller's loop
//! is the single consumer and retrieves them with [`QueueConsumer::get`],
//! which releases an entry only while the controller's current mode is inside
//! the entry's allowed set.
//!
//! Ordering is total within one queue: entries sort by `(priority, seq)`
//! ascending, so a lower priority value runs first and ties run in insertion
//! order. Two policies refine the scan:
//!
//! - an entry whose allowed modes do not match the current mode is discarded
//!   on first sight unless it asked to queue indefinitely (it has missed its
//!   window and can never become valid again);
//! - an entry flagged `delete_stale` coalesces a burst of identical requests:
//!   when it is chosen, the contiguous run of entries with the same operation
//!   immediately after it is deleted without executing. The oldest queued
//!   call wins; this is deliberate, not a latest-click-wins scheme.

use crate::error::{AppResult, EngineError};
use crate::mode::{Mode, ModeSet};
use std::mem::{discriminant, Discriminant};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Execution policy attached to a queued operation.
#[derive(Clone, Copy, Debug)]
pub struct StatePolicy {
    /// Sort band; lower values execute first.
    pub priority: i8,
    /// Modes in which the operation may execute.
    pub allowed_modes: ModeSet,
    /// Keep the entry queued across mode mismatches instead of discarding it
    /// the first time it is scanned while invalid.
    pub queue_indefinitely: bool,
    /// Coalesce bursts of the same operation (see module docs).
    pub delete_stale: bool,
}

/// An operation waiting in a [`StateQueue`].
#[derive(Debug)]
pub struct QueuedOperation<T> {
    /// Sort band of the entry.
    pub priority: i8,
    /// Monotonic insertion sequence, the ordering tie-breaker.
    pub seq: u64,
    /// Modes in which the entry may execute.
    pub allowed_modes: ModeSet,
    /// Whether the entry survives mode mismatches.
    pub queue_indefinitely: bool,
    /// Whether the entry coalesces duplicates behind it.
    pub delete_stale: bool,
    /// The operation payload.
    pub op: T,
}

struct Inner<T> {
    entries: Vec<QueuedOperation<T>>,
    next_seq: u64,
    consumer_taken: bool,
    /// Mode the (single) consumer is currently blocked on, if any.
    waiting_mode: Option<Mode>,
}

/// Priority queue of pending operations for one controller.
pub struct StateQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> StateQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                next_seq: 0,
                consumer_taken: false,
                waiting_mode: None,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an operation, maintaining `(priority, seq)` order, and wakes
    /// the consumer if it is blocked on a mode the new entry allows.
    pub fn put(&self, policy: StatePolicy, op: T) {
        let wake = {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;

            let entry = QueuedOperation {
                priority: policy.priority,
                seq,
                allowed_modes: policy.allowed_modes,
                queue_indefinitely: policy.queue_indefinitely,
                delete_stale: policy.delete_stale,
                op,
            };
            let idx = inner
                .entries
                .partition_point(|e| (e.priority, e.seq) <= (entry.priority, entry.seq));
            inner.entries.insert(idx, entry);

            match inner.waiting_mode {
                Some(mode) => policy.allowed_modes.contains(mode),
                None => false,
            }
        };
        if wake {
            self.notify.notify_one();
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the consumer side of the queue.
    ///
    /// Only one consumer may exist at a time; a second claim while the first
    /// is alive is a programming error and fails fast.
    pub fn take_consumer(self: &Arc<Self>) -> AppResult<QueueConsumer<T>> {
        let mut inner = self.lock();
        if inner.consumer_taken {
            return Err(EngineError::QueueConsumed);
        }
        inner.consumer_taken = true;
        drop(inner);
        Ok(QueueConsumer {
            queue: Arc::clone(self),
        })
    }
}

/// The single consumer handle of a [`StateQueue`].
pub struct QueueConsumer<T> {
    queue: Arc<StateQueue<T>>,
}

impl<T> QueueConsumer<T> {
    /// Retrieves the next operation executable in `mode`, waiting for a
    /// matching `put` if none is pending.
    ///
    /// Entries scanned while their allowed modes mismatch are dropped unless
    /// they queued indefinitely. When the chosen entry is flagged
    /// `delete_stale`, the contiguous run of same-operation entries after it
    /// is deleted without executing.
    pub async fn get(&mut self, mode: Mode) -> QueuedOperation<T> {
        loop {
            {
                let mut inner = self.queue.lock();
                let mut i = 0;
                while i < inner.entries.len() {
                    if inner.entries[i].allowed_modes.contains(mode) {
                        let chosen = inner.entries.remove(i);
                        if chosen.delete_stale {
                            let kind = discriminant(&chosen.op);
                            Self::drop_stale_after(&mut inner.entries, i, kind);
                        }
                        inner.waiting_mode = None;
                        return chosen;
                    }
                    if inner.entries[i].queue_indefinitely {
                        i += 1;
                    } else {
                        // Missed its window; it can never become valid again.
                        inner.entries.remove(i);
                    }
                }
                inner.waiting_mode = Some(mode);
            }
            self.queue.notify.notified().await;
        }
    }

    fn drop_stale_after(entries: &mut Vec<QueuedOperation<T>>, idx: usize, kind: Discriminant<T>) {
        while idx < entries.len() && discriminant(&entries[idx].op) == kind {
            entries.remove(idx);
        }
    }
}

impl<T> Drop for QueueConsumer<T> {
    fn drop(&mut self) {
        self.queue.lock().consumer_taken = false;
    }
}
