//! Registry of session slots.
//!
//! Slots are created on demand up to `capacity` and never destroyed. Released
//! indices go on a free-list stack, so acquiring is O(1) and the most recently
//! freed index is handed out first. When the free-list is empty the next
//! never-used index is allocated.
//!
//! # Locking
//!
//! The registry mutex guards only the slot vector and the free-list. Each slot
//! has its own mutex. No code path holds both at once.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::slot::{Pairing, ReceiverConn, Registration, Slot, SlotPhase};
use crate::error::RejectReason;
use crate::{PairlineError, Result};

struct Registry {
    slots: Vec<Arc<Slot>>,
    free: Vec<usize>,
}

/// Fixed-ceiling, dynamically grown table of session slots.
pub struct SessionTable {
    capacity: usize,
    registry: Mutex<Registry>,
}

/// Point-in-time view of one allocated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub session: usize,
    pub phase: SlotPhase,
    pub generation: u64,
    pub sender: Option<SocketAddr>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            registry: Mutex::new(Registry {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a receiver in the first available slot.
    ///
    /// Fails with [`PairlineError::Capacity`] without touching any slot when
    /// every index up to the ceiling is occupied.
    pub fn acquire(&self, receiver: ReceiverConn) -> Result<Registration> {
        let slot = {
            let mut registry = self.registry();
            match registry.free.pop() {
                Some(index) => Arc::clone(&registry.slots[index]),
                None if registry.slots.len() < self.capacity => {
                    let slot = Arc::new(Slot::new(registry.slots.len()));
                    registry.slots.push(Arc::clone(&slot));
                    slot
                }
                None => {
                    return Err(PairlineError::Capacity {
                        capacity: self.capacity,
                    })
                }
            }
        };

        let registration = slot.bind(receiver);
        debug!(
            session = registration.session,
            generation = registration.generation,
            "Slot acquired"
        );
        Ok(registration)
    }

    /// Range-check a session id. Does not look at the slot's phase.
    ///
    /// Returns `Ok(None)` for an in-range id whose slot was never allocated,
    /// which behaves exactly like an `EMPTY` slot.
    pub fn lookup(&self, session: usize) -> Result<Option<Arc<Slot>>> {
        if session >= self.capacity {
            return Err(PairlineError::Protocol {
                message: format!(
                    "session id {} out of range (0..{})",
                    session, self.capacity
                ),
                reply: Some(RejectReason::InvalidSessionId),
            });
        }
        Ok(self.registry().slots.get(session).cloned())
    }

    /// Attach a sender to the receiver waiting in `session`.
    pub fn pair(&self, session: usize, sender: SocketAddr) -> Result<Pairing> {
        match self.lookup(session)? {
            Some(slot) => slot.pair(sender),
            None => Err(PairlineError::PairingRejected {
                session,
                reason: RejectReason::NoReceiver,
            }),
        }
    }

    /// Clear a slot back to `EMPTY` and make it available again. Idempotent.
    pub fn reset(&self, session: usize) {
        let Some(slot) = self.registry().slots.get(session).cloned() else {
            return;
        };
        if slot.clear() {
            self.push_free(session);
        }
    }

    /// Release a slot only if it still holds the given registration.
    pub(crate) fn release(&self, session: usize, generation: u64) -> bool {
        self.release_with(session, |slot| slot.clear_generation(generation))
    }

    /// Release a receiver that is still waiting. Loses to a concurrent pairing.
    pub(crate) fn release_waiting(&self, session: usize, generation: u64) -> bool {
        self.release_with(session, |slot| slot.clear_waiting(generation))
    }

    fn release_with(&self, session: usize, clear: impl FnOnce(&Slot) -> bool) -> bool {
        let Some(slot) = self.registry().slots.get(session).cloned() else {
            return false;
        };
        // The slot lock is dropped inside `clear` before the registry lock is retaken.
        let released = clear(&slot);
        if released {
            self.push_free(session);
            debug!(session, "Slot released");
        }
        released
    }

    fn push_free(&self, session: usize) {
        self.registry().free.push(session);
    }

    /// Phase of a session, `EMPTY` for never-allocated slots.
    pub fn phase(&self, session: usize) -> Result<SlotPhase> {
        Ok(self
            .lookup(session)?
            .map(|slot| slot.phase())
            .unwrap_or(SlotPhase::Empty))
    }

    /// Number of slots that are not `EMPTY`.
    pub fn active_sessions(&self) -> usize {
        let registry = self.registry();
        registry.slots.len() - registry.free.len()
    }

    /// Snapshot every allocated slot, in index order.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let slots: Vec<Arc<Slot>> = self.registry().slots.clone();
        slots
            .iter()
            .map(|slot| {
                let (phase, generation, sender) = slot.describe();
                SlotSnapshot {
                    session: slot.index(),
                    phase,
                    generation,
                    sender,
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("SessionTable")
            .field("capacity", &self.capacity)
            .field("allocated", &registry.slots.len())
            .field("free", &registry.free.len())
            .finish()
    }
}
