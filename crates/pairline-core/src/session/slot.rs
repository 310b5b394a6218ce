//! One entry of the session table and its pairing state machine.
//!
//! ```text
//! EMPTY ──acquire──▶ RECEIVER_WAITING ──pair──▶ PAIRED ──start──▶ RELAYING
//!   ▲                      │                                        │
//!   └────── release ◀──────┴──────── (disconnect / timeout) ◀───────┘
//! ```
//!
//! Every transition happens under the slot's own mutex and never performs I/O
//! while holding it. Connection handles are moved in and cloned out; the
//! caller does the reading and writing after the guard is gone.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use crate::error::RejectReason;
use crate::{PairlineError, Result};

/// Write side of a registered receiver connection.
pub type ReceiverWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to a receiver's write side.
///
/// The receiver's worker writes the session id line through it, then the
/// relay engine writes the payload through it. The tokio mutex orders the two.
pub type ReceiverConn = Arc<tokio::sync::Mutex<ReceiverWriter>>;

/// Observable phase of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotPhase {
    Empty,
    ReceiverWaiting,
    Paired,
    Relaying,
}

impl fmt::Display for SlotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotPhase::Empty => "EMPTY",
            SlotPhase::ReceiverWaiting => "RECEIVER_WAITING",
            SlotPhase::Paired => "PAIRED",
            SlotPhase::Relaying => "RELAYING",
        };
        f.write_str(name)
    }
}

enum SlotState {
    Empty,
    ReceiverWaiting {
        receiver: ReceiverConn,
        ready: oneshot::Sender<()>,
    },
    Paired {
        receiver: ReceiverConn,
        sender: SocketAddr,
    },
    Relaying {
        receiver: ReceiverConn,
        sender: SocketAddr,
    },
}

impl SlotState {
    fn phase(&self) -> SlotPhase {
        match self {
            SlotState::Empty => SlotPhase::Empty,
            SlotState::ReceiverWaiting { .. } => SlotPhase::ReceiverWaiting,
            SlotState::Paired { .. } => SlotPhase::Paired,
            SlotState::Relaying { .. } => SlotPhase::Relaying,
        }
    }

    fn sender(&self) -> Option<SocketAddr> {
        match self {
            SlotState::Paired { sender, .. } | SlotState::Relaying { sender, .. } => Some(*sender),
            _ => None,
        }
    }
}

struct SlotInner {
    /// Bumped on every registration so stale teardown never hits a newer session.
    generation: u64,
    state: SlotState,
}

/// A session slot.
pub struct Slot {
    index: usize,
    inner: Mutex<SlotInner>,
}

/// Receiver-side result of a successful registration.
///
/// Holds the one-shot readiness signal the receiver's worker parks on.
#[derive(Debug)]
pub struct Registration {
    pub session: usize,
    pub generation: u64,
    pub(crate) ready: oneshot::Receiver<()>,
}

/// Sender-side result of a successful pairing.
///
/// Borrows the receiver's connection for the duration of the relay.
pub struct Pairing {
    pub session: usize,
    pub generation: u64,
    pub sender: SocketAddr,
    pub(crate) receiver: ReceiverConn,
    pub(crate) slot: Arc<Slot>,
}

impl fmt::Debug for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pairing")
            .field("session", &self.session)
            .field("generation", &self.generation)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

impl Slot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            inner: Mutex::new(SlotInner {
                generation: 0,
                state: SlotState::Empty,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    // Critical sections only move handles around, so a poisoned lock still
    // guards a consistent state.
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> SlotPhase {
        self.lock().state.phase()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// True from the moment a receiver registers until the slot is released.
    pub fn receiver_ready(&self) -> bool {
        !matches!(self.lock().state, SlotState::Empty)
    }

    /// `EMPTY -> RECEIVER_WAITING`. Only the table calls this, with an index
    /// it just took off the free list.
    pub(crate) fn bind(&self, receiver: ReceiverConn) -> Registration {
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut inner = self.lock();
        debug_assert!(matches!(inner.state, SlotState::Empty));
        inner.generation += 1;
        inner.state = SlotState::ReceiverWaiting {
            receiver,
            ready: ready_tx,
        };
        Registration {
            session: self.index,
            generation: inner.generation,
            ready: ready_rx,
        }
    }

    /// `RECEIVER_WAITING -> PAIRED`, first writer wins.
    ///
    /// A slot in any other phase is left untouched and the sender is rejected.
    /// The readiness signal fires after the guard is dropped.
    pub(crate) fn pair(self: &Arc<Self>, sender: SocketAddr) -> Result<Pairing> {
        let (ready, pairing) = {
            let mut inner = self.lock();
            let generation = inner.generation;
            match std::mem::replace(&mut inner.state, SlotState::Empty) {
                SlotState::ReceiverWaiting { receiver, ready } => {
                    inner.state = SlotState::Paired {
                        receiver: receiver.clone(),
                        sender,
                    };
                    let pairing = Pairing {
                        session: self.index,
                        generation,
                        sender,
                        receiver,
                        slot: Arc::clone(self),
                    };
                    (ready, pairing)
                }
                other => {
                    inner.state = other;
                    return Err(PairlineError::PairingRejected {
                        session: self.index,
                        reason: RejectReason::NoReceiver,
                    });
                }
            }
        };

        if ready.send(()).is_err() {
            tracing::debug!(session = self.index, "Receiver worker no longer awaiting readiness");
        }
        Ok(pairing)
    }

    /// `PAIRED -> RELAYING`. Returns false if the session was reset meanwhile.
    pub(crate) fn start_relay(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        match std::mem::replace(&mut inner.state, SlotState::Empty) {
            SlotState::Paired { receiver, sender } => {
                inner.state = SlotState::Relaying { receiver, sender };
                true
            }
            other => {
                inner.state = other;
                false
            }
        }
    }

    /// Release a receiver that is still waiting, e.g. after it disconnected or
    /// timed out. Loses to a sender that already paired.
    pub(crate) fn clear_waiting(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation == generation
            && matches!(inner.state, SlotState::ReceiverWaiting { .. })
        {
            inner.state = SlotState::Empty;
            true
        } else {
            false
        }
    }

    /// Clear the slot if it still belongs to `generation`.
    ///
    /// Returns true if this call moved the slot to `EMPTY`.
    pub(crate) fn clear_generation(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || matches!(inner.state, SlotState::Empty) {
            return false;
        }
        inner.state = SlotState::Empty;
        true
    }

    /// Clear the slot unconditionally. Returns true if it was occupied.
    pub(crate) fn clear(&self) -> bool {
        let mut inner = self.lock();
        !matches!(
            std::mem::replace(&mut inner.state, SlotState::Empty),
            SlotState::Empty
        )
    }

    /// Peer address of the sender attached to this slot, if any.
    pub fn sender_peer(&self) -> Option<SocketAddr> {
        self.lock().state.sender()
    }

    /// Phase, generation and sender read under a single lock.
    pub(crate) fn describe(&self) -> (SlotPhase, u64, Option<SocketAddr>) {
        let inner = self.lock();
        (inner.state.phase(), inner.generation, inner.state.sender())
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("generation", &inner.generation)
            .field("phase", &inner.state.phase())
            .finish()
    }
}
