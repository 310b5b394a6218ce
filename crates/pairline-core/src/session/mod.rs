//! Session table and slot state machine.
//!
//! - **Table**: allocates slots, range-checks ids, owns the free-list
//! - **Slot**: per-session pairing state behind its own lock

pub mod slot;
pub mod table;

pub use slot::{Pairing, ReceiverConn, ReceiverWriter, Registration, Slot, SlotPhase};
pub use table::{SessionTable, SlotSnapshot};
