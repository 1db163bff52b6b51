//! The credit ledger engine.
//!
//! Layered strictly upward: the store and state machines sit at the
//! bottom, the allocator and reservation engine consume them, the outbox
//! and governance wrap the write paths, and reconciliation reads
//! everything. Mutation paths serialize on one exclusive store
//! transaction; the transaction boundary is the durability boundary.

pub mod allocator;
pub mod bridging;
pub mod budget;
pub mod clock;
pub mod counter;
pub mod distribution;
pub mod error;
pub mod events;
pub mod governance;
pub mod ledger;
pub mod logging;
pub mod ports;
pub mod reconciliation;
pub mod reservation;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod sweepers;

pub use error::{LedgerError, Result};
