//! Shared primitives for the credit ledger.
//!
//! Everything in this crate is a leaf: branded monetary types, the
//! boundary parser, and the closed enumerations used by every layer of the
//! engine. No storage or runtime concerns belong here.

pub mod money;
pub mod parse;
pub mod types;

pub use money::{Bps, MicroUsd, MoneyError, BPS_SCALE};
pub use parse::{MicroParser, ParseError, ParseMode};
pub use types::{
	BillingMode, CircuitState, DepositStatus, EntityType, EntryType, LotSourceType, ParamStatus,
	PayoutStatus, Pool, ReservationStatus,
};
