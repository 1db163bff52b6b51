//! Closed enumerations shared across the ledger.
//!
//! Every discriminant that lands in a TEXT column round-trips through its
//! snake_case string form; `strum` provides both directions so the store
//! never hand-rolls a match.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString};

/// Kinds of entity an account can belong to.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
	Agent,
	Person,
	Community,
	Mod,
	Protocol,
	Foundation,
	Commons,
}

/// Provenance of a credit lot. `(source_type, source_id)` is unique, which
/// is what makes external double-credits impossible.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LotSourceType {
	Deposit,
	Grant,
	Purchase,
	TransferIn,
	CommonsDividend,
}

/// The complete vocabulary of ledger entry types.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
	Deposit,
	Reserve,
	Finalize,
	Release,
	Refund,
	Grant,
	ShadowCharge,
	ShadowReserve,
	ShadowFinalize,
	CommonsContribution,
	RevenueShare,
	MarketplaceSale,
	MarketplacePurchase,
	Escrow,
	EscrowRelease,
}

/// Reservation lifecycle. `Pending` is initial; the other three states are
/// terminal and absorbing.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
	Pending,
	Finalized,
	Released,
	Expired,
}

impl ReservationStatus {
	pub fn is_terminal(self) -> bool {
		!matches!(self, ReservationStatus::Pending)
	}
}

/// Billing enforcement posture for a reservation.
///
/// `Shadow` observes only: no lot is ever debited on behalf of a shadow
/// reservation, and finalization records an auditable `shadow_finalize`
/// entry instead of moving balances. `Soft` permits overruns past the
/// reserved amount; `Live` caps the billed amount at the reservation.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
	Shadow,
	Soft,
	#[default]
	Live,
}

/// Governance parameter lifecycle.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParamStatus {
	Draft,
	PendingApproval,
	CoolingDown,
	Active,
	Superseded,
	Rejected,
}

impl ParamStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, ParamStatus::Superseded | ParamStatus::Rejected)
	}
}

/// On-chain deposit lifecycle. `Bridged` is terminal success, `Failed`
/// terminal failure.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
	Detected,
	Confirmed,
	Bridged,
	Failed,
}

impl DepositStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, DepositStatus::Bridged | DepositStatus::Failed)
	}
}

/// Agent budget circuit breaker state.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
	Closed,
	Warning,
	Open,
}

/// Payout request lifecycle at the payout provider port.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
	Requested,
	Approved,
	Processing,
	Completed,
	Failed,
}

/// Credit isolation namespace.
///
/// `general` is the unrestricted default; `campaign:<id>` restricts credits
/// to one grant; `agent:<id>` isolates an on-chain wallet. A lot stored
/// with a NULL pool behaves as `general`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Pool(String);

impl Pool {
	pub fn general() -> Self {
		Pool("general".to_string())
	}

	pub fn campaign(id: &str) -> Self {
		Pool(format!("campaign:{id}"))
	}

	pub fn agent(id: &str) -> Self {
		Pool(format!("agent:{id}"))
	}

	pub fn named(name: impl Into<String>) -> Self {
		Pool(name.into())
	}

	pub fn is_general(&self) -> bool {
		self.0 == "general"
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Default for Pool {
	fn default() -> Self {
		Pool::general()
	}
}

impl fmt::Display for Pool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
