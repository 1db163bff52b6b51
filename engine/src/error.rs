//! The closed error taxonomy of the ledger.
//!
//! Every failure a caller can observe is one of these variants; each
//! carries the name of the operation that raised it. Transactional
//! failures roll back all in-flight state including outbox rows before
//! surfacing here.

use credit_primitives::{money::MoneyError, parse::ParseError, MicroUsd};

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
	#[error("{op}: {what} not found")]
	NotFound { op: &'static str, what: String },

	/// An idempotency key was replayed with a differing payload, or a
	/// uniqueness constraint met a distinct duplicate.
	#[error("{op}: conflict: {detail}")]
	Conflict { op: &'static str, detail: String },

	#[error("{op}: invalid state: {detail}")]
	InvalidState { op: &'static str, detail: String },

	#[error("{op}: insufficient balance: requested {requested}, available {available}")]
	InsufficientBalance { op: &'static str, requested: MicroUsd, available: MicroUsd },

	#[error("{op}: arithmetic: {source}")]
	Arithmetic {
		op: &'static str,
		#[source]
		source: MoneyError,
	},

	#[error("{op}: daily budget exceeded: attempted {attempted}, cap {cap}")]
	BudgetOverspend { op: &'static str, attempted: MicroUsd, cap: MicroUsd },

	#[error("{op}: transition out of terminal state {state:?}")]
	TerminalStateViolation { op: &'static str, state: String },

	#[error("{op}: transfer imbalance: debited {debited}, credited {credited}")]
	TransferImbalance { op: &'static str, debited: MicroUsd, credited: MicroUsd },

	#[error("{op}: deposit bridge mismatch: {detail}")]
	DepositBridgeMismatch { op: &'static str, detail: String },

	#[error("{op}: shadow divergence: {detail}")]
	ShadowDivergence { op: &'static str, detail: String },

	#[error("{op}: amount parse: {source}")]
	Parse {
		op: &'static str,
		#[source]
		source: ParseError,
	},

	#[error("{op}: store: {source}")]
	Store {
		op: &'static str,
		#[source]
		source: rusqlite::Error,
	},
}

impl LedgerError {
	pub fn not_found(op: &'static str, what: impl Into<String>) -> Self {
		LedgerError::NotFound { op, what: what.into() }
	}

	pub fn conflict(op: &'static str, detail: impl Into<String>) -> Self {
		LedgerError::Conflict { op, detail: detail.into() }
	}

	pub fn invalid_state(op: &'static str, detail: impl Into<String>) -> Self {
		LedgerError::InvalidState { op, detail: detail.into() }
	}

	pub fn arithmetic(op: &'static str, source: MoneyError) -> Self {
		LedgerError::Arithmetic { op, source }
	}

	/// The operation whose failure this error reports.
	pub fn operation(&self) -> &'static str {
		match self {
			LedgerError::NotFound { op, .. } |
			LedgerError::Conflict { op, .. } |
			LedgerError::InvalidState { op, .. } |
			LedgerError::InsufficientBalance { op, .. } |
			LedgerError::Arithmetic { op, .. } |
			LedgerError::BudgetOverspend { op, .. } |
			LedgerError::TerminalStateViolation { op, .. } |
			LedgerError::TransferImbalance { op, .. } |
			LedgerError::DepositBridgeMismatch { op, .. } |
			LedgerError::ShadowDivergence { op, .. } |
			LedgerError::Parse { op, .. } |
			LedgerError::Store { op, .. } => *op,
		}
	}
}

/// Attaches the operation name when propagating store-level failures.
pub trait StoreResultExt<T> {
	fn store_err(self, op: &'static str) -> Result<T>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, rusqlite::Error> {
	fn store_err(self, op: &'static str) -> Result<T> {
		self.map_err(|source| LedgerError::Store { op, source })
	}
}
