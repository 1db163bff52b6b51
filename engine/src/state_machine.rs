//! Declarative transition tables.
//!
//! Every lifecycle in the ledger (reservations, governance parameters,
//! on-chain deposits, payouts, the budget circuit breaker) is a closed
//! set of states with an explicit edge list. Transitions are checked
//! against the table, never against ad-hoc conditionals, so a forbidden
//! edge is exactly one kind of error: entering from a terminal state is
//! `TerminalStateViolation`, any other missing edge is `InvalidState`.

use crate::error::{LedgerError, Result};
use credit_primitives::{CircuitState, DepositStatus, ParamStatus, PayoutStatus, ReservationStatus};
use std::fmt::Display;

pub struct TransitionTable<S: 'static> {
	pub name: &'static str,
	edges: &'static [(S, S)],
	terminal: &'static [S],
}

impl<S: Copy + PartialEq + Display> TransitionTable<S> {
	pub const fn new(name: &'static str, edges: &'static [(S, S)], terminal: &'static [S]) -> Self {
		Self { name, edges, terminal }
	}

	pub fn is_terminal(&self, state: S) -> bool {
		self.terminal.contains(&state)
	}

	pub fn can(&self, from: S, to: S) -> bool {
		self.edges.contains(&(from, to))
	}

	pub fn ensure(&self, op: &'static str, from: S, to: S) -> Result<()> {
		if self.can(from, to) {
			return Ok(());
		}
		if self.is_terminal(from) {
			Err(LedgerError::TerminalStateViolation { op, state: from.to_string() })
		} else {
			Err(LedgerError::invalid_state(
				op,
				format!("{} may not move {from} -> {to}", self.name),
			))
		}
	}
}

pub static RESERVATION: TransitionTable<ReservationStatus> = TransitionTable::new(
	"reservation",
	&[
		(ReservationStatus::Pending, ReservationStatus::Finalized),
		(ReservationStatus::Pending, ReservationStatus::Released),
		(ReservationStatus::Pending, ReservationStatus::Expired),
	],
	&[ReservationStatus::Finalized, ReservationStatus::Released, ReservationStatus::Expired],
);

pub static GOVERNANCE: TransitionTable<ParamStatus> = TransitionTable::new(
	"config parameter",
	&[
		(ParamStatus::Draft, ParamStatus::PendingApproval),
		(ParamStatus::PendingApproval, ParamStatus::CoolingDown),
		(ParamStatus::PendingApproval, ParamStatus::Rejected),
		(ParamStatus::CoolingDown, ParamStatus::Active),
		(ParamStatus::Active, ParamStatus::Superseded),
	],
	&[ParamStatus::Superseded, ParamStatus::Rejected],
);

pub static DEPOSIT: TransitionTable<DepositStatus> = TransitionTable::new(
	"tba deposit",
	&[
		(DepositStatus::Detected, DepositStatus::Confirmed),
		(DepositStatus::Detected, DepositStatus::Failed),
		(DepositStatus::Confirmed, DepositStatus::Bridged),
		(DepositStatus::Confirmed, DepositStatus::Failed),
	],
	&[DepositStatus::Bridged, DepositStatus::Failed],
);

pub static PAYOUT: TransitionTable<PayoutStatus> = TransitionTable::new(
	"payout",
	&[
		(PayoutStatus::Requested, PayoutStatus::Approved),
		(PayoutStatus::Approved, PayoutStatus::Processing),
		(PayoutStatus::Processing, PayoutStatus::Completed),
		(PayoutStatus::Processing, PayoutStatus::Failed),
		(PayoutStatus::Approved, PayoutStatus::Failed),
	],
	&[PayoutStatus::Completed, PayoutStatus::Failed],
);

// The circuit breaker is cyclic: a window roll closes it again.
pub static CIRCUIT: TransitionTable<CircuitState> = TransitionTable::new(
	"budget circuit",
	&[
		(CircuitState::Closed, CircuitState::Warning),
		(CircuitState::Closed, CircuitState::Open),
		(CircuitState::Warning, CircuitState::Open),
		(CircuitState::Warning, CircuitState::Closed),
		(CircuitState::Open, CircuitState::Closed),
	],
	&[],
);
