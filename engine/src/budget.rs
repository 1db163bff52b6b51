//! Agent spending budgets.
//!
//! Each agent account carries a daily cap over a rolling window. The
//! reserve path checks and accumulates spend; crossing the warning
//! threshold trips the circuit to `warning`, exceeding the cap trips it
//! to `open` and fails the reservation. Finalizations are recorded
//! idempotently per (account, reservation) so the windowed spend is
//! recomputable from those rows.

use crate::{
	error::{LedgerError, Result, StoreResultExt},
	events::{EconomicEvent, EventType},
	governance,
	state_machine::CIRCUIT,
	store::{micros_from_db, micros_to_db, ts_from_db, ts_to_db, Account, LedgerStore, LedgerTx},
};
use chrono::{DateTime, Duration, Utc};
use credit_primitives::{CircuitState, EntityType, MicroUsd};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetStatus {
	pub account_id: i64,
	pub daily_cap: MicroUsd,
	pub current_spend: MicroUsd,
	pub window_start: DateTime<Utc>,
	pub window_duration_seconds: i64,
	pub circuit_state: CircuitState,
}

fn budget_row(tx: &LedgerTx<'_>, account_id: i64) -> Result<Option<BudgetStatus>> {
	tx.conn()
		.query_row(
			"SELECT account_id, daily_cap, current_spend, window_start,
			        window_duration_seconds, circuit_state
			 FROM agent_budgets WHERE account_id = ?1",
			params![account_id],
			|row| {
				Ok(BudgetStatus {
					account_id: row.get(0)?,
					daily_cap: micros_from_db(1, row.get(1)?)?,
					current_spend: micros_from_db(2, row.get(2)?)?,
					window_start: ts_from_db(3, row.get(3)?)?,
					window_duration_seconds: row.get(4)?,
					circuit_state: crate::store::parse_discriminant(5, row.get(5)?)?,
				})
			},
		)
		.optional()
		.store_err(tx.op)
}

/// Create the budget row if absent, with the governed default cap.
fn ensure_budget(tx: &LedgerTx<'_>, account_id: i64) -> Result<BudgetStatus> {
	if let Some(status) = budget_row(tx, account_id)? {
		return Ok(status);
	}
	let cap = governance::get_micro(tx, "budget.default_daily_cap_micro", Some(EntityType::Agent))?;
	tx.conn()
		.execute(
			"INSERT INTO agent_budgets
				(account_id, daily_cap, current_spend, window_start,
				 window_duration_seconds, circuit_state, updated_at)
			 VALUES (?1, ?2, 0, ?3, 86400, 'closed', ?3)",
			params![account_id, micros_to_db(cap), ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;
	budget_row(tx, account_id)?
		.ok_or_else(|| LedgerError::not_found(tx.op, format!("budget for account #{account_id}")))
}

fn set_circuit(tx: &LedgerTx<'_>, status: &BudgetStatus, to: CircuitState) -> Result<()> {
	if status.circuit_state == to {
		return Ok(());
	}
	CIRCUIT.ensure(tx.op, status.circuit_state, to)?;
	tx.conn()
		.execute(
			"UPDATE agent_budgets SET circuit_state = ?2, updated_at = ?3 WHERE account_id = ?1",
			params![status.account_id, to.to_string(), ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;
	Ok(())
}

/// Roll the window when it has lapsed: spend resets to zero, the window
/// restarts at now, and an open circuit closes again.
fn roll_window_if_due(tx: &LedgerTx<'_>, status: BudgetStatus) -> Result<BudgetStatus> {
	let window_end = status.window_start + Duration::seconds(status.window_duration_seconds);
	if window_end >= tx.now {
		return Ok(status);
	}
	tx.conn()
		.execute(
			"UPDATE agent_budgets
			 SET current_spend = 0, window_start = ?2, circuit_state = 'closed', updated_at = ?2
			 WHERE account_id = ?1",
			params![status.account_id, ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;
	budget_row(tx, status.account_id)?.ok_or_else(|| {
		LedgerError::not_found(tx.op, format!("budget for account #{}", status.account_id))
	})
}

/// Outcome of the budget gate. A denial still commits its bookkeeping
/// (tripped circuit, exhaustion event): the gate runs in its own
/// transaction precisely so a failed reservation cannot roll the breaker
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
	Allowed,
	Denied { attempted: MicroUsd, cap: MicroUsd },
}

/// Budget gate on the reserve path. Accumulates `amount` into the
/// window and trips the breaker on threshold and cap crossings. The
/// caller converts a [`BudgetDecision::Denied`] into `BudgetOverspend`
/// after this transaction commits.
pub fn check_and_reserve(
	tx: &LedgerTx<'_>,
	account: &Account,
	amount: MicroUsd,
) -> Result<BudgetDecision> {
	let status = roll_window_if_due(tx, ensure_budget(tx, account.id)?)?;

	let attempted = status
		.current_spend
		.add(amount)
		.map_err(|e| LedgerError::arithmetic(tx.op, e))?;

	if attempted > status.daily_cap {
		if status.circuit_state != CircuitState::Open {
			set_circuit(tx, &status, CircuitState::Open)?;
		}
		tx.emit(&EconomicEvent::new(
			EventType::AgentBudgetExhausted,
			account.entity_type,
			account.entity_id.as_str(),
			json!({
				"attempted": attempted,
				"daily_cap": status.daily_cap,
				"window_start": ts_to_db(status.window_start),
			}),
		))?;
		warn!(account = %account.entity_id, %attempted, cap = %status.daily_cap, "budget exhausted");
		return Ok(BudgetDecision::Denied { attempted, cap: status.daily_cap });
	}

	tx.conn()
		.execute(
			"UPDATE agent_budgets SET current_spend = current_spend + ?2, updated_at = ?3
			 WHERE account_id = ?1",
			params![account.id, micros_to_db(amount), ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;

	let threshold_bps = governance::get_i64(tx, "budget.warning_threshold_bps", None)?;
	let warning_floor = (status.daily_cap.micros() as u128 * threshold_bps as u128 / 10_000) as u64;
	if attempted.micros() >= warning_floor && status.circuit_state == CircuitState::Closed {
		set_circuit(tx, &status, CircuitState::Warning)?;
		tx.emit(&EconomicEvent::new(
			EventType::AgentBudgetWarning,
			account.entity_type,
			account.entity_id.as_str(),
			json!({
				"current_spend": attempted,
				"daily_cap": status.daily_cap,
			}),
		))?;
	}
	Ok(BudgetDecision::Allowed)
}

/// Record one finalization, idempotently keyed by (account, reservation).
/// On first record the window spend is corrected from the reserved amount
/// to the consumed amount, so quiescent spend equals the windowed sum of
/// finalization rows.
pub fn record_finalization(
	tx: &LedgerTx<'_>,
	account_id: i64,
	reservation_id: &str,
	consumed: MicroUsd,
	reserved: MicroUsd,
) -> Result<()> {
	let inserted = tx
		.conn()
		.execute(
			"INSERT OR IGNORE INTO budget_finalizations
				(account_id, reservation_id, amount, finalized_at)
			 VALUES (?1, ?2, ?3, ?4)",
			params![account_id, reservation_id, micros_to_db(consumed), ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;
	if inserted == 0 {
		return Ok(());
	}
	let correction = micros_to_db(consumed) - micros_to_db(reserved);
	tx.conn()
		.execute(
			"UPDATE agent_budgets
			 SET current_spend = MAX(0, current_spend + ?2), updated_at = ?3
			 WHERE account_id = ?1",
			params![account_id, correction, ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;
	Ok(())
}

/// Hand reserved spend back when a reservation releases or expires.
pub fn record_release(tx: &LedgerTx<'_>, account_id: i64, reserved: MicroUsd) -> Result<()> {
	tx.conn()
		.execute(
			"UPDATE agent_budgets
			 SET current_spend = MAX(0, current_spend - ?2), updated_at = ?3
			 WHERE account_id = ?1",
			params![account_id, micros_to_db(reserved), ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;
	Ok(())
}

/// The windowed sum of recorded finalizations; the budget-consistency
/// invariant compares quiescent `current_spend` against this.
pub fn finalized_spend_in_window(tx: &LedgerTx<'_>, status: &BudgetStatus) -> Result<MicroUsd> {
	let total: i64 = tx
		.conn()
		.query_row(
			"SELECT COALESCE(SUM(amount), 0) FROM budget_finalizations
			 WHERE account_id = ?1 AND finalized_at >= ?2",
			params![status.account_id, ts_to_db(status.window_start)],
			|row| row.get(0),
		)
		.store_err(tx.op)?;
	micros_from_db(0, total).store_err(tx.op)
}

/// Public budget API.
pub struct BudgetEngine {
	store: Arc<LedgerStore>,
}

impl BudgetEngine {
	pub fn new(store: Arc<LedgerStore>) -> Self {
		Self { store }
	}

	/// Set (or replace) an agent's daily cap, keeping the current window.
	pub fn configure_cap(&self, account_id: i64, daily_cap: MicroUsd) -> Result<()> {
		self.store.with_tx("budget_configure", |tx| {
			ensure_budget(tx, account_id)?;
			tx.conn()
				.execute(
					"UPDATE agent_budgets SET daily_cap = ?2, updated_at = ?3
					 WHERE account_id = ?1",
					params![account_id, micros_to_db(daily_cap), ts_to_db(tx.now)],
				)
				.store_err(tx.op)?;
			Ok(())
		})
	}

	pub fn status(&self, account_id: i64) -> Result<Option<BudgetStatus>> {
		self.store.read("budget_status", |tx| budget_row(tx, account_id))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::TestClock;
	use chrono::TimeZone;

	fn usd(micros: u64) -> MicroUsd {
		MicroUsd::new(micros).unwrap()
	}

	fn harness() -> (Arc<LedgerStore>, TestClock) {
		let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
		(Arc::new(LedgerStore::open_in_memory(Arc::new(clock.clone())).unwrap()), clock)
	}

	fn agent(tx: &LedgerTx<'_>) -> Account {
		tx.create_account(EntityType::Agent, "a1").unwrap()
	}

	#[test]
	fn overspend_denies_and_the_tripped_circuit_survives_commit() {
		let (store, _) = harness();
		let engine = BudgetEngine::new(store.clone());

		let account =
			store.with_tx("test", |tx| Ok(agent(tx))).unwrap();
		engine.configure_cap(account.id, usd(1_000)).unwrap();

		let decision = store
			.with_tx("test", |tx| check_and_reserve(tx, &account, usd(1_500)))
			.unwrap();
		assert_eq!(
			decision,
			BudgetDecision::Denied { attempted: usd(1_500), cap: usd(1_000) }
		);

		let status = engine.status(account.id).unwrap().unwrap();
		assert_eq!(status.circuit_state, CircuitState::Open);
		// The denied amount was never added to the window.
		assert_eq!(status.current_spend, MicroUsd::ZERO);

		store
			.read("test", |tx| {
				assert_eq!(tx.count_events(EventType::AgentBudgetExhausted)?, 1);
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn warning_fires_at_eighty_percent() {
		let (store, _) = harness();
		let engine = BudgetEngine::new(store.clone());
		let account = store.with_tx("test", |tx| Ok(agent(tx))).unwrap();
		engine.configure_cap(account.id, usd(1_000)).unwrap();

		store.with_tx("test", |tx| check_and_reserve(tx, &account, usd(500))).unwrap();
		assert_eq!(engine.status(account.id).unwrap().unwrap().circuit_state, CircuitState::Closed);

		store.with_tx("test", |tx| check_and_reserve(tx, &account, usd(300))).unwrap();
		let status = engine.status(account.id).unwrap().unwrap();
		assert_eq!(status.circuit_state, CircuitState::Warning);
		assert_eq!(status.current_spend, usd(800));
	}

	#[test]
	fn window_roll_resets_spend_and_closes_the_circuit() {
		let (store, clock) = harness();
		let engine = BudgetEngine::new(store.clone());
		let account = store.with_tx("test", |tx| Ok(agent(tx))).unwrap();
		engine.configure_cap(account.id, usd(1_000)).unwrap();

		let decision = store
			.with_tx("test", |tx| check_and_reserve(tx, &account, usd(1_500)))
			.unwrap();
		assert!(matches!(decision, BudgetDecision::Denied { .. }));
		assert_eq!(engine.status(account.id).unwrap().unwrap().circuit_state, CircuitState::Open);

		clock.advance(Duration::seconds(86_401));
		let decision =
			store.with_tx("test", |tx| check_and_reserve(tx, &account, usd(400))).unwrap();
		assert_eq!(decision, BudgetDecision::Allowed);
		let status = engine.status(account.id).unwrap().unwrap();
		assert_eq!(status.circuit_state, CircuitState::Closed);
		assert_eq!(status.current_spend, usd(400));
	}

	#[test]
	fn finalization_records_are_idempotent_and_correct_the_spend() {
		let (store, _) = harness();
		let engine = BudgetEngine::new(store.clone());
		let account = store.with_tx("test", |tx| Ok(agent(tx))).unwrap();
		engine.configure_cap(account.id, usd(10_000)).unwrap();

		store.with_tx("test", |tx| check_and_reserve(tx, &account, usd(600))).unwrap();
		store
			.with_tx("test", |tx| {
				record_finalization(tx, account.id, "r1", usd(400), usd(600))?;
				// Replay must not double-apply the correction.
				record_finalization(tx, account.id, "r1", usd(400), usd(600))
			})
			.unwrap();

		let status = engine.status(account.id).unwrap().unwrap();
		assert_eq!(status.current_spend, usd(400));

		let windowed = store
			.read("test", |tx| {
				let status = budget_row(tx, account.id)?.unwrap();
				finalized_spend_in_window(tx, &status)
			})
			.unwrap();
		assert_eq!(windowed, status.current_spend);
	}
}
