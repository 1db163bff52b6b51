//! FIFO lot allocation.
//!
//! Lot selection order is a total order computed by the store query
//! (`eligible_lots`): pool-bound lots before pool-general ones, expiring
//! lots before non-expiring with the earliest expiry first, then
//! creation time, then lot id. This module turns that ordered candidate
//! list into a debit plan and applies it, either into `reserved` (for a
//! reservation) or straight into `consumed` (for an immediate charge).

use crate::{
	error::{LedgerError, Result},
	store::{micros_to_db, LedgerTx, Lot},
};
use credit_primitives::{MicroUsd, Pool};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotDebit {
	pub lot_id: String,
	pub amount: MicroUsd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
	pub debits: Vec<LotDebit>,
	pub total: MicroUsd,
}

/// Walk the ordered candidates, taking `min(available, remaining)` from
/// each until the request is covered. Fails with `InsufficientBalance`
/// (and the total that was coverable) if the candidates run out; the
/// caller's transaction rolls back, so a partial walk never sticks.
pub fn plan(op: &'static str, candidates: &[Lot], requested: MicroUsd) -> Result<AllocationPlan> {
	let mut remaining = requested;
	let mut debits = Vec::new();

	for lot in candidates {
		if remaining.is_zero() {
			break;
		}
		let take = lot.available.min(remaining);
		if take.is_zero() {
			continue;
		}
		remaining = remaining.sub(take).map_err(|e| LedgerError::arithmetic(op, e))?;
		debits.push(LotDebit { lot_id: lot.id.clone(), amount: take });
	}

	if !remaining.is_zero() {
		let covered = requested.sub(remaining).map_err(|e| LedgerError::arithmetic(op, e))?;
		return Err(LedgerError::InsufficientBalance {
			op,
			requested,
			available: covered,
		});
	}

	Ok(AllocationPlan { debits, total: requested })
}

/// Plan against the store's eligible lots for (account, pool).
pub fn plan_for(
	tx: &LedgerTx<'_>,
	account_id: i64,
	pool: &Pool,
	requested: MicroUsd,
) -> Result<AllocationPlan> {
	let candidates = tx.eligible_lots(account_id, pool)?;
	let plan = plan(tx.op, &candidates, requested)?;
	debug!(account_id, pool = %pool, debits = plan.debits.len(), "allocation planned");
	Ok(plan)
}

/// Move each planned debit from `available` into `reserved`.
pub fn apply_reserve(tx: &LedgerTx<'_>, plan: &AllocationPlan) -> Result<()> {
	for debit in &plan.debits {
		let amount = micros_to_db(debit.amount);
		tx.lot_delta(&debit.lot_id, -amount, amount, 0)?;
	}
	Ok(())
}

/// Move each planned debit from `available` straight into `consumed`.
pub fn apply_consume(tx: &LedgerTx<'_>, plan: &AllocationPlan) -> Result<()> {
	for debit in &plan.debits {
		let amount = micros_to_db(debit.amount);
		tx.lot_delta(&debit.lot_id, -amount, 0, amount)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{clock::TestClock, store::LedgerStore, store::NewLot};
	use chrono::{Duration, TimeZone, Utc};
	use credit_primitives::{EntityType, LotSourceType};
	use std::sync::Arc;

	fn usd(micros: u64) -> MicroUsd {
		MicroUsd::new(micros).unwrap()
	}

	fn store_with_clock() -> (LedgerStore, TestClock) {
		let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
		(LedgerStore::open_in_memory(Arc::new(clock.clone())).unwrap(), clock)
	}

	fn mint(
		tx: &LedgerTx<'_>,
		account_id: i64,
		id: &str,
		amount: u64,
		pool: Option<Pool>,
		expires_at: Option<chrono::DateTime<Utc>>,
	) -> Lot {
		tx.insert_lot(&NewLot {
			id: id.to_string(),
			account_id,
			pool,
			amount: usd(amount),
			source_type: LotSourceType::Grant,
			source_id: None,
			expires_at,
		})
		.unwrap()
	}

	#[test]
	fn expiring_lots_are_selected_before_open_ended_ones() {
		let (store, clock) = store_with_clock();
		store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Person, "p1")?;
				mint(tx, account.id, "l1", 500_000, None, None);
				mint(tx, account.id, "l2", 500_000, None, Some(clock_now(&clock) + Duration::hours(24)));

				let plan = plan_for(tx, account.id, &Pool::general(), usd(600_000))?;
				assert_eq!(plan.debits.len(), 2);
				assert_eq!(plan.debits[0], LotDebit { lot_id: "l2".into(), amount: usd(500_000) });
				assert_eq!(plan.debits[1], LotDebit { lot_id: "l1".into(), amount: usd(100_000) });
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn earlier_expiry_wins_and_id_breaks_exact_ties() {
		let (store, clock) = store_with_clock();
		store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Person, "p1")?;
				let soon = clock_now(&clock) + Duration::hours(1);
				let later = clock_now(&clock) + Duration::hours(2);
				mint(tx, account.id, "b", 100, None, Some(later));
				mint(tx, account.id, "c", 100, None, Some(soon));
				mint(tx, account.id, "a", 100, None, Some(later));

				let plan = plan_for(tx, account.id, &Pool::general(), usd(300))?;
				let order: Vec<&str> =
					plan.debits.iter().map(|d| d.lot_id.as_str()).collect();
				// Earliest expiry first; equal expiry and creation falls
				// back to lexical lot id.
				assert_eq!(order, vec!["c", "a", "b"]);
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn pool_bound_lots_come_before_general_ones() {
		let (store, _) = store_with_clock();
		store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Person, "p1")?;
				mint(tx, account.id, "general", 400, None, None);
				mint(tx, account.id, "bound", 400, Some(Pool::campaign("x")), None);
				mint(tx, account.id, "other", 400, Some(Pool::campaign("y")), None);

				let plan = plan_for(tx, account.id, &Pool::campaign("x"), usd(600))?;
				let order: Vec<&str> =
					plan.debits.iter().map(|d| d.lot_id.as_str()).collect();
				// The foreign campaign pool is filtered out entirely.
				assert_eq!(order, vec!["bound", "general"]);
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn expired_lots_are_not_eligible() {
		let (store, clock) = store_with_clock();
		store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Person, "p1")?;
				mint(tx, account.id, "dead", 500, None, Some(clock_now(&clock) - Duration::hours(1)));
				mint(tx, account.id, "live", 500, None, None);

				let plan = plan_for(tx, account.id, &Pool::general(), usd(400))?;
				assert_eq!(plan.debits[0].lot_id, "live");
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn shortfall_reports_what_was_coverable() {
		let (store, _) = store_with_clock();
		let err = store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Person, "p1")?;
				mint(tx, account.id, "l1", 250, None, None);
				plan_for(tx, account.id, &Pool::general(), usd(1_000)).map(|_| ())
			})
			.unwrap_err();
		match err {
			LedgerError::InsufficientBalance { requested, available, .. } => {
				assert_eq!(requested, usd(1_000));
				assert_eq!(available, usd(250));
			},
			other => panic!("unexpected error: {other}"),
		}
	}

	fn clock_now(clock: &TestClock) -> chrono::DateTime<Utc> {
		use crate::clock::Clock;
		clock.now()
	}
}
