//! Account and lot lifecycle: creation, minting, refunds, debt
//! settlement.
//!
//! `mint_lot` is the single entry point for new credits. Within one
//! transaction it inserts the lot, settles outstanding debts from the
//! fresh balance (oldest debt first), appends the ledger entry, folds
//! the balance cache and emits `LotMinted`. The `(source_type,
//! source_id)` unique index makes external double-credits impossible:
//! a replay returns the original lot and writes nothing.

use crate::{
	error::{LedgerError, Result},
	events::{EconomicEvent, EventType, LegacyEventType},
	store::{
		micros_to_db, Account, BalanceSnapshot, LedgerStore, LedgerTx, Lot, NewEntry, NewLot,
	},
};
use chrono::{DateTime, Utc};
use credit_primitives::{EntityType, EntryType, LotSourceType, MicroUsd, Pool};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct MintOptions {
	pub pool: Option<Pool>,
	/// External event id; unique per source type.
	pub source_id: Option<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MintOutcome {
	pub lot: Lot,
	/// Portion of the mint that settled outstanding debts.
	pub settled_debt: MicroUsd,
	/// True when the `(source_type, source_id)` pair had already been
	/// credited and the original lot was returned unchanged.
	pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
	/// Amount clawed back from available lots.
	pub reclaimed: MicroUsd,
	/// Shortfall recorded as debt to be settled by future deposits.
	pub debt: MicroUsd,
}

/// The account/lot facade over the store.
pub struct CreditLedger {
	store: Arc<LedgerStore>,
}

impl CreditLedger {
	pub fn new(store: Arc<LedgerStore>) -> Self {
		Self { store }
	}

	pub fn store(&self) -> &Arc<LedgerStore> {
		&self.store
	}

	/// Idempotent account creation.
	pub fn create_account(&self, entity_type: EntityType, entity_id: &str) -> Result<Account> {
		self.store.with_tx("create_account", |tx| {
			let existing = tx.account(entity_type, entity_id)?;
			let account = tx.create_account(entity_type, entity_id)?;
			if existing.is_none() {
				// Account creation predates the outbox vocabulary; it is
				// audited on the legacy side only.
				tx.emit_legacy(
					LegacyEventType::AccountCreated,
					entity_type,
					entity_id,
					json!({ "account_id": account.id }),
				)?;
			}
			Ok(account)
		})
	}

	pub fn mint_lot(
		&self,
		account_id: i64,
		amount: MicroUsd,
		source_type: LotSourceType,
		options: MintOptions,
	) -> Result<MintOutcome> {
		self.store
			.with_tx("mint_lot", |tx| mint_lot_in_tx(tx, account_id, amount, source_type, &options))
	}

	/// Claw `amount` back out of the account's available credits, most
	/// recently acquired lots first. A shortfall becomes a debt row that
	/// future mints settle before crediting balance.
	pub fn refund(
		&self,
		account_id: i64,
		pool: &Pool,
		amount: MicroUsd,
		idempotency_key: Option<String>,
	) -> Result<RefundOutcome> {
		self.store.with_tx("refund", |tx| {
			if amount.is_zero() {
				return Err(LedgerError::invalid_state(tx.op, "amount must be positive"));
			}
			if let Some(key) = &idempotency_key {
				if tx.entry_by_idempotency(key)?.is_some() {
					return Err(LedgerError::conflict(
						tx.op,
						format!("refund idempotency key {key:?} already used"),
					));
				}
			}
			let account = tx.account_by_id(account_id)?;
			let arith = |e| LedgerError::arithmetic(tx.op, e);
			let pre_balance = tx.balance(account_id, pool)?.available;

			let mut lots = tx.eligible_lots(account_id, pool)?;
			lots.reverse(); // claw back newest credits first
			let mut remaining = amount;
			let mut reclaimed = MicroUsd::ZERO;
			for lot in &lots {
				if remaining.is_zero() {
					break;
				}
				let take = lot.available.min(remaining);
				tx.lot_delta(&lot.id, -micros_to_db(take), 0, micros_to_db(take))?;
				remaining = remaining.sub(take).map_err(arith)?;
				reclaimed = reclaimed.add(take).map_err(arith)?;
			}

			let debt = remaining;
			if !debt.is_zero() {
				tx.insert_debt(account_id, pool, debt)?;
			}

			tx.insert_entry(&NewEntry {
				account_id,
				pool: pool.clone(),
				lot_id: None,
				reservation_id: None,
				entry_type: EntryType::Refund,
				amount: -micros_to_db(amount),
				idempotency_key,
				pre_balance: Some(pre_balance),
				post_balance: Some(pre_balance - micros_to_db(amount)),
			})?;
			tx.balance_delta(account_id, pool, -micros_to_db(amount), 0)?;

			tx.emit(&EconomicEvent::new(
				EventType::EarningClawedBack,
				account.entity_type,
				account.entity_id.as_str(),
				json!({ "amount": amount, "reclaimed": reclaimed, "debt": debt }),
			))?;

			Ok(RefundOutcome { reclaimed, debt })
		})
	}

	pub fn balance(&self, account_id: i64, pool: &Pool) -> Result<BalanceSnapshot> {
		self.store.read("balance", |tx| tx.balance(account_id, pool))
	}
}

pub(crate) fn mint_lot_in_tx(
	tx: &LedgerTx<'_>,
	account_id: i64,
	amount: MicroUsd,
	source_type: LotSourceType,
	options: &MintOptions,
) -> Result<MintOutcome> {
	if amount.is_zero() {
		return Err(LedgerError::invalid_state(tx.op, "amount must be positive"));
	}
	let account = tx.account_by_id(account_id)?;

	// External-event replay: the unique (source_type, source_id) pair
	// already minted a lot; return it, write nothing.
	if let Some(source_id) = &options.source_id {
		if let Some(existing) = tx.lot_by_source(source_type, source_id)? {
			if existing.account_id != account_id {
				return Err(LedgerError::conflict(
					tx.op,
					format!("source {source_type}/{source_id} already credited to another account"),
				));
			}
			return Ok(MintOutcome { lot: existing, settled_debt: MicroUsd::ZERO, replayed: true });
		}
	}

	let pool_key = options.pool.clone().unwrap_or_default();
	let pre_balance = tx.balance(account_id, &pool_key)?.available;

	let lot = tx.insert_lot(&NewLot {
		id: Uuid::new_v4().to_string(),
		account_id,
		pool: options.pool.clone(),
		amount,
		source_type,
		source_id: options.source_id.clone(),
		expires_at: options.expires_at,
	})?;

	let entry_type = match source_type {
		LotSourceType::Grant => EntryType::Grant,
		_ => EntryType::Deposit,
	};
	tx.insert_entry(&NewEntry {
		account_id,
		pool: pool_key.clone(),
		lot_id: Some(lot.id.clone()),
		reservation_id: None,
		entry_type,
		amount: micros_to_db(amount),
		idempotency_key: options.idempotency_key.clone(),
		pre_balance: Some(pre_balance),
		post_balance: Some(pre_balance + micros_to_db(amount)),
	})?;

	// New deposits credit outstanding debts before crediting balance:
	// the settled portion of the fresh lot is consumed immediately,
	// oldest debt first.
	let arith = |e| LedgerError::arithmetic(tx.op, e);
	let mut settled_total = MicroUsd::ZERO;
	let mut residual = amount;
	for debt in tx.outstanding_debts(account_id, &pool_key)? {
		if residual.is_zero() {
			break;
		}
		let outstanding = debt.amount.sub(debt.settled).map_err(arith)?;
		let pay = outstanding.min(residual);
		tx.settle_debt(debt.id, pay)?;
		tx.lot_delta(&lot.id, -micros_to_db(pay), 0, micros_to_db(pay))?;
		tx.insert_entry(&NewEntry {
			account_id,
			pool: pool_key.clone(),
			lot_id: Some(lot.id.clone()),
			reservation_id: None,
			entry_type: EntryType::Refund,
			amount: -micros_to_db(pay),
			idempotency_key: None,
			pre_balance: None,
			post_balance: None,
		})?;
		residual = residual.sub(pay).map_err(arith)?;
		settled_total = settled_total.add(pay).map_err(arith)?;
	}

	// Cached available moves by the full mint: the residual lands as lot
	// balance, the settled part cancels previously carried debt.
	tx.balance_delta(account_id, &pool_key, micros_to_db(amount), 0)?;

	tx.emit(
		&EconomicEvent::new(
			EventType::LotMinted,
			account.entity_type,
			account.entity_id.as_str(),
			json!({
				"lot_id": lot.id,
				"amount": amount,
				"source_type": source_type,
				"source_id": options.source_id,
				"pool": pool_key.as_str(),
			}),
		)
		.correlated(lot.id.clone()),
	)?;
	info!(lot = %lot.id, %amount, source = %source_type, "lot minted");

	let lot = tx.lot(&lot.id)?;
	Ok(MintOutcome { lot, settled_debt: settled_total, replayed: false })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{clock::TestClock, store::LedgerStore};
	use chrono::{Duration, TimeZone};

	fn usd(micros: u64) -> MicroUsd {
		MicroUsd::new(micros).unwrap()
	}

	fn harness() -> (Arc<LedgerStore>, CreditLedger, TestClock) {
		let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
		let store = Arc::new(LedgerStore::open_in_memory(Arc::new(clock.clone())).unwrap());
		(store.clone(), CreditLedger::new(store), clock)
	}

	#[test]
	fn refund_claws_back_the_newest_lots_first() {
		let (store, ledger, clock) = harness();
		let account = ledger.create_account(EntityType::Person, "p1").unwrap();

		let older = ledger
			.mint_lot(account.id, usd(500), LotSourceType::Deposit, Default::default())
			.unwrap();
		clock.advance(Duration::seconds(5));
		let newer = ledger
			.mint_lot(account.id, usd(300), LotSourceType::Deposit, Default::default())
			.unwrap();

		let outcome = ledger.refund(account.id, &Pool::general(), usd(400), None).unwrap();
		assert_eq!(outcome.reclaimed, usd(400));
		assert_eq!(outcome.debt, MicroUsd::ZERO);

		// The newer lot drains entirely before the older one is touched.
		let (older, newer) = store
			.read("test", |tx| Ok((tx.lot(&older.lot.id)?, tx.lot(&newer.lot.id)?)))
			.unwrap();
		assert_eq!(newer.available, MicroUsd::ZERO);
		assert_eq!(newer.consumed, usd(300));
		assert_eq!(older.available, usd(400));
		assert_eq!(older.consumed, usd(100));

		store
			.read("test", |tx| {
				assert_eq!(tx.count_events(EventType::EarningClawedBack)?, 1);
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn refund_shortfall_becomes_debt_and_the_next_mint_settles_it() {
		let (store, ledger, _) = harness();
		let account = ledger.create_account(EntityType::Person, "p1").unwrap();
		ledger.mint_lot(account.id, usd(100), LotSourceType::Deposit, Default::default()).unwrap();

		let outcome = ledger.refund(account.id, &Pool::general(), usd(250), None).unwrap();
		assert_eq!(outcome.reclaimed, usd(100));
		assert_eq!(outcome.debt, usd(150));
		assert_eq!(ledger.balance(account.id, &Pool::general()).unwrap().available, -150);

		// New deposits credit the debt before crediting balance.
		let minted = ledger
			.mint_lot(account.id, usd(200), LotSourceType::Deposit, Default::default())
			.unwrap();
		assert_eq!(minted.settled_debt, usd(150));
		assert_eq!(minted.lot.available, usd(50));
		assert_eq!(ledger.balance(account.id, &Pool::general()).unwrap().available, 50);

		let shape: Vec<(EntryType, i64)> = store
			.read("test", |tx| {
				Ok(tx.entries(account.id, &Pool::general())?
					.iter()
					.map(|e| (e.entry_type, e.amount))
					.collect())
			})
			.unwrap();
		assert_eq!(
			shape,
			vec![
				(EntryType::Deposit, 100),
				(EntryType::Refund, -250),
				(EntryType::Deposit, 200),
				(EntryType::Refund, -150),
			]
		);
	}

	#[test]
	fn refund_rejects_a_reused_idempotency_key() {
		let (_, ledger, _) = harness();
		let account = ledger.create_account(EntityType::Person, "p1").unwrap();
		ledger.mint_lot(account.id, usd(1_000), LotSourceType::Deposit, Default::default()).unwrap();

		ledger
			.refund(account.id, &Pool::general(), usd(100), Some("rf-1".to_string()))
			.unwrap();
		let err = ledger
			.refund(account.id, &Pool::general(), usd(100), Some("rf-1".to_string()))
			.unwrap_err();
		assert!(matches!(err, LedgerError::Conflict { .. }));
	}
}
