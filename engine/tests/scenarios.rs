//! End-to-end ledger scenarios, driven through the public service
//! surface against an in-memory store with a stepped clock.

use chrono::{Duration, TimeZone, Utc};
use credit_engine::{
	budget::BudgetEngine,
	clock::TestClock,
	distribution::RevenueDistribution,
	governance::Governance,
	ledger::{CreditLedger, MintOptions},
	reservation::{ReservationEngine, ReserveOptions},
	store::LedgerStore,
	LedgerError,
};
use credit_primitives::{
	BillingMode, EntityType, EntryType, LotSourceType, MicroUsd, Pool, ReservationStatus,
};
use std::sync::Arc;

struct Stack {
	store: Arc<LedgerStore>,
	clock: TestClock,
	ledger: CreditLedger,
	reservations: ReservationEngine,
	budget: BudgetEngine,
	governance: Governance,
}

fn stack() -> Stack {
	let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
	let store = Arc::new(LedgerStore::open_in_memory(Arc::new(clock.clone())).unwrap());
	let distribution = Arc::new(RevenueDistribution::new());
	Stack {
		store: store.clone(),
		clock,
		ledger: CreditLedger::new(store.clone()),
		reservations: ReservationEngine::new(store.clone(), distribution),
		budget: BudgetEngine::new(store.clone()),
		governance: Governance::new(store),
	}
}

fn usd(micros: u64) -> MicroUsd {
	MicroUsd::new(micros).unwrap()
}

#[test]
fn reserve_finalize_returns_surplus_with_contiguous_ledger() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	let minted = stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let reservation =
		stack.reservations.reserve(account.id, usd(600_000), Default::default()).unwrap();
	let mid = stack.store.read("test", |tx| tx.lot(&minted.lot.id)).unwrap();
	assert_eq!(mid.available, usd(400_000));
	assert_eq!(mid.reserved, usd(600_000));
	assert_eq!(mid.consumed, MicroUsd::ZERO);

	let outcome = stack.reservations.finalize(&reservation.id, usd(400_000)).unwrap();
	assert_eq!(outcome.consumed, usd(400_000));
	assert_eq!(outcome.released, usd(200_000));
	assert_eq!(outcome.overrun, MicroUsd::ZERO);

	let after = stack.store.read("test", |tx| tx.lot(&minted.lot.id)).unwrap();
	assert_eq!(after.available, usd(600_000));
	assert_eq!(after.reserved, MicroUsd::ZERO);
	assert_eq!(after.consumed, usd(400_000));

	let entries = stack
		.store
		.read("test", |tx| tx.entries(account.id, &Pool::general()))
		.unwrap();
	let shape: Vec<(i64, EntryType, i64)> =
		entries.iter().map(|e| (e.entry_seq, e.entry_type, e.amount)).collect();
	assert_eq!(
		shape,
		vec![
			(1, EntryType::Deposit, 1_000_000),
			(2, EntryType::Reserve, -600_000),
			(3, EntryType::Finalize, -400_000),
			(4, EntryType::Release, 200_000),
		]
	);
}

#[test]
fn fifo_prefers_the_expiring_lot() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	let open_ended = stack
		.ledger
		.mint_lot(account.id, usd(500_000), LotSourceType::Deposit, Default::default())
		.unwrap();
	let expiring = stack
		.ledger
		.mint_lot(
			account.id,
			usd(500_000),
			LotSourceType::Grant,
			MintOptions {
				expires_at: Some(Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()),
				..Default::default()
			},
		)
		.unwrap();

	stack.reservations.reserve(account.id, usd(600_000), Default::default()).unwrap();

	let (l1, l2) = stack
		.store
		.read("test", |tx| Ok((tx.lot(&open_ended.lot.id)?, tx.lot(&expiring.lot.id)?)))
		.unwrap();
	assert_eq!(l2.reserved, usd(500_000));
	assert_eq!(l2.available, MicroUsd::ZERO);
	assert_eq!(l1.reserved, usd(100_000));
	assert_eq!(l1.available, usd(400_000));
}

#[test]
fn live_mode_caps_the_bill_and_reports_the_overrun() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	let minted = stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let reservation =
		stack.reservations.reserve(account.id, usd(100_000), Default::default()).unwrap();
	let outcome = stack.reservations.finalize(&reservation.id, usd(150_000)).unwrap();

	assert_eq!(outcome.consumed, usd(100_000));
	assert_eq!(outcome.overrun, usd(50_000));
	assert_eq!(outcome.released, MicroUsd::ZERO);

	let lot = stack.store.read("test", |tx| tx.lot(&minted.lot.id)).unwrap();
	assert_eq!(lot.consumed, usd(100_000));
	assert_eq!(lot.available, usd(900_000));
}

#[test]
fn soft_mode_bills_the_overrun_and_carries_a_debt_when_short() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	stack
		.ledger
		.mint_lot(account.id, usd(120_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let reservation = stack
		.reservations
		.reserve(
			account.id,
			usd(100_000),
			ReserveOptions { billing_mode: BillingMode::Soft, ..Default::default() },
		)
		.unwrap();
	let outcome = stack.reservations.finalize(&reservation.id, usd(150_000)).unwrap();
	assert_eq!(outcome.consumed, usd(150_000));

	// 20k was coverable from available; the remaining 30k is debt and
	// the cached balance goes negative.
	let balance = stack.ledger.balance(account.id, &Pool::general()).unwrap();
	assert_eq!(balance.available, -30_000);

	// A fresh mint settles the debt before crediting balance.
	let minted = stack
		.ledger
		.mint_lot(account.id, usd(100_000), LotSourceType::Deposit, Default::default())
		.unwrap();
	assert_eq!(minted.settled_debt, usd(30_000));
	assert_eq!(minted.lot.available, usd(70_000));

	let balance = stack.ledger.balance(account.id, &Pool::general()).unwrap();
	assert_eq!(balance.available, 70_000);
}

#[test]
fn shadow_reservations_never_touch_lots() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Agent, "a1").unwrap();
	let minted = stack
		.ledger
		.mint_lot(account.id, usd(100_000), LotSourceType::Grant, Default::default())
		.unwrap();

	let reservation = stack
		.reservations
		.reserve(
			account.id,
			usd(50_000),
			ReserveOptions { billing_mode: BillingMode::Shadow, ..Default::default() },
		)
		.unwrap();
	// Overrun in shadow mode is logged, not billed.
	let outcome = stack.reservations.finalize(&reservation.id, usd(80_000)).unwrap();
	assert_eq!(outcome.consumed, MicroUsd::ZERO);
	assert_eq!(outcome.shares, None);

	let lot = stack.store.read("test", |tx| tx.lot(&minted.lot.id)).unwrap();
	assert_eq!(lot.available, usd(100_000));
	assert_eq!(lot.reserved, MicroUsd::ZERO);
	assert_eq!(lot.consumed, MicroUsd::ZERO);

	let entries = stack
		.store
		.read("test", |tx| tx.entries(account.id, &Pool::general()))
		.unwrap();
	let types: Vec<EntryType> = entries.iter().map(|e| e.entry_type).collect();
	assert_eq!(
		types,
		vec![EntryType::Grant, EntryType::ShadowReserve, EntryType::ShadowFinalize]
	);
}

#[test]
fn finalization_distributes_revenue_zero_sum() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let reservation =
		stack.reservations.reserve(account.id, usd(333_333), Default::default()).unwrap();
	let outcome = stack.reservations.finalize(&reservation.id, usd(333_333)).unwrap();

	let shares = outcome.shares.unwrap();
	assert_eq!(shares.commons, usd(49_999));
	assert_eq!(shares.community, usd(166_666));
	assert_eq!(shares.foundation, usd(116_668));
	let total = shares
		.commons
		.add(shares.community)
		.and_then(|sum| sum.add(shares.foundation))
		.unwrap();
	assert_eq!(total, usd(333_333));

	// The three protocol entries landed in the same transaction,
	// correlated by the reservation.
	let protocol_amounts: Vec<i64> = stack
		.store
		.read("test", |tx| {
			let commons = tx.account(EntityType::Commons, "commons")?.unwrap();
			let community = tx.account(EntityType::Community, "platform")?.unwrap();
			let foundation = tx.account(EntityType::Foundation, "foundation")?.unwrap();
			Ok([commons, community, foundation]
				.iter()
				.flat_map(|account| {
					tx.entries(account.id, &Pool::general()).unwrap_or_default()
				})
				.filter(|entry| entry.reservation_id.as_deref() == Some(reservation.id.as_str()))
				.map(|entry| entry.amount)
				.collect())
		})
		.unwrap();
	assert_eq!(protocol_amounts, vec![49_999, 166_666, 116_668]);
}

#[test]
fn minting_is_idempotent_on_the_external_source() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();

	let options = || MintOptions { source_id: Some("tx_abc".to_string()), ..Default::default() };
	let first = stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, options())
		.unwrap();
	let second = stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, options())
		.unwrap();

	assert!(!first.replayed);
	assert!(second.replayed);
	assert_eq!(first.lot.id, second.lot.id);

	let entries = stack
		.store
		.read("test", |tx| tx.entries(account.id, &Pool::general()))
		.unwrap();
	assert_eq!(entries.len(), 1);
}

#[test]
fn reserve_replays_identically_and_conflicts_on_drift() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let options = |amount_key: &str| ReserveOptions {
		idempotency_key: Some(amount_key.to_string()),
		..Default::default()
	};
	let first =
		stack.reservations.reserve(account.id, usd(200_000), options("res-1")).unwrap();
	let replay =
		stack.reservations.reserve(account.id, usd(200_000), options("res-1")).unwrap();
	assert_eq!(first.id, replay.id);

	// Only one reservation's worth of credits is held.
	let balance = stack.ledger.balance(account.id, &Pool::general()).unwrap();
	assert_eq!(balance.reserved, usd(200_000));

	let err =
		stack.reservations.reserve(account.id, usd(300_000), options("res-1")).unwrap_err();
	assert!(matches!(err, LedgerError::Conflict { .. }));
}

#[test]
fn finalize_replays_identically_and_conflicts_on_a_different_cost() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let reservation =
		stack.reservations.reserve(account.id, usd(500_000), Default::default()).unwrap();
	let first = stack.reservations.finalize(&reservation.id, usd(300_000)).unwrap();
	let replay = stack.reservations.finalize(&reservation.id, usd(300_000)).unwrap();
	assert_eq!(first.consumed, replay.consumed);
	assert_eq!(first.released, replay.released);

	// No double movement: the lot still shows one finalization.
	let balance = stack.ledger.balance(account.id, &Pool::general()).unwrap();
	assert_eq!(balance.available, 700_000);
	assert_eq!(balance.reserved, MicroUsd::ZERO);

	let err = stack.reservations.finalize(&reservation.id, usd(400_000)).unwrap_err();
	assert!(matches!(err, LedgerError::Conflict { .. }));
}

#[test]
fn release_restores_the_hold_and_terminal_states_absorb() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let reservation =
		stack.reservations.reserve(account.id, usd(250_000), Default::default()).unwrap();
	let released = stack.reservations.release(&reservation.id).unwrap();
	assert_eq!(released.status, ReservationStatus::Released);

	let balance = stack.ledger.balance(account.id, &Pool::general()).unwrap();
	assert_eq!(balance.available, 1_000_000);
	assert_eq!(balance.reserved, MicroUsd::ZERO);

	let err = stack.reservations.finalize(&reservation.id, usd(1)).unwrap_err();
	assert!(matches!(err, LedgerError::TerminalStateViolation { .. }));
	let err = stack.reservations.release(&reservation.id).unwrap_err();
	assert!(matches!(err, LedgerError::TerminalStateViolation { .. }));
}

#[test]
fn the_sweeper_expires_lapsed_reservations_quietly() {
	let stack = stack();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let reservation =
		stack.reservations.reserve(account.id, usd(250_000), Default::default()).unwrap();

	// Default TTL is 300 seconds.
	stack.clock.advance(Duration::seconds(301));
	assert_eq!(stack.reservations.expire_due(16).unwrap(), 1);
	assert_eq!(stack.reservations.expire_due(16).unwrap(), 0);

	let (status, events) = stack
		.store
		.read("test", |tx| {
			let status = tx.reservation(&reservation.id)?.status;
			let released =
				tx.count_events(credit_engine::events::EventType::ReservationReleased)?;
			Ok((status, released))
		})
		.unwrap();
	assert_eq!(status, ReservationStatus::Expired);
	assert_eq!(events, 0);

	let balance = stack.ledger.balance(account.id, &Pool::general()).unwrap();
	assert_eq!(balance.available, 1_000_000);
}

#[test]
fn agent_reservations_respect_the_daily_budget() {
	let stack = stack();
	let agent = stack.ledger.create_account(EntityType::Agent, "bot-1").unwrap();
	stack
		.ledger
		.mint_lot(agent.id, usd(10_000_000), LotSourceType::Grant, Default::default())
		.unwrap();
	stack.budget.configure_cap(agent.id, usd(500_000)).unwrap();

	let err = stack
		.reservations
		.reserve(agent.id, usd(600_000), Default::default())
		.unwrap_err();
	assert!(matches!(err, LedgerError::BudgetOverspend { .. }));

	// The failed reservation held nothing, and the breaker stayed
	// tripped on record.
	let balance = stack.ledger.balance(agent.id, &Pool::general()).unwrap();
	assert_eq!(balance.reserved, MicroUsd::ZERO);
	assert_eq!(
		stack.budget.status(agent.id).unwrap().unwrap().circuit_state,
		credit_primitives::CircuitState::Open
	);

	// Under the cap still flows (the window has not rolled, but the
	// denied amount was never recorded as spend).
	let reservation =
		stack.reservations.reserve(agent.id, usd(400_000), Default::default()).unwrap();
	stack.reservations.finalize(&reservation.id, usd(400_000)).unwrap();
	assert_eq!(
		stack.budget.status(agent.id).unwrap().unwrap().current_spend,
		usd(400_000)
	);
}

#[test]
fn governed_ttl_applies_to_new_reservations() {
	let stack = stack();
	stack.governance.seed_defaults("boot").unwrap();
	let account = stack.ledger.create_account(EntityType::Person, "p1").unwrap();
	stack
		.ledger
		.mint_lot(account.id, usd(1_000_000), LotSourceType::Deposit, Default::default())
		.unwrap();

	let proposal = stack
		.governance
		.propose("reservation.default_ttl_seconds", None, serde_json::json!(60), "ops")
		.unwrap();
	stack.governance.approve(proposal.id, "alice").unwrap();
	stack.governance.approve(proposal.id, "bob").unwrap();
	stack.clock.advance(Duration::days(2));
	stack.governance.activate_due().unwrap();

	let reservation =
		stack.reservations.reserve(account.id, usd(100), Default::default()).unwrap();
	assert_eq!(reservation.expires_at - reservation.created_at, Duration::seconds(60));
}
