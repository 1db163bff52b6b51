//! The reservation engine.
//!
//! `reserve` holds credits out of `available` into `reserved` across
//! FIFO-selected lots; `finalize` converts the hold into consumption at
//! the actual cost and returns any surplus; `release` and the expiry
//! sweeper hand the hold back. Every path is one exclusive store
//! transaction covering lot debits, ledger entries, the balance cache,
//! revenue distribution and the outbox event.
//!
//! Shadow-mode reservations observe only: the allocator runs as a dry
//! run to validate coverage, but no lot is ever debited and
//! finalization records an auditable `shadow_finalize` entry instead of
//! moving balances.

use crate::{
	allocator,
	budget::{self, BudgetDecision},
	distribution::{DistributionShares, RevenueDistribution},
	error::{LedgerError, Result},
	events::{EconomicEvent, EventType},
	governance,
	state_machine::RESERVATION,
	store::{
		micros_to_db, Account, LedgerStore, LedgerTx, NewEntry, Reservation,
	},
	sweepers,
};
use chrono::Duration;
use credit_primitives::{BillingMode, EntityType, EntryType, MicroUsd, Pool, ReservationStatus};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReserveOptions {
	pub pool: Pool,
	pub billing_mode: BillingMode,
	/// Defaults to the governed `reservation.default_ttl_seconds`.
	pub ttl: Option<Duration>,
	pub idempotency_key: Option<String>,
}

impl Default for ReserveOptions {
	fn default() -> Self {
		Self {
			pool: Pool::general(),
			billing_mode: BillingMode::default(),
			ttl: None,
			idempotency_key: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
	pub reservation: Reservation,
	/// Amount billed against credits (zero for shadow mode).
	pub consumed: MicroUsd,
	/// Surplus handed back to `available`.
	pub released: MicroUsd,
	/// Unbilled excess reported in live mode when the actual cost
	/// overran the reservation.
	pub overrun: MicroUsd,
	/// Revenue shares posted with this finalization; `None` on an
	/// idempotent replay or when nothing was billed.
	pub shares: Option<DistributionShares>,
}

pub struct ReservationEngine {
	store: Arc<LedgerStore>,
	distribution: Arc<RevenueDistribution>,
}

impl ReservationEngine {
	pub fn new(store: Arc<LedgerStore>, distribution: Arc<RevenueDistribution>) -> Self {
		Self { store, distribution }
	}

	pub fn store(&self) -> &Arc<LedgerStore> {
		&self.store
	}

	/// Reserve `amount` for `account_id`.
	///
	/// Agent accounts pass the budget gate first, in its own committed
	/// transaction, so a tripped circuit breaker survives a failing
	/// reservation. An idempotency replay with an identical payload
	/// returns the original reservation unchanged; a differing payload
	/// is a `Conflict`.
	pub fn reserve(
		&self,
		account_id: i64,
		amount: MicroUsd,
		options: ReserveOptions,
	) -> Result<Reservation> {
		const OP: &str = "reserve";
		if amount.is_zero() {
			return Err(LedgerError::invalid_state(OP, "amount must be positive"));
		}

		if let Some(key) = &options.idempotency_key {
			if let Some(existing) =
				self.store.read(OP, |tx| tx.reservation_by_idempotency(key))?
			{
				return replay_reservation(OP, existing, account_id, amount, &options);
			}
		}

		let account = self.store.read(OP, |tx| tx.account_by_id(account_id))?;
		let budget_gated = account.entity_type == EntityType::Agent &&
			options.billing_mode != BillingMode::Shadow;

		if budget_gated {
			let decision = self
				.store
				.with_tx("reserve_budget", |tx| budget::check_and_reserve(tx, &account, amount))?;
			if let BudgetDecision::Denied { attempted, cap } = decision {
				return Err(LedgerError::BudgetOverspend { op: OP, attempted, cap });
			}
		}

		let result = self.store.with_tx(OP, |tx| reserve_in_tx(tx, &account, amount, &options));

		if result.is_err() && budget_gated {
			// The reservation never materialized; hand the gated spend back.
			// A failure here leaves phantom spend in the window until the
			// next reconciliation pass, so it must leave a trace.
			if let Err(error) = self
				.store
				.with_tx("reserve_budget_undo", |tx| budget::record_release(tx, account.id, amount))
			{
				warn!(account = %account.entity_id, %amount, %error, "failed to hand gated budget spend back");
			}
		}
		result
	}

	/// Finalize a pending reservation at `actual_cost`.
	///
	/// A replay with the same actual cost returns the original result
	/// (without re-posting revenue); a differing cost is a `Conflict`.
	pub fn finalize(&self, reservation_id: &str, actual_cost: MicroUsd) -> Result<FinalizeOutcome> {
		self.store.with_tx("finalize", |tx| {
			finalize_in_tx(tx, Some(&self.distribution), reservation_id, actual_cost)
		})
	}

	/// Return a pending reservation's credits to `available`.
	pub fn release(&self, reservation_id: &str) -> Result<Reservation> {
		self.store.with_tx("release", |tx| release_in_tx(tx, reservation_id))
	}

	/// Expire pending reservations whose TTL lapsed. Balance movements
	/// match `release`, the status becomes `expired`, and no
	/// user-visible event is emitted. Returns the number expired.
	pub fn expire_due(&self, limit: usize) -> Result<usize> {
		let due = self
			.store
			.read("expire", |tx| tx.pending_expired_reservations(limit))?;
		let mut expired = 0;
		for reservation in due {
			// Each expiry takes its own transaction; one failure must not
			// wedge the rest of the sweep.
			match self
				.store
				.with_tx("expire", |tx| terminate_in_tx(tx, &reservation.id, ReservationStatus::Expired))
			{
				Ok(()) => expired += 1,
				// Finalized or released in the meantime.
				Err(LedgerError::InvalidState { .. }) |
				Err(LedgerError::TerminalStateViolation { .. }) => {},
				Err(e) => return Err(e),
			}
		}
		Ok(expired)
	}
}

impl sweepers::Sweepable for ReservationEngine {
	fn sweep(&self) -> Result<usize> {
		self.expire_due(256)
	}
}

fn replay_reservation(
	op: &'static str,
	existing: Reservation,
	account_id: i64,
	amount: MicroUsd,
	options: &ReserveOptions,
) -> Result<Reservation> {
	let identical = existing.account_id == account_id &&
		existing.pool == options.pool &&
		existing.total_reserved == amount &&
		existing.billing_mode == options.billing_mode;
	if identical {
		Ok(existing)
	} else {
		Err(LedgerError::conflict(
			op,
			format!("idempotency key {:?} replayed with a different payload", existing.idempotency_key),
		))
	}
}

pub(crate) fn reserve_in_tx(
	tx: &LedgerTx<'_>,
	account: &Account,
	amount: MicroUsd,
	options: &ReserveOptions,
) -> Result<Reservation> {
	let pool = &options.pool;
	let shadow = options.billing_mode == BillingMode::Shadow;

	let ttl = match options.ttl {
		Some(ttl) => ttl,
		None => Duration::seconds(governance::get_i64(
			tx,
			"reservation.default_ttl_seconds",
			Some(account.entity_type),
		)?),
	};

	// Snapshot before any lot moves so the entry's pre_balance is the
	// caller-visible figure.
	let pre_balance = tx.balance(account.id, pool)?.available;

	// Shadow reservations validate coverage with a dry-run plan but never
	// debit a lot.
	let plan = allocator::plan_for(tx, account.id, pool, amount)?;
	if !shadow {
		allocator::apply_reserve(tx, &plan)?;
	}

	let reservation = Reservation {
		id: Uuid::new_v4().to_string(),
		account_id: account.id,
		pool: pool.clone(),
		total_reserved: amount,
		status: ReservationStatus::Pending,
		billing_mode: options.billing_mode,
		expires_at: tx.now + ttl,
		idempotency_key: options.idempotency_key.clone(),
		actual_cost: None,
		created_at: tx.now,
		finalized_at: None,
	};
	tx.insert_reservation(&reservation)?;

	if !shadow {
		for (order, debit) in plan.debits.iter().enumerate() {
			tx.insert_reservation_lot(&reservation.id, &debit.lot_id, debit.amount, order as i64)?;
		}
	}

	let entry_type = if shadow { EntryType::ShadowReserve } else { EntryType::Reserve };
	let lot_hint = (plan.debits.len() == 1).then(|| plan.debits[0].lot_id.clone());
	tx.insert_entry(&NewEntry {
		account_id: account.id,
		pool: pool.clone(),
		lot_id: if shadow { None } else { lot_hint },
		reservation_id: Some(reservation.id.clone()),
		entry_type,
		amount: -micros_to_db(amount),
		idempotency_key: options.idempotency_key.clone(),
		pre_balance: Some(pre_balance),
		post_balance: Some(pre_balance - micros_to_db(amount)),
	})?;

	if !shadow {
		tx.balance_delta(account.id, pool, -micros_to_db(amount), micros_to_db(amount))?;
	}

	tx.emit(
		&EconomicEvent::new(
			EventType::ReservationCreated,
			account.entity_type,
			account.entity_id.as_str(),
			json!({
				"reservation_id": reservation.id,
				"amount": amount,
				"pool": pool.as_str(),
				"billing_mode": options.billing_mode,
			}),
		)
		.correlated(reservation.id.clone()),
	)?;

	Ok(reservation)
}

/// `distribution` is `None` for peer transfers: moving credits between
/// accounts realizes no revenue.
pub(crate) fn finalize_in_tx(
	tx: &LedgerTx<'_>,
	distribution: Option<&RevenueDistribution>,
	reservation_id: &str,
	actual_cost: MicroUsd,
) -> Result<FinalizeOutcome> {
	let reservation = tx.reservation(reservation_id)?;

	if reservation.status == ReservationStatus::Finalized {
		return replay_finalize(tx, reservation, actual_cost);
	}
	RESERVATION.ensure(tx.op, reservation.status, ReservationStatus::Finalized)?;

	let account = tx.account_by_id(reservation.account_id)?;
	let pool = reservation.pool.clone();
	let reserved_total = reservation.total_reserved;

	if reservation.billing_mode == BillingMode::Shadow {
		// Observation only: the full actual cost is logged for audit,
		// no lot or balance moves.
		tx.insert_entry(&NewEntry {
			account_id: account.id,
			pool: pool.clone(),
			lot_id: None,
			reservation_id: Some(reservation.id.clone()),
			entry_type: EntryType::ShadowFinalize,
			amount: -micros_to_db(actual_cost),
			idempotency_key: None,
			pre_balance: None,
			post_balance: None,
		})?;
		tx.transition_reservation(
			&reservation.id,
			ReservationStatus::Pending,
			ReservationStatus::Finalized,
			Some(actual_cost),
			Some(tx.now),
		)?;
		emit_finalized(tx, &account, &reservation.id, MicroUsd::ZERO, MicroUsd::ZERO, actual_cost)?;
		return Ok(FinalizeOutcome {
			reservation: tx.reservation(&reservation.id)?,
			consumed: MicroUsd::ZERO,
			released: MicroUsd::ZERO,
			overrun: MicroUsd::ZERO,
			shares: None,
		});
	}

	let arith = |e| LedgerError::arithmetic(tx.op, e);

	// Consume from the reservation's own allocations first, in
	// allocation order; the surplus of each goes back to available.
	let consumed_from_reserved = reserved_total.min(actual_cost);
	let surplus = reserved_total.sub(consumed_from_reserved).map_err(arith)?;
	let mut remaining = consumed_from_reserved;
	for alloc in tx.reservation_lots(&reservation.id)? {
		let consume = alloc.reserved.min(remaining);
		let hand_back = alloc.reserved.sub(consume).map_err(arith)?;
		remaining = remaining.sub(consume).map_err(arith)?;
		tx.lot_delta(
			&alloc.lot_id,
			micros_to_db(hand_back),
			-micros_to_db(alloc.reserved),
			micros_to_db(consume),
		)?;
		tx.record_reservation_lot_outcome(&reservation.id, &alloc.lot_id, consume, hand_back)?;
	}

	// Overrun handling beyond the reserved amount.
	let requested_overrun = actual_cost.sub(consumed_from_reserved).map_err(arith)?;
	let mut billed = consumed_from_reserved;
	let mut reported_overrun = MicroUsd::ZERO;
	let mut overrun_debited = MicroUsd::ZERO;
	if !requested_overrun.is_zero() {
		match reservation.billing_mode {
			BillingMode::Live => {
				// Cap at the reservation; report the unbilled excess.
				reported_overrun = requested_overrun;
			},
			BillingMode::Soft => {
				// Bill the overshoot from available even if the account
				// goes negative: whatever lots cannot cover becomes debt.
				match allocator::plan_for(tx, account.id, &pool, requested_overrun) {
					Ok(plan) => allocator::apply_consume(tx, &plan)?,
					Err(LedgerError::InsufficientBalance { available, .. }) => {
						if !available.is_zero() {
							let plan = allocator::plan_for(tx, account.id, &pool, available)?;
							allocator::apply_consume(tx, &plan)?;
						}
						let short = requested_overrun.sub(available).map_err(arith)?;
						tx.insert_debt(account.id, &pool, short)?;
					},
					Err(e) => return Err(e),
				}
				overrun_debited = requested_overrun;
				billed = actual_cost;
			},
			BillingMode::Shadow => unreachable!("handled above"),
		}
	}

	// One balance snapshot brackets the finalize/release entry pair.
	let pre_balance = tx.balance(account.id, &pool)?.available;
	let post_finalize = pre_balance - micros_to_db(overrun_debited);
	tx.insert_entry(&NewEntry {
		account_id: account.id,
		pool: pool.clone(),
		lot_id: None,
		reservation_id: Some(reservation.id.clone()),
		entry_type: EntryType::Finalize,
		amount: -micros_to_db(billed),
		idempotency_key: None,
		pre_balance: Some(pre_balance),
		post_balance: Some(post_finalize),
	})?;
	if !surplus.is_zero() {
		tx.insert_entry(&NewEntry {
			account_id: account.id,
			pool: pool.clone(),
			lot_id: None,
			reservation_id: Some(reservation.id.clone()),
			entry_type: EntryType::Release,
			amount: micros_to_db(surplus),
			idempotency_key: None,
			pre_balance: Some(post_finalize),
			post_balance: Some(post_finalize + micros_to_db(surplus)),
		})?;
	}

	tx.balance_delta(
		account.id,
		&pool,
		micros_to_db(surplus) - micros_to_db(overrun_debited),
		-micros_to_db(reserved_total),
	)?;

	if account.entity_type == EntityType::Agent {
		budget::record_finalization(tx, account.id, &reservation.id, billed, reserved_total)?;
	}

	tx.transition_reservation(
		&reservation.id,
		ReservationStatus::Pending,
		ReservationStatus::Finalized,
		Some(actual_cost),
		Some(tx.now),
	)?;

	// Revenue shares post atomically with the finalization, correlated
	// by the reservation id.
	let shares = match distribution {
		Some(distribution) if !billed.is_zero() =>
			Some(distribution.post(tx, &pool, billed, &reservation.id)?),
		_ => None,
	};

	emit_finalized(tx, &account, &reservation.id, billed, surplus, actual_cost)?;
	info!(
		reservation = %reservation.id,
		%billed,
		%surplus,
		overrun = %reported_overrun,
		"reservation finalized"
	);

	Ok(FinalizeOutcome {
		reservation: tx.reservation(&reservation.id)?,
		consumed: billed,
		released: surplus,
		overrun: reported_overrun,
		shares,
	})
}

/// A second finalize with the same cost returns the original result;
/// with a different cost it is a conflict.
fn replay_finalize(
	tx: &LedgerTx<'_>,
	reservation: Reservation,
	actual_cost: MicroUsd,
) -> Result<FinalizeOutcome> {
	if reservation.actual_cost != Some(actual_cost) {
		return Err(LedgerError::conflict(
			tx.op,
			format!(
				"reservation {} already finalized at {:?}",
				reservation.id, reservation.actual_cost
			),
		));
	}
	let allocations = tx.reservation_lots(&reservation.id)?;
	let mut consumed = MicroUsd::ZERO;
	let mut released = MicroUsd::ZERO;
	let arith = |e| LedgerError::arithmetic(tx.op, e);
	for alloc in &allocations {
		consumed = consumed.add(alloc.consumed).map_err(arith)?;
		released = released.add(alloc.released).map_err(arith)?;
	}
	let overrun = if reservation.billing_mode == BillingMode::Live {
		actual_cost.sub(consumed).unwrap_or(MicroUsd::ZERO)
	} else {
		MicroUsd::ZERO
	};
	// Soft-mode overruns billed beyond the allocations.
	if reservation.billing_mode == BillingMode::Soft && actual_cost > consumed {
		consumed = actual_cost;
	}
	Ok(FinalizeOutcome { reservation, consumed, released, overrun, shares: None })
}

fn emit_finalized(
	tx: &LedgerTx<'_>,
	account: &Account,
	reservation_id: &str,
	consumed: MicroUsd,
	released: MicroUsd,
	actual_cost: MicroUsd,
) -> Result<()> {
	tx.emit(
		&EconomicEvent::new(
			EventType::ReservationFinalized,
			account.entity_type,
			account.entity_id.as_str(),
			json!({
				"reservation_id": reservation_id,
				"consumed": consumed,
				"released": released,
				"actual_cost": actual_cost,
			}),
		)
		.correlated(reservation_id.to_string()),
	)?;
	Ok(())
}

pub(crate) fn release_in_tx(tx: &LedgerTx<'_>, reservation_id: &str) -> Result<Reservation> {
	terminate_in_tx(tx, reservation_id, ReservationStatus::Released)?;
	tx.reservation(reservation_id)
}

/// Shared balance mechanics of `release` and `expire`: every allocation
/// goes back to `available` in full. Only `release` is user-visible in
/// the outbox.
fn terminate_in_tx(
	tx: &LedgerTx<'_>,
	reservation_id: &str,
	to: ReservationStatus,
) -> Result<()> {
	let reservation = tx.reservation(reservation_id)?;
	RESERVATION.ensure(tx.op, reservation.status, to)?;

	let account = tx.account_by_id(reservation.account_id)?;
	let shadow = reservation.billing_mode == BillingMode::Shadow;

	if !shadow {
		for alloc in tx.reservation_lots(&reservation.id)? {
			tx.lot_delta(&alloc.lot_id, micros_to_db(alloc.reserved), -micros_to_db(alloc.reserved), 0)?;
			tx.record_reservation_lot_outcome(
				&reservation.id,
				&alloc.lot_id,
				MicroUsd::ZERO,
				alloc.reserved,
			)?;
		}

		let pre_balance = tx.balance(account.id, &reservation.pool)?.available;
		tx.insert_entry(&NewEntry {
			account_id: account.id,
			pool: reservation.pool.clone(),
			lot_id: None,
			reservation_id: Some(reservation.id.clone()),
			entry_type: EntryType::Release,
			amount: micros_to_db(reservation.total_reserved),
			idempotency_key: None,
			pre_balance: Some(pre_balance),
			post_balance: Some(pre_balance + micros_to_db(reservation.total_reserved)),
		})?;
		tx.balance_delta(
			account.id,
			&reservation.pool,
			micros_to_db(reservation.total_reserved),
			-micros_to_db(reservation.total_reserved),
		)?;

		if account.entity_type == EntityType::Agent {
			budget::record_release(tx, account.id, reservation.total_reserved)?;
		}
	}

	tx.transition_reservation(&reservation.id, ReservationStatus::Pending, to, None, None)?;

	if to == ReservationStatus::Released {
		tx.emit(
			&EconomicEvent::new(
				EventType::ReservationReleased,
				account.entity_type,
				account.entity_id.as_str(),
				json!({
					"reservation_id": reservation.id,
					"amount": reservation.total_reserved,
				}),
			)
			.correlated(reservation.id.clone()),
		)?;
	}
	Ok(())
}
