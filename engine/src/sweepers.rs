//! Periodic workers: reservation expiry, idempotency TTL, governance
//! activation, reconciliation, lot-expiry auditing.
//!
//! Each worker runs on its own schedule and takes its own exclusive
//! transactions; none of them shares state with a request path beyond
//! the store. Start-up jitter spreads the first ticks so co-scheduled
//! workers do not contend on the writer lock in lockstep.

use crate::{
	distribution::RevenueDistribution,
	error::{Result, StoreResultExt},
	events::LegacyEventType,
	governance::Governance,
	reconciliation::Reconciler,
	store::{ts_to_db, LedgerStore},
};
use chrono::Duration as ChronoDuration;
use rand::Rng;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{info, info_span, warn};

/// One sweep pass; returns how many items it acted on.
pub trait Sweepable: Send + Sync {
	fn sweep(&self) -> Result<usize>;
}

/// Drive a [`Sweepable`] forever on a fixed period.
pub async fn run_periodic(name: &'static str, period: Duration, target: Arc<dyn Sweepable>) {
	let jitter = Duration::from_millis(
		rand::thread_rng().gen_range(0..period.as_millis().max(1) as u64),
	);
	tokio::time::sleep(jitter).await;

	let mut interval = tokio::time::interval(period);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		interval.tick().await;
		let span = info_span!("sweeper", name);
		let _entered = span.enter();
		match target.sweep() {
			Ok(0) => {},
			Ok(swept) => info!(swept, "sweep pass finished"),
			Err(error) => warn!(%error, "sweep pass failed"),
		}
	}
}

/// Deletes lapsed `(scope, key)` idempotency claims.
pub struct IdempotencySweeper {
	store: Arc<LedgerStore>,
}

impl IdempotencySweeper {
	pub fn new(store: Arc<LedgerStore>) -> Self {
		Self { store }
	}
}

impl Sweepable for IdempotencySweeper {
	fn sweep(&self) -> Result<usize> {
		self.store.with_tx("idempotency_sweep", |tx| tx.purge_expired_idempotency())
	}
}

/// Promotes cooled-down governance rows and invalidates dependent
/// caches.
pub struct GovernanceActivator {
	governance: Arc<Governance>,
	distribution: Arc<RevenueDistribution>,
}

impl GovernanceActivator {
	pub fn new(governance: Arc<Governance>, distribution: Arc<RevenueDistribution>) -> Self {
		Self { governance, distribution }
	}
}

impl Sweepable for GovernanceActivator {
	fn sweep(&self) -> Result<usize> {
		let activated = self.governance.activate_due()?;
		self.distribution.invalidate_if(&activated);
		Ok(activated.len())
	}
}

/// Runs the invariant catalog; the report itself carries the outcome.
pub struct ReconciliationJob {
	reconciler: Arc<Reconciler>,
}

impl ReconciliationJob {
	pub fn new(reconciler: Arc<Reconciler>) -> Self {
		Self { reconciler }
	}
}

impl Sweepable for ReconciliationJob {
	fn sweep(&self) -> Result<usize> {
		let report = self.reconciler.run()?;
		Ok(report.divergences().count())
	}
}

/// Notices lots that crossed their expiry still holding available
/// credits and records a `LotExpired` audit row, once per lot. The
/// allocator already refuses expired lots; counters are never
/// rewritten, so conservation holds untouched.
pub struct LotExpiryAuditor {
	store: Arc<LedgerStore>,
}

impl LotExpiryAuditor {
	pub fn new(store: Arc<LedgerStore>) -> Self {
		Self { store }
	}
}

impl Sweepable for LotExpiryAuditor {
	fn sweep(&self) -> Result<usize> {
		self.store.with_tx("lot_expiry_audit", |tx| {
			let expired: Vec<(String, i64, i64)> = {
				let mut stmt = tx
					.conn()
					.prepare(
						"SELECT l.id, l.available, l.account_id FROM credit_lots l
						 WHERE l.expires_at IS NOT NULL AND l.expires_at < ?1 AND l.available > 0",
					)
					.store_err(tx.op)?;
				let rows = stmt
					.query_map(rusqlite::params![ts_to_db(tx.now)], |row| {
						Ok((row.get(0)?, row.get(1)?, row.get(2)?))
					})
					.store_err(tx.op)?
					.collect::<rusqlite::Result<Vec<_>>>()
					.store_err(tx.op)?;
				rows
			};

			let mut audited = 0;
			for (lot_id, available, account_id) in expired {
				// The idempotency claim makes each lot audited exactly once.
				if !tx.claim_idempotency(
					"lot_expired",
					&lot_id,
					tx.now + ChronoDuration::days(3_650),
				)? {
					continue;
				}
				let account = tx.account_by_id(account_id)?;
				tx.emit_legacy(
					LegacyEventType::LotExpired,
					account.entity_type,
					&account.entity_id,
					json!({ "lot_id": lot_id, "stranded_available": available.to_string() }),
				)?;
				audited += 1;
			}
			Ok(audited)
		})
	}
}
