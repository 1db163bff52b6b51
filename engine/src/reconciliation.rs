//! Periodic conservation checks.
//!
//! Fourteen named invariants verified by set-level queries. The cheap
//! ones are also enforced upstream (database CHECKs, unique indexes,
//! application logic); the reconciliation-only ones exist nowhere else.
//! A run never raises on a violation: it produces a report, persists
//! it, and emits `ReconciliationDivergence` with the details.

use crate::{
	error::{Result, StoreResultExt},
	events::{EconomicEvent, EventType},
	store::{ts_to_db, LedgerStore, LedgerTx},
};
use chrono::{DateTime, Duration, Utc};
use credit_primitives::EntityType;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// How a pending reservation can lag its TTL before the liveness check
/// flags it: the expiry sweeper is expected to have swept by then.
const TERMINATION_GRACE: Duration = Duration::seconds(3_600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementClass {
	DbCheck,
	DbUnique,
	Application,
	ReconciliationOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
	pub name: &'static str,
	pub class: EnforcementClass,
	pub ok: bool,
	pub divergences: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
	pub ok: bool,
	pub checks: Vec<CheckOutcome>,
}

impl ReconciliationReport {
	pub fn divergences(&self) -> impl Iterator<Item = (&'static str, &str)> {
		self.checks.iter().flat_map(|check| {
			check.divergences.iter().map(|d| (check.name, d.as_str()))
		})
	}
}

pub struct Reconciler {
	store: Arc<LedgerStore>,
}

impl Reconciler {
	pub fn new(store: Arc<LedgerStore>) -> Self {
		Self { store }
	}

	/// Run every check, persist the report, and emit the completion (and
	/// divergence, if any) events.
	pub fn run(&self) -> Result<ReconciliationReport> {
		let started_at = self.store.clock().now();
		let checks = self.store.read("reconcile", run_checks)?;
		let finished_at = self.store.clock().now();
		let ok = checks.iter().all(|check| check.ok);
		let report = ReconciliationReport { started_at, finished_at, ok, checks };

		self.store.with_tx("reconcile_report", |tx| {
			let report_json = serde_json::to_string(&report)
				.unwrap_or_else(|_| "{}".to_string());
			tx.conn()
				.execute(
					"INSERT INTO reconciliation_runs (started_at, finished_at, ok, report)
					 VALUES (?1, ?2, ?3, ?4)",
					rusqlite::params![
						ts_to_db(report.started_at),
						ts_to_db(report.finished_at),
						report.ok,
						report_json
					],
				)
				.store_err(tx.op)?;

			tx.emit(&EconomicEvent::new(
				EventType::ReconciliationCompleted,
				EntityType::Protocol,
				"reconciler",
				json!({
					"ok": report.ok,
					"checks": report.checks.len(),
				}),
			))?;
			if !report.ok {
				let divergences: Vec<_> = report
					.divergences()
					.map(|(name, detail)| json!({ "check": name, "detail": detail }))
					.collect();
				warn!(count = divergences.len(), "reconciliation divergence");
				tx.emit(&EconomicEvent::new(
					EventType::ReconciliationDivergence,
					EntityType::Protocol,
					"reconciler",
					json!({ "divergences": divergences }),
				))?;
			}
			Ok(())
		})?;

		info!(ok = report.ok, checks = report.checks.len(), "reconciliation finished");
		Ok(report)
	}
}

fn run_checks(tx: &LedgerTx<'_>) -> Result<Vec<CheckOutcome>> {
	let grace_cutoff = ts_to_db(tx.now - TERMINATION_GRACE);

	let catalog: [(&'static str, EnforcementClass, String); 14] = [
		(
			"lot_conservation",
			EnforcementClass::DbCheck,
			"SELECT id FROM credit_lots
			 WHERE available + reserved + consumed != original".into(),
		),
		(
			"account_conservation",
			EnforcementClass::Application,
			"SELECT account_id FROM credit_lots
			 GROUP BY account_id
			 HAVING SUM(available + reserved + consumed) != SUM(original)".into(),
		),
		(
			"receivable_bound",
			EnforcementClass::DbCheck,
			"SELECT id FROM credit_debts
			 WHERE settled > amount OR settled < 0 OR amount <= 0".into(),
		),
		(
			"platform_ledger_sum",
			EnforcementClass::ReconciliationOnly,
			"SELECT a.id FROM credit_accounts a
			 WHERE COALESCE((SELECT SUM(e.amount) FROM credit_ledger e
			                 WHERE e.account_id = a.id
			                   AND e.entry_type IN ('deposit', 'grant')), 0)
			    != COALESCE((SELECT SUM(l.original) FROM credit_lots l
			                 WHERE l.account_id = a.id), 0)".into(),
		),
		(
			"budget_spend_consistency",
			EnforcementClass::ReconciliationOnly,
			"SELECT b.account_id FROM agent_budgets b
			 WHERE NOT EXISTS (SELECT 1 FROM credit_reservations r
			                   WHERE r.account_id = b.account_id AND r.status = 'pending')
			   AND b.current_spend != COALESCE(
			       (SELECT SUM(f.amount) FROM budget_finalizations f
			        WHERE f.account_id = b.account_id
			          AND f.finalized_at >= b.window_start), 0)".into(),
		),
		(
			"transfer_symmetry",
			EnforcementClass::Application,
			"SELECT e.correlation_id FROM economic_events e
			 WHERE e.event_type = 'peer_transfer_completed'
			   AND ((SELECT COUNT(*) FROM credit_lots l
			         WHERE l.source_type = 'transfer_in'
			           AND l.source_id = e.correlation_id) != 1
			     OR (SELECT l.original FROM credit_lots l
			         WHERE l.source_type = 'transfer_in'
			           AND l.source_id = e.correlation_id)
			        != CAST(json_extract(e.payload, '$.amount') AS INTEGER))".into(),
		),
		(
			"deposit_bridge_symmetry",
			EnforcementClass::DbUnique,
			"SELECT d.tx_hash FROM tba_deposits d
			 WHERE d.status = 'bridged'
			   AND (d.lot_id IS NULL
			     OR (SELECT COUNT(*) FROM credit_lots l
			         WHERE l.source_type = 'deposit' AND l.source_id = d.tx_hash) != 1
			     OR (SELECT l.original FROM credit_lots l WHERE l.id = d.lot_id)
			        != d.amount)".into(),
		),
		(
			"terminal_state_absorbing",
			EnforcementClass::Application,
			"SELECT id FROM credit_reservations
			 WHERE (status = 'finalized' AND (finalized_at IS NULL OR actual_cost IS NULL))
			    OR (status IN ('released', 'expired') AND finalized_at IS NOT NULL)".into(),
		),
		(
			"revenue_rule_exclusion",
			EnforcementClass::DbUnique,
			"SELECT param_key FROM system_config
			 WHERE status = 'active'
			 GROUP BY param_key, COALESCE(entity_type, '__global__')
			 HAVING COUNT(*) > 1".into(),
		),
		(
			"lot_monotonicity",
			EnforcementClass::Application,
			"SELECT id FROM credit_lots
			 WHERE original <= 0
			    OR consumed > original OR reserved > original OR available > original".into(),
		),
		(
			"finalize_atomicity",
			EnforcementClass::ReconciliationOnly,
			"SELECT r.id FROM credit_reservations r
			 WHERE (r.status = 'finalized' AND r.billing_mode != 'shadow'
			        AND (SELECT COUNT(*) FROM credit_ledger e
			             WHERE e.reservation_id = r.id AND e.entry_type = 'finalize') != 1)
			    OR (SELECT COUNT(*) FROM credit_ledger e
			        WHERE e.reservation_id = r.id
			          AND e.entry_type IN ('commons_contribution', 'revenue_share'))
			       NOT IN (0, 3)".into(),
		),
		(
			"reservation_termination",
			EnforcementClass::ReconciliationOnly,
			format!(
				"SELECT id FROM credit_reservations
				 WHERE status = 'pending' AND expires_at < {grace_cutoff}"
			),
		),
		(
			"treasury_adequacy",
			EnforcementClass::ReconciliationOnly,
			"SELECT a.entity_id FROM credit_accounts a
			 WHERE a.entity_type IN ('commons', 'community', 'foundation')
			   AND (SELECT COALESCE(SUM(e.amount), 0) FROM credit_ledger e
			        WHERE e.account_id = a.id) < 0
			 UNION ALL
			 SELECT r.id FROM credit_reservations r
			 WHERE (SELECT COUNT(*) FROM credit_ledger e
			        WHERE e.reservation_id = r.id
			          AND e.entry_type IN ('commons_contribution', 'revenue_share')) = 3
			   AND (SELECT SUM(e.amount) FROM credit_ledger e
			        WHERE e.reservation_id = r.id
			          AND e.entry_type IN ('commons_contribution', 'revenue_share'))
			      != -(SELECT e.amount FROM credit_ledger e
			           WHERE e.reservation_id = r.id AND e.entry_type = 'finalize')".into(),
		),
		(
			"shadow_tracking",
			EnforcementClass::ReconciliationOnly,
			"SELECT r.id FROM credit_reservations r
			 WHERE r.billing_mode = 'shadow'
			   AND ((SELECT COUNT(*) FROM reservation_lots rl
			         WHERE rl.reservation_id = r.id) > 0
			     OR (SELECT COUNT(*) FROM credit_ledger e
			         WHERE e.reservation_id = r.id
			           AND e.entry_type IN ('reserve', 'finalize', 'release')) > 0)".into(),
		),
	];

	catalog
		.into_iter()
		.map(|(name, class, sql)| {
			let divergences = offending_rows(tx, &sql)?;
			Ok(CheckOutcome { name, class, ok: divergences.is_empty(), divergences })
		})
		.collect()
}

/// Each check query selects one identifying column per offending row.
fn offending_rows(tx: &LedgerTx<'_>, sql: &str) -> Result<Vec<String>> {
	let mut stmt = tx.conn().prepare(sql).store_err(tx.op)?;
	let rows = stmt
		.query_map([], |row| row.get::<_, SqlValue>(0))
		.store_err(tx.op)?
		.collect::<rusqlite::Result<Vec<_>>>()
		.store_err(tx.op)?;
	Ok(rows
		.into_iter()
		.map(|value| match value {
			SqlValue::Null => "null".to_string(),
			SqlValue::Integer(v) => v.to_string(),
			SqlValue::Real(v) => v.to_string(),
			SqlValue::Text(v) => v,
			SqlValue::Blob(v) => hex::encode(v),
		})
		.collect())
}
