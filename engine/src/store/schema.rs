//! Executable schema for the ledger store.
//!
//! The database enforces the cheap invariants itself: per-lot
//! conservation is a CHECK, double-credits and idempotency replays are
//! UNIQUE indexes, single-active governance rows are a partial unique
//! index over a COALESCEd entity type. Timestamps are integer unix
//! milliseconds; money is integer micro-USD.

use rusqlite::Connection;

/// Schema version written to `PRAGMA user_version`. Bump together with
/// a migration arm in [`apply`] on any change to the persisted layout.
pub const LATEST_SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credit_accounts (
	id INTEGER PRIMARY KEY,
	entity_type TEXT NOT NULL,
	entity_id TEXT NOT NULL,
	version INTEGER NOT NULL DEFAULT 1,
	created_at INTEGER NOT NULL,
	updated_at INTEGER NOT NULL,
	UNIQUE (entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS credit_lots (
	id TEXT PRIMARY KEY,
	account_id INTEGER NOT NULL REFERENCES credit_accounts (id),
	pool_id TEXT,
	original INTEGER NOT NULL CHECK (original >= 0),
	available INTEGER NOT NULL CHECK (available >= 0),
	reserved INTEGER NOT NULL CHECK (reserved >= 0),
	consumed INTEGER NOT NULL CHECK (consumed >= 0),
	source_type TEXT NOT NULL,
	source_id TEXT,
	expires_at INTEGER,
	created_at INTEGER NOT NULL,
	CHECK (available + reserved + consumed = original)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_lots_source
	ON credit_lots (source_type, source_id) WHERE source_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_credit_lots_fifo
	ON credit_lots (account_id, pool_id, expires_at) WHERE available > 0;

CREATE TABLE IF NOT EXISTS credit_balances (
	account_id INTEGER NOT NULL REFERENCES credit_accounts (id),
	pool_id TEXT NOT NULL,
	available INTEGER NOT NULL,
	reserved INTEGER NOT NULL CHECK (reserved >= 0),
	updated_at INTEGER NOT NULL,
	PRIMARY KEY (account_id, pool_id)
);

CREATE TABLE IF NOT EXISTS credit_account_seq (
	account_id INTEGER NOT NULL,
	pool_id TEXT NOT NULL,
	next_seq INTEGER NOT NULL,
	PRIMARY KEY (account_id, pool_id)
);

CREATE TABLE IF NOT EXISTS credit_ledger (
	id INTEGER PRIMARY KEY,
	account_id INTEGER NOT NULL REFERENCES credit_accounts (id),
	pool_id TEXT NOT NULL,
	lot_id TEXT REFERENCES credit_lots (id),
	reservation_id TEXT,
	entry_seq INTEGER NOT NULL,
	entry_type TEXT NOT NULL,
	amount INTEGER NOT NULL,
	idempotency_key TEXT UNIQUE,
	pre_balance INTEGER,
	post_balance INTEGER,
	created_at INTEGER NOT NULL,
	UNIQUE (account_id, pool_id, entry_seq)
);

CREATE TABLE IF NOT EXISTS credit_reservations (
	id TEXT PRIMARY KEY,
	account_id INTEGER NOT NULL REFERENCES credit_accounts (id),
	pool_id TEXT NOT NULL,
	total_reserved INTEGER NOT NULL CHECK (total_reserved > 0),
	status TEXT NOT NULL CHECK (status IN ('pending', 'finalized', 'released', 'expired')),
	billing_mode TEXT NOT NULL CHECK (billing_mode IN ('shadow', 'soft', 'live')),
	expires_at INTEGER NOT NULL,
	idempotency_key TEXT UNIQUE,
	actual_cost INTEGER,
	created_at INTEGER NOT NULL,
	finalized_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_credit_reservations_pending
	ON credit_reservations (expires_at) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS reservation_lots (
	reservation_id TEXT NOT NULL REFERENCES credit_reservations (id),
	lot_id TEXT NOT NULL REFERENCES credit_lots (id),
	reserved INTEGER NOT NULL CHECK (reserved >= 0),
	consumed INTEGER NOT NULL DEFAULT 0 CHECK (consumed >= 0),
	released INTEGER NOT NULL DEFAULT 0 CHECK (released >= 0),
	alloc_order INTEGER NOT NULL,
	PRIMARY KEY (reservation_id, lot_id)
);

CREATE TABLE IF NOT EXISTS credit_debts (
	id INTEGER PRIMARY KEY,
	account_id INTEGER NOT NULL REFERENCES credit_accounts (id),
	pool_id TEXT NOT NULL,
	amount INTEGER NOT NULL CHECK (amount > 0),
	settled INTEGER NOT NULL DEFAULT 0 CHECK (settled >= 0 AND settled <= amount),
	created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS billing_idempotency_keys (
	scope TEXT NOT NULL,
	key TEXT NOT NULL,
	expires_at INTEGER NOT NULL,
	PRIMARY KEY (scope, key)
);

CREATE TABLE IF NOT EXISTS economic_events (
	id INTEGER PRIMARY KEY,
	event_type TEXT NOT NULL,
	entity_type TEXT NOT NULL,
	entity_id TEXT NOT NULL,
	correlation_id TEXT,
	idempotency_key TEXT,
	config_version INTEGER,
	payload TEXT NOT NULL,
	created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_economic_events_entity
	ON economic_events (entity_type, entity_id, id);

CREATE TABLE IF NOT EXISTS legacy_audit_log (
	id INTEGER PRIMARY KEY,
	event_type TEXT NOT NULL,
	entity_type TEXT NOT NULL,
	entity_id TEXT NOT NULL,
	payload TEXT NOT NULL,
	created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS system_config (
	id INTEGER PRIMARY KEY,
	param_key TEXT NOT NULL,
	entity_type TEXT,
	value_json TEXT NOT NULL,
	config_version INTEGER NOT NULL,
	status TEXT NOT NULL CHECK (status IN
		('draft', 'pending_approval', 'cooling_down', 'active', 'superseded', 'rejected')),
	approval_count INTEGER NOT NULL DEFAULT 0,
	required_approvals INTEGER NOT NULL,
	cooldown_ends_at INTEGER,
	activated_at INTEGER,
	created_at INTEGER NOT NULL,
	updated_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_system_config_single_active
	ON system_config (param_key, COALESCE(entity_type, '__global__')) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS system_config_audit (
	id INTEGER PRIMARY KEY,
	config_id INTEGER NOT NULL REFERENCES system_config (id),
	param_key TEXT NOT NULL,
	from_status TEXT,
	to_status TEXT NOT NULL,
	actor TEXT NOT NULL,
	created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS system_config_version_seq (
	param_key TEXT PRIMARY KEY,
	next_version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_budgets (
	account_id INTEGER PRIMARY KEY REFERENCES credit_accounts (id),
	daily_cap INTEGER NOT NULL CHECK (daily_cap > 0),
	current_spend INTEGER NOT NULL DEFAULT 0 CHECK (current_spend >= 0),
	window_start INTEGER NOT NULL,
	window_duration_seconds INTEGER NOT NULL DEFAULT 86400,
	circuit_state TEXT NOT NULL CHECK (circuit_state IN ('closed', 'warning', 'open')),
	updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS budget_finalizations (
	account_id INTEGER NOT NULL,
	reservation_id TEXT NOT NULL,
	amount INTEGER NOT NULL CHECK (amount >= 0),
	finalized_at INTEGER NOT NULL,
	PRIMARY KEY (account_id, reservation_id)
);

CREATE TABLE IF NOT EXISTS tba_deposits (
	id INTEGER PRIMARY KEY,
	account_id INTEGER NOT NULL REFERENCES credit_accounts (id),
	tx_hash TEXT NOT NULL UNIQUE,
	amount INTEGER NOT NULL CHECK (amount > 0),
	status TEXT NOT NULL CHECK (status IN ('detected', 'confirmed', 'bridged', 'failed')),
	lot_id TEXT REFERENCES credit_lots (id),
	detected_at INTEGER NOT NULL,
	bridged_at INTEGER
);

CREATE TABLE IF NOT EXISTS counter_totals (
	key TEXT PRIMARY KEY,
	total INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reconciliation_runs (
	id INTEGER PRIMARY KEY,
	started_at INTEGER NOT NULL,
	finished_at INTEGER NOT NULL,
	ok INTEGER NOT NULL,
	report TEXT NOT NULL
);
";

/// Create or upgrade the schema in place.
pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
	let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

	if version > LATEST_SCHEMA_VERSION {
		return Err(rusqlite::Error::SqliteFailure(
			rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISMATCH),
			Some(format!(
				"database schema version {version} is ahead of this engine ({LATEST_SCHEMA_VERSION})"
			)),
		));
	}

	conn.execute_batch(SCHEMA)?;
	conn.pragma_update(None, "user_version", LATEST_SCHEMA_VERSION)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn schema_applies_and_is_idempotent() {
		let conn = Connection::open_in_memory().unwrap();
		apply(&conn).unwrap();
		apply(&conn).unwrap();

		let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
		assert_eq!(version, LATEST_SCHEMA_VERSION);
	}

	#[test]
	fn lot_conservation_is_a_database_check() {
		let conn = Connection::open_in_memory().unwrap();
		apply(&conn).unwrap();

		conn.execute(
			"INSERT INTO credit_accounts (entity_type, entity_id, created_at, updated_at)
			 VALUES ('person', 'p1', 0, 0)",
			[],
		)
		.unwrap();

		// available + reserved + consumed != original must be unrepresentable.
		let violation = conn.execute(
			"INSERT INTO credit_lots
				(id, account_id, pool_id, original, available, reserved, consumed, source_type, created_at)
			 VALUES ('lot', 1, NULL, 100, 50, 0, 0, 'grant', 0)",
			[],
		);
		assert!(violation.is_err());
	}

	#[test]
	fn only_one_active_config_row_per_key_is_representable() {
		let conn = Connection::open_in_memory().unwrap();
		apply(&conn).unwrap();

		let insert = "INSERT INTO system_config
			(param_key, entity_type, value_json, config_version, status, required_approvals, created_at, updated_at)
			VALUES (?1, ?2, '1', ?3, 'active', 2, 0, 0)";
		conn.execute(insert, rusqlite::params!["k", Option::<String>::None, 1]).unwrap();
		assert!(conn.execute(insert, rusqlite::params!["k", Option::<String>::None, 2]).is_err());
		// A different entity override may be active at the same time.
		conn.execute(insert, rusqlite::params!["k", Some("agent"), 3]).unwrap();
	}
}
