//! The relational ledger store.
//!
//! One sqlite database owns every table of the credit ledger. All
//! mutation paths run inside a single IMMEDIATE transaction taken
//! through [`LedgerStore::with_tx`]; the mutex around the connection
//! serializes writers in-process, the transaction makes the write
//! durable or absent. Row-level operations live on [`LedgerTx`] so a
//! service composes an arbitrary number of them into one atomic commit.

pub mod schema;

use crate::{
	clock::Clock,
	error::{LedgerError, Result, StoreResultExt},
};
use chrono::{DateTime, Utc};
use credit_primitives::{
	BillingMode, EntityType, EntryType, LotSourceType, MicroUsd, Pool, ReservationStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::{
	path::Path,
	str::FromStr,
	sync::{Arc, Mutex},
};

pub fn ts_to_db(t: DateTime<Utc>) -> i64 {
	t.timestamp_millis()
}

pub(crate) fn ts_from_db(idx: usize, v: i64) -> rusqlite::Result<DateTime<Utc>> {
	DateTime::from_timestamp_millis(v).ok_or_else(|| {
		rusqlite::Error::FromSqlConversionFailure(
			idx,
			rusqlite::types::Type::Integer,
			format!("timestamp out of range: {v}").into(),
		)
	})
}

pub fn micros_to_db(m: MicroUsd) -> i64 {
	m.micros() as i64
}

pub(crate) fn micros_from_db(idx: usize, v: i64) -> rusqlite::Result<MicroUsd> {
	u64::try_from(v)
		.ok()
		.and_then(|raw| MicroUsd::new(raw).ok())
		.ok_or_else(|| {
			rusqlite::Error::FromSqlConversionFailure(
				idx,
				rusqlite::types::Type::Integer,
				format!("micro amount out of domain: {v}").into(),
			)
		})
}

pub(crate) fn parse_discriminant<T: FromStr>(idx: usize, raw: String) -> rusqlite::Result<T> {
	raw.parse().map_err(|_| {
		rusqlite::Error::FromSqlConversionFailure(
			idx,
			rusqlite::types::Type::Text,
			format!("unknown discriminant: {raw}").into(),
		)
	})
}

/// Maps a UNIQUE/CHECK violation to the ledger's `Conflict`, everything
/// else to `Store`.
pub(crate) fn constraint_as_conflict(
	op: &'static str,
	detail: &str,
	err: rusqlite::Error,
) -> LedgerError {
	match &err {
		rusqlite::Error::SqliteFailure(e, _)
			if e.code == rusqlite::ErrorCode::ConstraintViolation =>
			LedgerError::conflict(op, detail.to_string()),
		_ => LedgerError::Store { op, source: err },
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
	pub id: i64,
	pub entity_type: EntityType,
	pub entity_id: String,
	pub version: i64,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
	pub id: String,
	pub account_id: i64,
	pub pool: Option<Pool>,
	pub original: MicroUsd,
	pub available: MicroUsd,
	pub reserved: MicroUsd,
	pub consumed: MicroUsd,
	pub source_type: LotSourceType,
	pub source_id: Option<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLot {
	pub id: String,
	pub account_id: i64,
	pub pool: Option<Pool>,
	pub amount: MicroUsd,
	pub source_type: LotSourceType,
	pub source_id: Option<String>,
	pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
	pub id: i64,
	pub account_id: i64,
	pub pool: Pool,
	pub lot_id: Option<String>,
	pub reservation_id: Option<String>,
	pub entry_seq: i64,
	pub entry_type: EntryType,
	/// Signed micro-USD: outflows negative, inflows positive.
	pub amount: i64,
	pub idempotency_key: Option<String>,
	pub pre_balance: Option<i64>,
	pub post_balance: Option<i64>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
	pub account_id: i64,
	pub pool: Pool,
	pub lot_id: Option<String>,
	pub reservation_id: Option<String>,
	pub entry_type: EntryType,
	pub amount: i64,
	pub idempotency_key: Option<String>,
	pub pre_balance: Option<i64>,
	pub post_balance: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
	pub id: String,
	pub account_id: i64,
	pub pool: Pool,
	pub total_reserved: MicroUsd,
	pub status: ReservationStatus,
	pub billing_mode: BillingMode,
	pub expires_at: DateTime<Utc>,
	pub idempotency_key: Option<String>,
	pub actual_cost: Option<MicroUsd>,
	pub created_at: DateTime<Utc>,
	pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationLot {
	pub reservation_id: String,
	pub lot_id: String,
	pub reserved: MicroUsd,
	pub consumed: MicroUsd,
	pub released: MicroUsd,
	pub alloc_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debt {
	pub id: i64,
	pub account_id: i64,
	pub pool: Pool,
	pub amount: MicroUsd,
	pub settled: MicroUsd,
	pub created_at: DateTime<Utc>,
}

/// Cached totals per (account, pool). `available` is signed: a soft-mode
/// overrun can push the cached figure below zero while lots stay
/// CHECK-protected and the uncovered part is carried as debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalanceSnapshot {
	pub available: i64,
	pub reserved: MicroUsd,
}

pub struct LedgerStore {
	conn: Mutex<Connection>,
	clock: Arc<dyn Clock>,
}

impl LedgerStore {
	pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
		let conn = Connection::open(path).store_err("store_open")?;
		// journal_mode reports the resulting mode as a row.
		conn.query_row("PRAGMA journal_mode = wal", [], |_row| Ok(()))
			.store_err("store_open")?;
		Self::init(conn, clock)
	}

	pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
		let conn = Connection::open_in_memory().store_err("store_open")?;
		Self::init(conn, clock)
	}

	fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
		conn.pragma_update(None, "foreign_keys", "on").store_err("store_open")?;
		schema::apply(&conn).store_err("store_open")?;
		Ok(Self { conn: Mutex::new(conn), clock })
	}

	pub fn clock(&self) -> Arc<dyn Clock> {
		self.clock.clone()
	}

	/// Run `f` inside one IMMEDIATE transaction. Everything `f` writes
	/// commits atomically; an error rolls the whole operation back,
	/// outbox rows included.
	pub fn with_tx<T>(
		&self,
		op: &'static str,
		f: impl FnOnce(&LedgerTx) -> Result<T>,
	) -> Result<T> {
		let mut conn = self.conn.lock().expect("store mutex poisoned");
		let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).store_err(op)?;
		let ledger_tx = LedgerTx { tx, now: self.clock.now(), op };
		let out = f(&ledger_tx)?;
		ledger_tx.tx.commit().store_err(op)?;
		Ok(out)
	}

	/// Read-only access; runs under a deferred transaction for a
	/// consistent snapshot.
	pub fn read<T>(&self, op: &'static str, f: impl FnOnce(&LedgerTx) -> Result<T>) -> Result<T> {
		let mut conn = self.conn.lock().expect("store mutex poisoned");
		let tx = conn.transaction().store_err(op)?;
		let ledger_tx = LedgerTx { tx, now: self.clock.now(), op };
		f(&ledger_tx)
	}
}

/// One open transaction against the ledger database.
pub struct LedgerTx<'a> {
	tx: Transaction<'a>,
	/// Clock reading taken when the transaction opened; every timestamp
	/// written inside the transaction agrees.
	pub now: DateTime<Utc>,
	pub op: &'static str,
}

impl LedgerTx<'_> {
	/// Raw connection escape hatch for reconciliation-style set queries.
	pub fn conn(&self) -> &Connection {
		&self.tx
	}

	// ==== accounts ====

	/// Idempotent on (entity_type, entity_id): returns the existing row
	/// when present.
	pub fn create_account(&self, entity_type: EntityType, entity_id: &str) -> Result<Account> {
		self.tx
			.execute(
				"INSERT INTO credit_accounts (entity_type, entity_id, version, created_at, updated_at)
				 VALUES (?1, ?2, 1, ?3, ?3)
				 ON CONFLICT (entity_type, entity_id) DO NOTHING",
				params![entity_type.to_string(), entity_id, ts_to_db(self.now)],
			)
			.store_err(self.op)?;
		self.account(entity_type, entity_id)?.ok_or_else(|| {
			LedgerError::not_found(self.op, format!("account {entity_type}/{entity_id}"))
		})
	}

	pub fn account(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<Account>> {
		self.tx
			.query_row(
				"SELECT id, entity_type, entity_id, version, created_at, updated_at
				 FROM credit_accounts WHERE entity_type = ?1 AND entity_id = ?2",
				params![entity_type.to_string(), entity_id],
				account_from_row,
			)
			.optional()
			.store_err(self.op)
	}

	pub fn account_by_id(&self, id: i64) -> Result<Account> {
		self.tx
			.query_row(
				"SELECT id, entity_type, entity_id, version, created_at, updated_at
				 FROM credit_accounts WHERE id = ?1",
				params![id],
				account_from_row,
			)
			.optional()
			.store_err(self.op)?
			.ok_or_else(|| LedgerError::not_found(self.op, format!("account #{id}")))
	}

	// ==== sequences ====

	/// Allocate the next `entry_seq` for (account, pool). Entirely
	/// table-driven: an initial insert hands out 1 leaving 2 behind, a
	/// subsequent hit increments and returns the prior value. Reading
	/// `MAX(entry_seq)` would race; this never does.
	pub fn allocate_sequence(&self, account_id: i64, pool: &Pool) -> Result<i64> {
		self.tx
			.query_row(
				"INSERT INTO credit_account_seq (account_id, pool_id, next_seq)
				 VALUES (?1, ?2, 2)
				 ON CONFLICT (account_id, pool_id) DO UPDATE SET next_seq = next_seq + 1
				 RETURNING next_seq - 1",
				params![account_id, pool.as_str()],
				|row| row.get(0),
			)
			.store_err(self.op)
	}

	// ==== lots ====

	pub fn insert_lot(&self, new: &NewLot) -> Result<Lot> {
		let amount = micros_to_db(new.amount);
		self.tx
			.execute(
				"INSERT INTO credit_lots
					(id, account_id, pool_id, original, available, reserved, consumed,
					 source_type, source_id, expires_at, created_at)
				 VALUES (?1, ?2, ?3, ?4, ?4, 0, 0, ?5, ?6, ?7, ?8)",
				params![
					new.id,
					new.account_id,
					new.pool.as_ref().map(|p| p.as_str().to_string()),
					amount,
					new.source_type.to_string(),
					new.source_id,
					new.expires_at.map(ts_to_db),
					ts_to_db(self.now),
				],
			)
			.map_err(|e| {
				constraint_as_conflict(
					self.op,
					&format!("lot source ({}, {:?}) already credited", new.source_type, new.source_id),
					e,
				)
			})?;
		self.lot(&new.id)
	}

	pub fn lot(&self, id: &str) -> Result<Lot> {
		self.tx
			.query_row(
				&format!("SELECT {LOT_COLUMNS} FROM credit_lots WHERE id = ?1"),
				params![id],
				lot_from_row,
			)
			.optional()
			.store_err(self.op)?
			.ok_or_else(|| LedgerError::not_found(self.op, format!("lot {id}")))
	}

	pub fn lot_by_source(
		&self,
		source_type: LotSourceType,
		source_id: &str,
	) -> Result<Option<Lot>> {
		self.tx
			.query_row(
				&format!(
					"SELECT {LOT_COLUMNS} FROM credit_lots
					 WHERE source_type = ?1 AND source_id = ?2"
				),
				params![source_type.to_string(), source_id],
				lot_from_row,
			)
			.optional()
			.store_err(self.op)
	}

	/// Unexpired lots with available balance, in allocation order:
	/// pool-bound before pool-general, expiring before non-expiring
	/// (earliest first), then age, then id.
	pub fn eligible_lots(&self, account_id: i64, pool: &Pool) -> Result<Vec<Lot>> {
		let mut stmt = self
			.tx
			.prepare(&format!(
				"SELECT {LOT_COLUMNS} FROM credit_lots
				 WHERE account_id = ?1
				   AND available > 0
				   AND (pool_id = ?2 OR pool_id IS NULL)
				   AND (expires_at IS NULL OR expires_at > ?3)
				 ORDER BY (pool_id IS NULL) ASC,
				          (expires_at IS NULL) ASC,
				          expires_at ASC,
				          created_at ASC,
				          id ASC"
			))
			.store_err(self.op)?;
		let lots = stmt
			.query_map(params![account_id, pool.as_str(), ts_to_db(self.now)], lot_from_row)
			.store_err(self.op)?
			.collect::<rusqlite::Result<Vec<_>>>()
			.store_err(self.op)?;
		Ok(lots)
	}

	/// Apply signed deltas to a lot's counters. The database CHECK keeps
	/// conservation and nonnegativity unrepresentable to violate.
	pub fn lot_delta(
		&self,
		lot_id: &str,
		d_available: i64,
		d_reserved: i64,
		d_consumed: i64,
	) -> Result<()> {
		let n = self
			.tx
			.execute(
				"UPDATE credit_lots
				 SET available = available + ?2,
				     reserved = reserved + ?3,
				     consumed = consumed + ?4
				 WHERE id = ?1",
				params![lot_id, d_available, d_reserved, d_consumed],
			)
			.store_err(self.op)?;
		if n == 0 {
			return Err(LedgerError::not_found(self.op, format!("lot {lot_id}")));
		}
		Ok(())
	}

	// ==== ledger entries ====

	/// Append one ledger entry, allocating its `entry_seq` from the
	/// sequence table within this transaction.
	pub fn insert_entry(&self, new: &NewEntry) -> Result<LedgerEntry> {
		let seq = self.allocate_sequence(new.account_id, &new.pool)?;
		self.tx
			.execute(
				"INSERT INTO credit_ledger
					(account_id, pool_id, lot_id, reservation_id, entry_seq, entry_type,
					 amount, idempotency_key, pre_balance, post_balance, created_at)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
				params![
					new.account_id,
					new.pool.as_str(),
					new.lot_id,
					new.reservation_id,
					seq,
					new.entry_type.to_string(),
					new.amount,
					new.idempotency_key,
					new.pre_balance,
					new.post_balance,
					ts_to_db(self.now),
				],
			)
			.map_err(|e| {
				constraint_as_conflict(
					self.op,
					&format!("ledger idempotency key {:?} already used", new.idempotency_key),
					e,
				)
			})?;
		let id = self.tx.last_insert_rowid();
		self.entry_by_id(id)
	}

	fn entry_by_id(&self, id: i64) -> Result<LedgerEntry> {
		self.tx
			.query_row(
				&format!("SELECT {ENTRY_COLUMNS} FROM credit_ledger WHERE id = ?1"),
				params![id],
				entry_from_row,
			)
			.store_err(self.op)
	}

	pub fn entry_by_idempotency(&self, key: &str) -> Result<Option<LedgerEntry>> {
		self.tx
			.query_row(
				&format!("SELECT {ENTRY_COLUMNS} FROM credit_ledger WHERE idempotency_key = ?1"),
				params![key],
				entry_from_row,
			)
			.optional()
			.store_err(self.op)
	}

	pub fn entries(&self, account_id: i64, pool: &Pool) -> Result<Vec<LedgerEntry>> {
		let mut stmt = self
			.tx
			.prepare(&format!(
				"SELECT {ENTRY_COLUMNS} FROM credit_ledger
				 WHERE account_id = ?1 AND pool_id = ?2
				 ORDER BY entry_seq ASC"
			))
			.store_err(self.op)?;
		let entries = stmt
			.query_map(params![account_id, pool.as_str()], entry_from_row)
			.store_err(self.op)?
			.collect::<rusqlite::Result<Vec<_>>>()
			.store_err(self.op)?;
		Ok(entries)
	}

	// ==== balance cache ====

	/// Fold signed deltas into the cached (account, pool) totals.
	pub fn balance_delta(
		&self,
		account_id: i64,
		pool: &Pool,
		d_available: i64,
		d_reserved: i64,
	) -> Result<()> {
		self.tx
			.execute(
				"INSERT INTO credit_balances (account_id, pool_id, available, reserved, updated_at)
				 VALUES (?1, ?2, ?3, ?4, ?5)
				 ON CONFLICT (account_id, pool_id) DO UPDATE SET
					available = available + ?3,
					reserved = reserved + ?4,
					updated_at = ?5",
				params![account_id, pool.as_str(), d_available, d_reserved, ts_to_db(self.now)],
			)
			.store_err(self.op)?;
		Ok(())
	}

	/// Cached totals, falling back to a SUM over lots (minus outstanding
	/// debts) when the cache has no row. The cache is never authoritative.
	pub fn balance(&self, account_id: i64, pool: &Pool) -> Result<BalanceSnapshot> {
		let cached = self
			.tx
			.query_row(
				"SELECT available, reserved FROM credit_balances
				 WHERE account_id = ?1 AND pool_id = ?2",
				params![account_id, pool.as_str()],
				|row| {
					Ok(BalanceSnapshot {
						available: row.get(0)?,
						reserved: micros_from_db(1, row.get(1)?)?,
					})
				},
			)
			.optional()
			.store_err(self.op)?;
		match cached {
			Some(snapshot) => Ok(snapshot),
			None => self.balance_from_lots(account_id, pool),
		}
	}

	/// Authoritative totals recomputed from lots and debts.
	pub fn balance_from_lots(&self, account_id: i64, pool: &Pool) -> Result<BalanceSnapshot> {
		let pool_clause = if pool.is_general() {
			"(pool_id IS NULL OR pool_id = ?2)"
		} else {
			"pool_id = ?2"
		};
		let (available, reserved): (i64, i64) = self
			.tx
			.query_row(
				&format!(
					"SELECT COALESCE(SUM(available), 0), COALESCE(SUM(reserved), 0)
					 FROM credit_lots WHERE account_id = ?1 AND {pool_clause}"
				),
				params![account_id, pool.as_str()],
				|row| Ok((row.get(0)?, row.get(1)?)),
			)
			.store_err(self.op)?;
		let debt: i64 = self
			.tx
			.query_row(
				"SELECT COALESCE(SUM(amount - settled), 0) FROM credit_debts
				 WHERE account_id = ?1 AND pool_id = ?2",
				params![account_id, pool.as_str()],
				|row| row.get(0),
			)
			.store_err(self.op)?;
		Ok(BalanceSnapshot {
			available: available - debt,
			reserved: micros_from_db(1, reserved).store_err(self.op)?,
		})
	}

	// ==== reservations ====

	pub fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
		self.tx
			.execute(
				"INSERT INTO credit_reservations
					(id, account_id, pool_id, total_reserved, status, billing_mode,
					 expires_at, idempotency_key, actual_cost, created_at, finalized_at)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
				params![
					reservation.id,
					reservation.account_id,
					reservation.pool.as_str(),
					micros_to_db(reservation.total_reserved),
					reservation.status.to_string(),
					reservation.billing_mode.to_string(),
					ts_to_db(reservation.expires_at),
					reservation.idempotency_key,
					reservation.actual_cost.map(micros_to_db),
					ts_to_db(reservation.created_at),
					reservation.finalized_at.map(ts_to_db),
				],
			)
			.map_err(|e| {
				constraint_as_conflict(
					self.op,
					&format!(
						"reservation idempotency key {:?} already used",
						reservation.idempotency_key
					),
					e,
				)
			})?;
		Ok(())
	}

	pub fn reservation(&self, id: &str) -> Result<Reservation> {
		self.tx
			.query_row(
				&format!("SELECT {RESERVATION_COLUMNS} FROM credit_reservations WHERE id = ?1"),
				params![id],
				reservation_from_row,
			)
			.optional()
			.store_err(self.op)?
			.ok_or_else(|| LedgerError::not_found(self.op, format!("reservation {id}")))
	}

	pub fn reservation_by_idempotency(&self, key: &str) -> Result<Option<Reservation>> {
		self.tx
			.query_row(
				&format!(
					"SELECT {RESERVATION_COLUMNS} FROM credit_reservations
					 WHERE idempotency_key = ?1"
				),
				params![key],
				reservation_from_row,
			)
			.optional()
			.store_err(self.op)
	}

	/// Guarded status transition: the UPDATE only applies while the row
	/// still holds `from`, so a raced transition surfaces as
	/// `InvalidState` instead of silently double-applying.
	pub fn transition_reservation(
		&self,
		id: &str,
		from: ReservationStatus,
		to: ReservationStatus,
		actual_cost: Option<MicroUsd>,
		finalized_at: Option<DateTime<Utc>>,
	) -> Result<()> {
		let n = self
			.tx
			.execute(
				"UPDATE credit_reservations
				 SET status = ?3,
				     actual_cost = COALESCE(?4, actual_cost),
				     finalized_at = COALESCE(?5, finalized_at)
				 WHERE id = ?1 AND status = ?2",
				params![
					id,
					from.to_string(),
					to.to_string(),
					actual_cost.map(micros_to_db),
					finalized_at.map(ts_to_db),
				],
			)
			.store_err(self.op)?;
		if n == 0 {
			return Err(LedgerError::invalid_state(
				self.op,
				format!("reservation {id} is not {from}"),
			));
		}
		Ok(())
	}

	pub fn insert_reservation_lot(
		&self,
		reservation_id: &str,
		lot_id: &str,
		reserved: MicroUsd,
		alloc_order: i64,
	) -> Result<()> {
		self.tx
			.execute(
				"INSERT INTO reservation_lots (reservation_id, lot_id, reserved, alloc_order)
				 VALUES (?1, ?2, ?3, ?4)",
				params![reservation_id, lot_id, micros_to_db(reserved), alloc_order],
			)
			.store_err(self.op)?;
		Ok(())
	}

	pub fn reservation_lots(&self, reservation_id: &str) -> Result<Vec<ReservationLot>> {
		let mut stmt = self
			.tx
			.prepare(
				"SELECT reservation_id, lot_id, reserved, consumed, released, alloc_order
				 FROM reservation_lots WHERE reservation_id = ?1
				 ORDER BY alloc_order ASC",
			)
			.store_err(self.op)?;
		let rows = stmt
			.query_map(params![reservation_id], |row| {
				Ok(ReservationLot {
					reservation_id: row.get(0)?,
					lot_id: row.get(1)?,
					reserved: micros_from_db(2, row.get(2)?)?,
					consumed: micros_from_db(3, row.get(3)?)?,
					released: micros_from_db(4, row.get(4)?)?,
					alloc_order: row.get(5)?,
				})
			})
			.store_err(self.op)?
			.collect::<rusqlite::Result<Vec<_>>>()
			.store_err(self.op)?;
		Ok(rows)
	}

	pub fn record_reservation_lot_outcome(
		&self,
		reservation_id: &str,
		lot_id: &str,
		consumed: MicroUsd,
		released: MicroUsd,
	) -> Result<()> {
		self.tx
			.execute(
				"UPDATE reservation_lots
				 SET consumed = consumed + ?3, released = released + ?4
				 WHERE reservation_id = ?1 AND lot_id = ?2",
				params![reservation_id, lot_id, micros_to_db(consumed), micros_to_db(released)],
			)
			.store_err(self.op)?;
		Ok(())
	}

	pub fn pending_expired_reservations(&self, limit: usize) -> Result<Vec<Reservation>> {
		let mut stmt = self
			.tx
			.prepare(&format!(
				"SELECT {RESERVATION_COLUMNS} FROM credit_reservations
				 WHERE status = 'pending' AND expires_at < ?1
				 ORDER BY expires_at ASC LIMIT ?2"
			))
			.store_err(self.op)?;
		let rows = stmt
			.query_map(params![ts_to_db(self.now), limit as i64], reservation_from_row)
			.store_err(self.op)?
			.collect::<rusqlite::Result<Vec<_>>>()
			.store_err(self.op)?;
		Ok(rows)
	}

	// ==== debts ====

	pub fn insert_debt(&self, account_id: i64, pool: &Pool, amount: MicroUsd) -> Result<i64> {
		self.tx
			.execute(
				"INSERT INTO credit_debts (account_id, pool_id, amount, settled, created_at)
				 VALUES (?1, ?2, ?3, 0, ?4)",
				params![account_id, pool.as_str(), micros_to_db(amount), ts_to_db(self.now)],
			)
			.store_err(self.op)?;
		Ok(self.tx.last_insert_rowid())
	}

	/// Unsettled debts, oldest first.
	pub fn outstanding_debts(&self, account_id: i64, pool: &Pool) -> Result<Vec<Debt>> {
		let mut stmt = self
			.tx
			.prepare(
				"SELECT id, account_id, pool_id, amount, settled, created_at
				 FROM credit_debts
				 WHERE account_id = ?1 AND pool_id = ?2 AND settled < amount
				 ORDER BY created_at ASC, id ASC",
			)
			.store_err(self.op)?;
		let rows = stmt
			.query_map(params![account_id, pool.as_str()], |row| {
				Ok(Debt {
					id: row.get(0)?,
					account_id: row.get(1)?,
					pool: Pool::named(row.get::<_, String>(2)?),
					amount: micros_from_db(3, row.get(3)?)?,
					settled: micros_from_db(4, row.get(4)?)?,
					created_at: ts_from_db(5, row.get(5)?)?,
				})
			})
			.store_err(self.op)?
			.collect::<rusqlite::Result<Vec<_>>>()
			.store_err(self.op)?;
		Ok(rows)
	}

	pub fn settle_debt(&self, debt_id: i64, amount: MicroUsd) -> Result<()> {
		self.tx
			.execute(
				"UPDATE credit_debts SET settled = settled + ?2 WHERE id = ?1",
				params![debt_id, micros_to_db(amount)],
			)
			.store_err(self.op)?;
		Ok(())
	}

	// ==== generic idempotency guard ====

	/// Claim `(scope, key)` until `expires_at`. Returns false when the
	/// key is already held.
	pub fn claim_idempotency(
		&self,
		scope: &str,
		key: &str,
		expires_at: DateTime<Utc>,
	) -> Result<bool> {
		let n = self
			.tx
			.execute(
				"INSERT OR IGNORE INTO billing_idempotency_keys (scope, key, expires_at)
				 VALUES (?1, ?2, ?3)",
				params![scope, key, ts_to_db(expires_at)],
			)
			.store_err(self.op)?;
		Ok(n == 1)
	}

	pub fn purge_expired_idempotency(&self) -> Result<usize> {
		self.tx
			.execute(
				"DELETE FROM billing_idempotency_keys WHERE expires_at < ?1",
				params![ts_to_db(self.now)],
			)
			.store_err(self.op)
	}
}

const LOT_COLUMNS: &str = "id, account_id, pool_id, original, available, reserved, consumed, \
	source_type, source_id, expires_at, created_at";

fn lot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lot> {
	Ok(Lot {
		id: row.get(0)?,
		account_id: row.get(1)?,
		pool: row.get::<_, Option<String>>(2)?.map(Pool::named),
		original: micros_from_db(3, row.get(3)?)?,
		available: micros_from_db(4, row.get(4)?)?,
		reserved: micros_from_db(5, row.get(5)?)?,
		consumed: micros_from_db(6, row.get(6)?)?,
		source_type: parse_discriminant(7, row.get(7)?)?,
		source_id: row.get(8)?,
		expires_at: row.get::<_, Option<i64>>(9)?.map(|v| ts_from_db(9, v)).transpose()?,
		created_at: ts_from_db(10, row.get(10)?)?,
	})
}

const ENTRY_COLUMNS: &str = "id, account_id, pool_id, lot_id, reservation_id, entry_seq, \
	entry_type, amount, idempotency_key, pre_balance, post_balance, created_at";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
	Ok(LedgerEntry {
		id: row.get(0)?,
		account_id: row.get(1)?,
		pool: Pool::named(row.get::<_, String>(2)?),
		lot_id: row.get(3)?,
		reservation_id: row.get(4)?,
		entry_seq: row.get(5)?,
		entry_type: parse_discriminant(6, row.get(6)?)?,
		amount: row.get(7)?,
		idempotency_key: row.get(8)?,
		pre_balance: row.get(9)?,
		post_balance: row.get(10)?,
		created_at: ts_from_db(11, row.get(11)?)?,
	})
}

const RESERVATION_COLUMNS: &str = "id, account_id, pool_id, total_reserved, status, \
	billing_mode, expires_at, idempotency_key, actual_cost, created_at, finalized_at";

fn reservation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reservation> {
	Ok(Reservation {
		id: row.get(0)?,
		account_id: row.get(1)?,
		pool: Pool::named(row.get::<_, String>(2)?),
		total_reserved: micros_from_db(3, row.get(3)?)?,
		status: parse_discriminant(4, row.get(4)?)?,
		billing_mode: parse_discriminant(5, row.get(5)?)?,
		expires_at: ts_from_db(6, row.get(6)?)?,
		idempotency_key: row.get(7)?,
		actual_cost: row.get::<_, Option<i64>>(8)?.map(|v| micros_from_db(8, v)).transpose()?,
		created_at: ts_from_db(9, row.get(9)?)?,
		finalized_at: row.get::<_, Option<i64>>(10)?.map(|v| ts_from_db(10, v)).transpose()?,
	})
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
	Ok(Account {
		id: row.get(0)?,
		entity_type: parse_discriminant(1, row.get(1)?)?,
		entity_id: row.get(2)?,
		version: row.get(3)?,
		created_at: ts_from_db(4, row.get(4)?)?,
		updated_at: ts_from_db(5, row.get(5)?)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::{Clock, TestClock};
	use chrono::TimeZone;

	fn test_store() -> (LedgerStore, TestClock) {
		let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
		let store = LedgerStore::open_in_memory(Arc::new(clock.clone())).unwrap();
		(store, clock)
	}

	fn usd(micros: u64) -> MicroUsd {
		MicroUsd::new(micros).unwrap()
	}

	#[test]
	fn create_account_is_idempotent() {
		let (store, _) = test_store();
		let (first, second) = store
			.with_tx("test", |tx| {
				let first = tx.create_account(EntityType::Person, "p1")?;
				let second = tx.create_account(EntityType::Person, "p1")?;
				Ok((first, second))
			})
			.unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn sequences_are_gapless_from_one() {
		let (store, _) = test_store();
		let seqs: Vec<i64> = store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Person, "p1")?;
				(0..5).map(|_| tx.allocate_sequence(account.id, &Pool::general())).collect()
			})
			.unwrap();
		assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
	}

	#[test]
	fn sequences_are_gapless_under_concurrent_writers() {
		let (store, _) = test_store();
		let account_id = store
			.with_tx("test", |tx| Ok(tx.create_account(EntityType::Person, "p1")?.id))
			.unwrap();
		let store = Arc::new(store);

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let store = store.clone();
				std::thread::spawn(move || {
					(0..25)
						.map(|_| {
							store
								.with_tx("test", |tx| {
									tx.allocate_sequence(account_id, &Pool::general())
								})
								.unwrap()
						})
						.collect::<Vec<i64>>()
				})
			})
			.collect();

		let mut all: Vec<i64> =
			handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
		all.sort_unstable();
		assert_eq!(all, (1..=200).collect::<Vec<i64>>());
	}

	#[test]
	fn duplicate_lot_source_is_a_conflict() {
		let (store, _) = test_store();
		let err = store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Agent, "a1")?;
				let lot = |id: &str| NewLot {
					id: id.to_string(),
					account_id: account.id,
					pool: None,
					amount: usd(1_000),
					source_type: LotSourceType::Deposit,
					source_id: Some("tx_abc".to_string()),
					expires_at: None,
				};
				tx.insert_lot(&lot("lot-1"))?;
				tx.insert_lot(&lot("lot-2")).map(|_| ())
			})
			.unwrap_err();
		assert!(matches!(err, LedgerError::Conflict { .. }));
	}

	#[test]
	fn balance_falls_back_to_lot_sums_without_a_cache_row() {
		let (store, _) = test_store();
		let snapshot = store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Person, "p1")?;
				tx.insert_lot(&NewLot {
					id: "lot-1".to_string(),
					account_id: account.id,
					pool: None,
					amount: usd(250_000),
					source_type: LotSourceType::Grant,
					source_id: None,
					expires_at: None,
				})?;
				tx.balance(account.id, &Pool::general())
			})
			.unwrap();
		assert_eq!(snapshot.available, 250_000);
		assert_eq!(snapshot.reserved, MicroUsd::ZERO);
	}

	#[test]
	fn failed_transactions_leave_nothing_behind() {
		let (store, _) = test_store();
		let result: Result<()> = store.with_tx("test", |tx| {
			tx.create_account(EntityType::Person, "p1")?;
			Err(LedgerError::invalid_state("test", "forced rollback"))
		});
		assert!(result.is_err());

		let account = store
			.read("test", |tx| tx.account(EntityType::Person, "p1"))
			.unwrap();
		assert!(account.is_none());
	}

	#[test]
	fn guarded_reservation_transition_rejects_stale_from() {
		let (store, clock) = test_store();
		store
			.with_tx("test", |tx| {
				let account = tx.create_account(EntityType::Agent, "a1")?;
				tx.insert_reservation(&Reservation {
					id: "r1".to_string(),
					account_id: account.id,
					pool: Pool::general(),
					total_reserved: usd(100),
					status: ReservationStatus::Pending,
					billing_mode: BillingMode::Live,
					expires_at: clock.now() + chrono::Duration::seconds(300),
					idempotency_key: None,
					actual_cost: None,
					created_at: clock.now(),
					finalized_at: None,
				})?;
				tx.transition_reservation(
					"r1",
					ReservationStatus::Pending,
					ReservationStatus::Released,
					None,
					None,
				)
			})
			.unwrap();

		let err = store
			.with_tx("test", |tx| {
				tx.transition_reservation(
					"r1",
					ReservationStatus::Pending,
					ReservationStatus::Finalized,
					None,
					None,
				)
			})
			.unwrap_err();
		assert!(matches!(err, LedgerError::InvalidState { .. }));
	}
}
