//! Persistent relational counter backend.
//!
//! One UPSERT per increment, returning the new total; survives process
//! restarts. Usually pointed at the ledger database file, where the
//! `counter_totals` table already exists, but creates it when handed a
//! fresh path.

use super::CounterBackend;
use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Mutex};

pub struct SqliteCounter {
	conn: Mutex<Connection>,
}

impl SqliteCounter {
	pub fn open(path: &Path) -> anyhow::Result<Self> {
		let conn = Connection::open(path)
			.with_context(|| format!("failed to open counter database at {}", path.display()))?;
		Self::init(conn)
	}

	pub fn open_in_memory() -> anyhow::Result<Self> {
		Self::init(Connection::open_in_memory()?)
	}

	fn init(conn: Connection) -> anyhow::Result<Self> {
		conn.execute(
			"CREATE TABLE IF NOT EXISTS counter_totals (key TEXT PRIMARY KEY, total INTEGER NOT NULL)",
			[],
		)
		.context("failed to create counter_totals")?;
		Ok(Self { conn: Mutex::new(conn) })
	}
}

#[async_trait]
impl CounterBackend for SqliteCounter {
	fn name(&self) -> &'static str {
		"sqlite"
	}

	async fn increment(&self, key: &str, amount: i64) -> anyhow::Result<i64> {
		let conn = self.conn.lock().expect("counter mutex poisoned");
		let total = conn
			.query_row(
				"INSERT INTO counter_totals (key, total) VALUES (?1, ?2)
				 ON CONFLICT (key) DO UPDATE SET total = total + ?2
				 RETURNING total",
				params![key, amount],
				|row| row.get(0),
			)
			.context("counter upsert failed")?;
		Ok(total)
	}

	async fn get(&self, key: &str) -> anyhow::Result<Option<i64>> {
		let conn = self.conn.lock().expect("counter mutex poisoned");
		conn.query_row("SELECT total FROM counter_totals WHERE key = ?1", params![key], |row| {
			row.get(0)
		})
		.optional()
		.context("counter read failed")
	}

	async fn reset(&self, key: &str) -> anyhow::Result<()> {
		let conn = self.conn.lock().expect("counter mutex poisoned");
		conn.execute("DELETE FROM counter_totals WHERE key = ?1", params![key])
			.context("counter reset failed")?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn upsert_returns_the_running_total() {
		let counter = SqliteCounter::open_in_memory().unwrap();
		assert_eq!(counter.increment("k", 5).await.unwrap(), 5);
		assert_eq!(counter.increment("k", 7).await.unwrap(), 12);
		assert_eq!(counter.get("k").await.unwrap(), Some(12));
		assert_eq!(counter.get("other").await.unwrap(), None);

		counter.reset("k").await.unwrap();
		assert_eq!(counter.get("k").await.unwrap(), None);
	}

	#[tokio::test]
	async fn totals_survive_reopening_the_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("counters.db");
		{
			let counter = SqliteCounter::open(&path).unwrap();
			counter.increment("k", 9).await.unwrap();
		}
		let counter = SqliteCounter::open(&path).unwrap();
		assert_eq!(counter.get("k").await.unwrap(), Some(9));
	}
}
