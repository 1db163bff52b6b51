//! In-memory counter backend for single-process and test use.

use super::CounterBackend;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Mutex};

#[derive(Default)]
pub struct InMemoryCounter {
	totals: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl CounterBackend for InMemoryCounter {
	fn name(&self) -> &'static str {
		"memory"
	}

	async fn increment(&self, key: &str, amount: i64) -> anyhow::Result<i64> {
		let mut totals = self.totals.lock().expect("counter mutex poisoned");
		let total = totals.entry(key.to_string()).or_insert(0);
		*total += amount;
		Ok(*total)
	}

	async fn get(&self, key: &str) -> anyhow::Result<Option<i64>> {
		Ok(self.totals.lock().expect("counter mutex poisoned").get(key).copied())
	}

	async fn reset(&self, key: &str) -> anyhow::Result<()> {
		self.totals.lock().expect("counter mutex poisoned").remove(key);
		Ok(())
	}
}
