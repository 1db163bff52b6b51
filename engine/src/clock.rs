//! Injected time. Nothing in the engine calls `Utc::now()` directly;
//! every component reads the clock it was handed so TTL, window and
//! cooldown behavior is deterministic under test.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
	fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// A settable clock for tests.
#[derive(Clone)]
pub struct TestClock {
	now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
	pub fn at(now: DateTime<Utc>) -> Self {
		Self { now: Arc::new(Mutex::new(now)) }
	}

	pub fn set(&self, now: DateTime<Utc>) {
		*self.now.lock().unwrap() = now;
	}

	pub fn advance(&self, by: chrono::Duration) {
		let mut now = self.now.lock().unwrap();
		*now += by;
	}
}

impl Clock for TestClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock().unwrap()
	}
}
