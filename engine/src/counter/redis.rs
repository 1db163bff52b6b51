//! Distributed cache counter backend with TTL.
//!
//! Increment-and-expire runs as one server-side script so concurrent
//! writers from many processes still sum exactly. A `get` of an unset
//! (or expired) key reports a miss, which lets the chain fall back to a
//! durable backend.

use super::CounterBackend;
use anyhow::Context;
use async_trait::async_trait;
use redis::Script;

const INCR_WITH_TTL: &str = r#"
local total = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return total
"#;

pub struct RedisCounter {
	client: redis::Client,
	ttl_seconds: i64,
	key_prefix: String,
}

impl RedisCounter {
	pub fn new(url: &str, key_prefix: &str, ttl_seconds: i64) -> anyhow::Result<Self> {
		Ok(Self {
			client: redis::Client::open(url).context("invalid redis url")?,
			ttl_seconds,
			key_prefix: key_prefix.to_string(),
		})
	}

	fn key(&self, key: &str) -> String {
		format!("{}:{key}", self.key_prefix)
	}
}

#[async_trait]
impl CounterBackend for RedisCounter {
	fn name(&self) -> &'static str {
		"redis"
	}

	async fn increment(&self, key: &str, amount: i64) -> anyhow::Result<i64> {
		let mut conn = self
			.client
			.get_multiplexed_async_connection()
			.await
			.context("redis connection failed")?;
		Script::new(INCR_WITH_TTL)
			.key(self.key(key))
			.arg(amount)
			.arg(self.ttl_seconds)
			.invoke_async(&mut conn)
			.await
			.context("redis increment script failed")
	}

	async fn get(&self, key: &str) -> anyhow::Result<Option<i64>> {
		let mut conn = self
			.client
			.get_multiplexed_async_connection()
			.await
			.context("redis connection failed")?;
		redis::cmd("GET")
			.arg(self.key(key))
			.query_async(&mut conn)
			.await
			.context("redis get failed")
	}

	async fn reset(&self, key: &str) -> anyhow::Result<()> {
		let mut conn = self
			.client
			.get_multiplexed_async_connection()
			.await
			.context("redis connection failed")?;
		let _: () = redis::cmd("DEL")
			.arg(self.key(key))
			.query_async(&mut conn)
			.await
			.context("redis del failed")?;
		Ok(())
	}
}
