//! Revenue distribution.
//!
//! Every realized charge is split across the three protocol accounts by
//! the active rate triple. The foundation share absorbs the integer
//! truncation remainder, which makes the split zero-sum by construction:
//! `commons + community + foundation == charge`, always, exactly.
//!
//! Posting happens inside the finalize transaction; the active rule is
//! cached read-through and invalidated when governance activates a
//! revenue parameter.

use crate::{
	error::{LedgerError, Result},
	governance,
	store::{micros_to_db, LedgerTx, NewEntry},
};
use credit_primitives::{money::assert_bps_sum, Bps, EntityType, EntryType, MicroUsd, Pool};
use std::sync::Mutex;

/// Protocol-level accounts the shares are posted to. Their balances are
/// ledger-derived; no lots are minted for revenue.
pub const COMMONS_ACCOUNT: (EntityType, &str) = (EntityType::Commons, "commons");
pub const COMMUNITY_ACCOUNT: (EntityType, &str) = (EntityType::Community, "platform");
pub const FOUNDATION_ACCOUNT: (EntityType, &str) = (EntityType::Foundation, "foundation");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevenueRates {
	pub commons_bps: Bps,
	pub community_bps: Bps,
	pub foundation_bps: Bps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionShares {
	pub commons: MicroUsd,
	pub community: MicroUsd,
	pub foundation: MicroUsd,
}

/// Split `charge` by `rates`. The rates must sum to exactly 10_000.
pub fn split(op: &'static str, charge: MicroUsd, rates: RevenueRates) -> Result<DistributionShares> {
	assert_bps_sum(rates.commons_bps, rates.community_bps, rates.foundation_bps)
		.map_err(|e| LedgerError::arithmetic(op, e))?;

	let commons = charge.bps_share(rates.commons_bps);
	let community = charge.bps_share(rates.community_bps);
	// The foundation takes the remainder so truncation never leaks value.
	let foundation = charge
		.sub(commons)
		.and_then(|rest| rest.sub(community))
		.map_err(|e| LedgerError::arithmetic(op, e))?;

	Ok(DistributionShares { commons, community, foundation })
}

pub struct RevenueDistribution {
	cached_rates: Mutex<Option<RevenueRates>>,
}

impl Default for RevenueDistribution {
	fn default() -> Self {
		Self::new()
	}
}

impl RevenueDistribution {
	pub fn new() -> Self {
		Self { cached_rates: Mutex::new(None) }
	}

	/// The active rate triple, read through the cache. Falls back to the
	/// governance table (and its compile-time defaults) on a cold cache.
	pub fn rates(&self, tx: &LedgerTx<'_>) -> Result<RevenueRates> {
		if let Some(rates) = *self.cached_rates.lock().expect("rates cache poisoned") {
			return Ok(rates);
		}
		let rate = |key| -> Result<Bps> {
			let raw = governance::get_i64(tx, key, None)?;
			Bps::new(u32::try_from(raw).map_err(|_| {
				LedgerError::invalid_state(tx.op, format!("{key}: negative rate"))
			})?)
			.map_err(|e| LedgerError::arithmetic(tx.op, e))
		};
		let rates = RevenueRates {
			commons_bps: rate("revenue.commons_bps")?,
			community_bps: rate("revenue.community_bps")?,
			foundation_bps: rate("revenue.foundation_bps")?,
		};
		assert_bps_sum(rates.commons_bps, rates.community_bps, rates.foundation_bps)
			.map_err(|e| LedgerError::arithmetic(tx.op, e))?;
		*self.cached_rates.lock().expect("rates cache poisoned") = Some(rates);
		Ok(rates)
	}

	/// Drop the cached rule if any of the given governance keys touch
	/// revenue rates. The activator calls this after promotion.
	pub fn invalidate_if(&self, activated_keys: &[String]) {
		if activated_keys.iter().any(|k| k.starts_with("revenue.")) {
			self.invalidate();
		}
	}

	pub fn invalidate(&self) {
		*self.cached_rates.lock().expect("rates cache poisoned") = None;
	}

	/// Post the three share entries for a realized charge, within the
	/// caller's (finalize) transaction, correlated by reservation id.
	pub fn post(
		&self,
		tx: &LedgerTx<'_>,
		pool: &Pool,
		charge: MicroUsd,
		correlation_id: &str,
	) -> Result<DistributionShares> {
		let shares = split(tx.op, charge, self.rates(tx)?)?;

		let targets = [
			(COMMONS_ACCOUNT, EntryType::CommonsContribution, shares.commons),
			(COMMUNITY_ACCOUNT, EntryType::RevenueShare, shares.community),
			(FOUNDATION_ACCOUNT, EntryType::RevenueShare, shares.foundation),
		];
		for ((entity_type, entity_id), entry_type, amount) in targets {
			let account = tx.create_account(entity_type, entity_id)?;
			tx.insert_entry(&NewEntry {
				account_id: account.id,
				pool: pool.clone(),
				lot_id: None,
				reservation_id: Some(correlation_id.to_string()),
				entry_type,
				amount: micros_to_db(amount),
				idempotency_key: None,
				pre_balance: None,
				post_balance: None,
			})?;
		}
		Ok(shares)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn usd(micros: u64) -> MicroUsd {
		MicroUsd::new(micros).unwrap()
	}

	fn rates(commons: u32, community: u32, foundation: u32) -> RevenueRates {
		RevenueRates {
			commons_bps: Bps::new(commons).unwrap(),
			community_bps: Bps::new(community).unwrap(),
			foundation_bps: Bps::new(foundation).unwrap(),
		}
	}

	#[test]
	fn splits_the_documented_example_exactly() {
		let shares = split("test", usd(333_333), rates(1_500, 5_000, 3_500)).unwrap();
		assert_eq!(shares.commons, usd(49_999));
		assert_eq!(shares.community, usd(166_666));
		assert_eq!(shares.foundation, usd(116_668));
	}

	#[test]
	fn rejects_rate_triples_that_do_not_cover_the_scale() {
		let err = split("test", usd(100), rates(1_500, 5_000, 3_000)).unwrap_err();
		assert!(matches!(err, LedgerError::Arithmetic { .. }));
	}

	proptest! {
		#[test]
		fn split_is_zero_sum(
			charge in 0u64..=1_000_000_000_000,
			commons in 0u32..=10_000,
			community_limit in 0u32..=10_000,
		) {
			let community = community_limit.min(10_000 - commons);
			let foundation = 10_000 - commons - community;
			let shares =
				split("test", usd(charge), rates(commons, community, foundation)).unwrap();

			let total = shares.commons
				.add(shares.community)
				.and_then(|sum| sum.add(shares.foundation))
				.unwrap();
			prop_assert_eq!(total, usd(charge));
		}
	}
}
