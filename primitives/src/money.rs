//! Branded monetary types.
//!
//! All amounts are integer micro-USD (one unit is 10⁻⁶ USD). No floating
//! point ever touches money. The numeric domain is bounded so that any
//! ledger total still fits a signed 64-bit integer when serialized to the
//! store.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Scale of a full basis-point share: 10_000 bps == 100%.
pub const BPS_SCALE: u32 = 10_000;

/// Upper bound of the monetary domain: 10¹⁵ micro-USD (one billion USD).
pub const MICRO_CEILING: u64 = 1_000_000_000_000_000;

/// Arithmetic failures on monetary values. Each variant carries the
/// operand set so callers can surface the exact computation that failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
	#[error("{op}: result exceeds the monetary ceiling ({lhs} and {rhs})")]
	AboveCeiling { op: &'static str, lhs: u64, rhs: u64 },
	#[error("{op}: result below zero ({lhs} minus {rhs})")]
	BelowZero { op: &'static str, lhs: u64, rhs: u64 },
	#[error("basis points out of range: {value}")]
	BpsOutOfRange { value: u32 },
	#[error("basis point shares must sum to {BPS_SCALE}: {a} + {b} + {c}")]
	BpsSumMismatch { a: u32, b: u32, c: u32 },
}

/// An amount of integer micro-USD in `[0, 10¹⁵]`.
///
/// Deliberately not interchangeable with raw integers: construction goes
/// through [`MicroUsd::new`] and all arithmetic is explicit and guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MicroUsd(u64);

impl MicroUsd {
	pub const ZERO: MicroUsd = MicroUsd(0);
	pub const CEILING: MicroUsd = MicroUsd(MICRO_CEILING);

	pub fn new(micros: u64) -> Result<Self, MoneyError> {
		if micros > MICRO_CEILING {
			Err(MoneyError::AboveCeiling { op: "new", lhs: micros, rhs: 0 })
		} else {
			Ok(MicroUsd(micros))
		}
	}

	pub fn micros(self) -> u64 {
		self.0
	}

	pub fn is_zero(self) -> bool {
		self.0 == 0
	}

	pub fn add(self, rhs: MicroUsd) -> Result<MicroUsd, MoneyError> {
		let sum = self
			.0
			.checked_add(rhs.0)
			.ok_or(MoneyError::AboveCeiling { op: "add", lhs: self.0, rhs: rhs.0 })?;
		if sum > MICRO_CEILING {
			Err(MoneyError::AboveCeiling { op: "add", lhs: self.0, rhs: rhs.0 })
		} else {
			Ok(MicroUsd(sum))
		}
	}

	pub fn sub(self, rhs: MicroUsd) -> Result<MicroUsd, MoneyError> {
		self.0
			.checked_sub(rhs.0)
			.map(MicroUsd)
			.ok_or(MoneyError::BelowZero { op: "sub", lhs: self.0, rhs: rhs.0 })
	}

	/// `amount * bps / 10_000`, truncating. The intermediate product is
	/// taken at 128 bits so the ceiling bound keeps this exact.
	pub fn bps_share(self, bps: Bps) -> MicroUsd {
		MicroUsd((self.0 as u128 * bps.value() as u128 / BPS_SCALE as u128) as u64)
	}

	pub fn min(self, rhs: MicroUsd) -> MicroUsd {
		MicroUsd(self.0.min(rhs.0))
	}
}

impl fmt::Display for MicroUsd {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

// Money crosses every process boundary as a canonical decimal string,
// never as a float and never as a bare JSON number.
impl Serialize for MicroUsd {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0.to_string())
	}
}

impl<'de> Deserialize<'de> for MicroUsd {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		crate::parse::parse_enforce(&raw).map_err(de::Error::custom)
	}
}

/// Integer basis points in `[0, 10_000]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Bps(u32);

impl Bps {
	/// Value representing 100%.
	pub const MAX: Bps = Bps(BPS_SCALE);

	pub fn new(bps: u32) -> Result<Self, MoneyError> {
		if bps > BPS_SCALE {
			Err(MoneyError::BpsOutOfRange { value: bps })
		} else {
			Ok(Bps(bps))
		}
	}

	pub fn value(self) -> u32 {
		self.0
	}
}

impl TryFrom<u32> for Bps {
	type Error = MoneyError;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		Bps::new(value)
	}
}

impl From<Bps> for u32 {
	fn from(bps: Bps) -> u32 {
		bps.0
	}
}

impl fmt::Display for Bps {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Verify that a rate triple covers the whole charge: `a + b + c == 10_000`.
pub fn assert_bps_sum(a: Bps, b: Bps, c: Bps) -> Result<(), MoneyError> {
	if a.0 + b.0 + c.0 == BPS_SCALE {
		Ok(())
	} else {
		Err(MoneyError::BpsSumMismatch { a: a.0, b: b.0, c: c.0 })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn usd(micros: u64) -> MicroUsd {
		MicroUsd::new(micros).unwrap()
	}

	#[test]
	fn rejects_amounts_above_the_ceiling() {
		assert!(MicroUsd::new(MICRO_CEILING).is_ok());
		assert_eq!(
			MicroUsd::new(MICRO_CEILING + 1),
			Err(MoneyError::AboveCeiling { op: "new", lhs: MICRO_CEILING + 1, rhs: 0 })
		);
	}

	#[test]
	fn addition_is_guarded_at_the_ceiling() {
		assert_eq!(usd(2).add(usd(3)), Ok(usd(5)));
		assert!(matches!(
			MicroUsd::CEILING.add(usd(1)),
			Err(MoneyError::AboveCeiling { op: "add", .. })
		));
	}

	#[test]
	fn subtraction_floors_at_zero() {
		assert_eq!(usd(5).sub(usd(5)), Ok(MicroUsd::ZERO));
		assert_eq!(
			usd(3).sub(usd(5)),
			Err(MoneyError::BelowZero { op: "sub", lhs: 3, rhs: 5 })
		);
	}

	#[test]
	fn bps_share_truncates() {
		// 333_333 * 1_500 / 10_000 == 49_999.95
		assert_eq!(usd(333_333).bps_share(Bps::new(1_500).unwrap()), usd(49_999));
		assert_eq!(usd(333_333).bps_share(Bps::MAX), usd(333_333));
		assert_eq!(usd(333_333).bps_share(Bps::new(0).unwrap()), MicroUsd::ZERO);
	}

	#[test]
	fn bps_rates_must_cover_the_scale() {
		let bps = |v| Bps::new(v).unwrap();
		assert!(assert_bps_sum(bps(1_500), bps(5_000), bps(3_500)).is_ok());
		assert_eq!(
			assert_bps_sum(bps(1_500), bps(5_000), bps(3_000)),
			Err(MoneyError::BpsSumMismatch { a: 1_500, b: 5_000, c: 3_000 })
		);
	}

	#[test]
	fn serializes_as_decimal_string() {
		assert_eq!(serde_json::to_string(&usd(1_000_000)).unwrap(), "\"1000000\"");
		assert_eq!(serde_json::from_str::<MicroUsd>("\"1000000\"").unwrap(), usd(1_000_000));
		assert!(serde_json::from_str::<MicroUsd>("\"007\"").is_err());
		assert!(serde_json::from_str::<MicroUsd>("1000000").is_err());
	}
}
