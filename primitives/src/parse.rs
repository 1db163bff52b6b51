//! Mode-aware parsing of micro-USD strings at process boundaries.
//!
//! Two grammars exist in the wild: the permissive legacy form (leading
//! zeros, an explicit sign, surrounding whitespace) and the canonical
//! enforce form (`0` or a nonzero digit followed by digits, nothing else).
//! Migration runs in shadow mode: both parses run, disagreements are
//! counted through a [`DivergenceSink`] and never raised.

use crate::money::{MicroUsd, MICRO_CEILING};
use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
	#[error("empty amount")]
	Empty,
	#[error("invalid digit in amount {0:?}")]
	InvalidDigit(String),
	#[error("negative amount {0:?}")]
	Negative(String),
	#[error("amount {0:?} is not in canonical form")]
	NonCanonical(String),
	#[error("amount {0:?} exceeds the monetary ceiling")]
	OutOfRange(String),
}

/// Parser posture, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
	/// Permissive grammar only.
	Legacy,
	/// Both grammars; divergences are counted, the legacy result wins.
	#[default]
	Shadow,
	/// Canonical grammar only.
	Enforce,
}

/// Receives one notification per shadow-mode divergence.
pub trait DivergenceSink: Send + Sync {
	fn record(&self, boundary: &'static str, raw: &str);
}

/// Process-local divergence tally, sufficient for single-process use and
/// for tests. Persistent tallies implement [`DivergenceSink`] elsewhere.
#[derive(Default)]
pub struct CountingSink {
	count: AtomicU64,
}

impl CountingSink {
	pub fn count(&self) -> u64 {
		self.count.load(Ordering::Relaxed)
	}
}

impl DivergenceSink for CountingSink {
	fn record(&self, _boundary: &'static str, _raw: &str) {
		self.count.fetch_add(1, Ordering::Relaxed);
	}
}

/// Canonical parse: `^(0|[1-9][0-9]*)$`, bounded by the monetary ceiling.
pub fn parse_enforce(raw: &str) -> Result<MicroUsd, ParseError> {
	let bytes = raw.as_bytes();
	if bytes.is_empty() {
		return Err(ParseError::Empty);
	}
	if !bytes.iter().all(|b| b.is_ascii_digit()) {
		return Err(ParseError::InvalidDigit(raw.to_string()));
	}
	if bytes[0] == b'0' && bytes.len() > 1 {
		return Err(ParseError::NonCanonical(raw.to_string()));
	}
	let value: u64 = raw.parse().map_err(|_| ParseError::OutOfRange(raw.to_string()))?;
	if value > MICRO_CEILING {
		return Err(ParseError::OutOfRange(raw.to_string()));
	}
	Ok(MicroUsd::new(value).expect("bounded above"))
}

/// Permissive parse: surrounding ASCII whitespace, one optional sign, any
/// number of leading zeros. A negative value is still rejected; money is
/// nonnegative everywhere in the ledger.
pub fn parse_legacy(raw: &str) -> Result<MicroUsd, ParseError> {
	let trimmed = raw.trim_matches(|c: char| c.is_ascii_whitespace());
	if trimmed.is_empty() {
		return Err(ParseError::Empty);
	}
	let (negative, digits) = match trimmed.as_bytes()[0] {
		b'+' => (false, &trimmed[1..]),
		b'-' => (true, &trimmed[1..]),
		_ => (false, trimmed),
	};
	if digits.is_empty() {
		return Err(ParseError::Empty);
	}
	if !digits.bytes().all(|b| b.is_ascii_digit()) {
		return Err(ParseError::InvalidDigit(raw.to_string()));
	}
	let value: u64 = digits.parse().map_err(|_| ParseError::OutOfRange(raw.to_string()))?;
	if negative && value != 0 {
		return Err(ParseError::Negative(raw.to_string()));
	}
	if value > MICRO_CEILING {
		return Err(ParseError::OutOfRange(raw.to_string()));
	}
	Ok(MicroUsd::new(value).expect("bounded above"))
}

/// A boundary parser bound to one mode and one divergence sink.
#[derive(Clone)]
pub struct MicroParser {
	mode: ParseMode,
	sink: Arc<dyn DivergenceSink>,
}

impl MicroParser {
	pub fn new(mode: ParseMode, sink: Arc<dyn DivergenceSink>) -> Self {
		Self { mode, sink }
	}

	pub fn mode(&self) -> ParseMode {
		self.mode
	}

	/// Parse `raw` at the boundary named `boundary` (used for telemetry
	/// keys; e.g. `"store"`, `"http"`, `"cache"`).
	pub fn parse(&self, boundary: &'static str, raw: &str) -> Result<MicroUsd, ParseError> {
		match self.mode {
			ParseMode::Legacy => parse_legacy(raw),
			ParseMode::Enforce => parse_enforce(raw),
			ParseMode::Shadow => match parse_enforce(raw) {
				Ok(value) => Ok(value),
				Err(_) => {
					let value = parse_legacy(raw)?;
					self.sink.record(boundary, raw);
					Ok(value)
				},
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn enforce_accepts_only_canonical_decimals() {
		assert_eq!(parse_enforce("0").unwrap(), MicroUsd::ZERO);
		assert_eq!(parse_enforce("1000000").unwrap().micros(), 1_000_000);
		assert!(matches!(parse_enforce("007"), Err(ParseError::NonCanonical(_))));
		assert!(matches!(parse_enforce(" 5"), Err(ParseError::InvalidDigit(_))));
		assert!(matches!(parse_enforce("+5"), Err(ParseError::InvalidDigit(_))));
		assert!(matches!(parse_enforce(""), Err(ParseError::Empty)));
		assert!(matches!(parse_enforce("1e6"), Err(ParseError::InvalidDigit(_))));
	}

	#[test]
	fn legacy_tolerates_zeros_signs_and_whitespace() {
		assert_eq!(parse_legacy(" 007 ").unwrap().micros(), 7);
		assert_eq!(parse_legacy("+42").unwrap().micros(), 42);
		assert_eq!(parse_legacy("-0").unwrap(), MicroUsd::ZERO);
		assert!(matches!(parse_legacy("-5"), Err(ParseError::Negative(_))));
		assert!(matches!(parse_legacy("4 2"), Err(ParseError::InvalidDigit(_))));
	}

	#[test]
	fn out_of_range_is_rejected_in_both_grammars() {
		let too_big = (MICRO_CEILING + 1).to_string();
		assert!(matches!(parse_enforce(&too_big), Err(ParseError::OutOfRange(_))));
		assert!(matches!(parse_legacy(&too_big), Err(ParseError::OutOfRange(_))));
	}

	#[test]
	fn shadow_counts_divergences_without_raising() {
		let sink = Arc::new(CountingSink::default());
		let parser = MicroParser::new(ParseMode::Shadow, sink.clone());

		assert_eq!(parser.parse("store", "1000000").unwrap().micros(), 1_000_000);
		assert_eq!(sink.count(), 0);

		assert_eq!(parser.parse("store", " 007").unwrap().micros(), 7);
		assert_eq!(sink.count(), 1);

		assert!(parser.parse("store", "abc").is_err());
		assert_eq!(sink.count(), 1);
	}

	proptest! {
		#[test]
		fn modes_agree_on_canonical_inputs(value in 0u64..=MICRO_CEILING) {
			let canonical = value.to_string();
			let sink = Arc::new(CountingSink::default());
			let shadow = MicroParser::new(ParseMode::Shadow, sink.clone());

			prop_assert_eq!(parse_enforce(&canonical).unwrap().micros(), value);
			prop_assert_eq!(parse_legacy(&canonical).unwrap().micros(), value);
			prop_assert_eq!(shadow.parse("test", &canonical).unwrap().micros(), value);
			prop_assert_eq!(sink.count(), 0);
		}
	}
}
