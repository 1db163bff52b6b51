//! Ports the core consumes but does not implement: payment
//! verification, signing, payouts.
//!
//! The engine only depends on the traits; real adapters live with the
//! transport layer. The mock implementations here validate structural
//! correctness and produce deterministic results, which is all the core
//! and its tests require.

use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credit_primitives::{MicroUsd, PayoutStatus};
use sha2::{Digest, Sha256};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc, Mutex,
	},
};

// ==== payment verification ====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProof {
	/// Idempotency at this boundary keys on the reference.
	pub reference: String,
	pub recipient_address: String,
	pub payer: String,
	pub chain_id: u64,
	pub amount: MicroUsd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
	pub valid: bool,
	pub reason: Option<String>,
}

impl VerifyOutcome {
	fn invalid(reason: &str) -> Self {
		Self { valid: false, reason: Some(reason.to_string()) }
	}
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
	async fn verify(&self, proof: &PaymentProof) -> anyhow::Result<VerifyOutcome>;
}

/// Structural verifier: checks field shape and the recipient match,
/// nothing on-chain.
pub struct MockPaymentVerifier {
	pub expected_recipient: String,
}

#[async_trait]
impl PaymentVerifier for MockPaymentVerifier {
	async fn verify(&self, proof: &PaymentProof) -> anyhow::Result<VerifyOutcome> {
		if proof.reference.is_empty() {
			return Ok(VerifyOutcome::invalid("empty reference"));
		}
		if proof.payer.is_empty() {
			return Ok(VerifyOutcome::invalid("empty payer"));
		}
		if proof.chain_id == 0 {
			return Ok(VerifyOutcome::invalid("chain id must be positive"));
		}
		if proof.amount.is_zero() {
			return Ok(VerifyOutcome::invalid("amount must be positive"));
		}
		if proof.recipient_address != self.expected_recipient {
			return Ok(VerifyOutcome::invalid("recipient mismatch"));
		}
		Ok(VerifyOutcome { valid: true, reason: None })
	}
}

// ==== signing ====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
	pub signature: String,
	pub key_version: u32,
	pub signed_at: DateTime<Utc>,
	pub data_hash: String,
}

#[async_trait]
pub trait Signer: Send + Sync {
	async fn sign(&self, data: &[u8], key_name: Option<&str>) -> anyhow::Result<Signature>;
	async fn verify(&self, data: &[u8], signature: &Signature) -> anyhow::Result<bool>;
	async fn rotate_key(&self, key_name: Option<&str>) -> anyhow::Result<u32>;
}

/// Deterministic signer over a shared secret: externally verifiable by
/// anyone holding the same secret and key version.
pub struct MockSigner {
	secret: String,
	key_version: AtomicU32,
	clock: Arc<dyn Clock>,
}

impl MockSigner {
	pub fn new(secret: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
		Self { secret: secret.into(), key_version: AtomicU32::new(1), clock }
	}

	fn signature_for(&self, data: &[u8], key_name: Option<&str>, key_version: u32) -> String {
		let mut hasher = Sha256::new();
		hasher.update(self.secret.as_bytes());
		hasher.update(key_name.unwrap_or("default").as_bytes());
		hasher.update(key_version.to_be_bytes());
		hasher.update(data);
		hex::encode(hasher.finalize())
	}
}

#[async_trait]
impl Signer for MockSigner {
	async fn sign(&self, data: &[u8], key_name: Option<&str>) -> anyhow::Result<Signature> {
		let key_version = self.key_version.load(Ordering::SeqCst);
		Ok(Signature {
			signature: self.signature_for(data, key_name, key_version),
			key_version,
			signed_at: self.clock.now(),
			data_hash: hex::encode(Sha256::digest(data)),
		})
	}

	async fn verify(&self, data: &[u8], signature: &Signature) -> anyhow::Result<bool> {
		Ok(signature.signature == self.signature_for(data, None, signature.key_version) &&
			signature.data_hash == hex::encode(Sha256::digest(data)))
	}

	async fn rotate_key(&self, _key_name: Option<&str>) -> anyhow::Result<u32> {
		Ok(self.key_version.fetch_add(1, Ordering::SeqCst) + 1)
	}
}

// ==== payouts ====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutRequest {
	/// Deterministic; retries of the same request carry the same key.
	pub idempotency_key: String,
	pub amount: MicroUsd,
	pub currency: String,
	pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutResult {
	pub payout_id: String,
	pub status: PayoutStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutEstimate {
	pub amount: MicroUsd,
	pub fee: MicroUsd,
	pub currency: String,
}

#[async_trait]
pub trait PayoutProvider: Send + Sync {
	async fn create_payout(&self, request: &PayoutRequest) -> anyhow::Result<PayoutResult>;
	async fn get_payout_status(&self, payout_id: &str) -> anyhow::Result<PayoutStatus>;
	async fn get_estimate(&self, amount: MicroUsd, currency: &str)
		-> anyhow::Result<PayoutEstimate>;
}

/// In-memory provider: idempotent on the request key, and each status
/// poll advances the payout one lifecycle step so tests can drive it to
/// completion deterministically.
#[derive(Default)]
pub struct MockPayoutProvider {
	payouts: Mutex<HashMap<String, PayoutStatus>>,
}

#[async_trait]
impl PayoutProvider for MockPayoutProvider {
	async fn create_payout(&self, request: &PayoutRequest) -> anyhow::Result<PayoutResult> {
		let mut payouts = self.payouts.lock().expect("payout mutex poisoned");
		let payout_id = format!("po_{}", request.idempotency_key);
		let status = *payouts.entry(payout_id.clone()).or_insert(PayoutStatus::Requested);
		Ok(PayoutResult { payout_id, status })
	}

	async fn get_payout_status(&self, payout_id: &str) -> anyhow::Result<PayoutStatus> {
		let mut payouts = self.payouts.lock().expect("payout mutex poisoned");
		let status = payouts
			.get_mut(payout_id)
			.ok_or_else(|| anyhow::anyhow!("unknown payout {payout_id}"))?;
		*status = match *status {
			PayoutStatus::Requested => PayoutStatus::Approved,
			PayoutStatus::Approved => PayoutStatus::Processing,
			PayoutStatus::Processing => PayoutStatus::Completed,
			terminal => terminal,
		};
		Ok(*status)
	}

	async fn get_estimate(
		&self,
		amount: MicroUsd,
		currency: &str,
	) -> anyhow::Result<PayoutEstimate> {
		// Flat 30bps mock fee.
		let fee = amount.bps_share(credit_primitives::Bps::new(30).expect("static rate"));
		Ok(PayoutEstimate { amount, fee, currency: currency.to_string() })
	}
}
