//! Bridging: on-chain TBA deposits and peer transfers.
//!
//! Deposits walk detected → confirmed → bridged | failed, keyed by a
//! unique transaction hash. Bridging mints a `deposit`-sourced lot into
//! the agent's isolation pool in the same transaction that flips the
//! status; if the mint hits an earlier credit of the same source, the
//! deposit converges onto the pre-existing lot instead of failing.
//!
//! Peer transfers are two-phase inside one transaction: reserve the
//! sender, finalize at the full amount (no revenue is realized), and
//! mint a `transfer_in` lot at the receiver, all tagged with one
//! correlation id so a reconciler sees exact symmetry.

use crate::{
	error::{LedgerError, Result, StoreResultExt},
	events::{EconomicEvent, EventType, LegacyEventType},
	ledger::{mint_lot_in_tx, MintOptions},
	reservation::{finalize_in_tx, reserve_in_tx, ReserveOptions},
	state_machine::DEPOSIT,
	store::{micros_from_db, micros_to_db, ts_from_db, ts_to_db, LedgerStore, LedgerTx},
};
use chrono::{DateTime, Utc};
use credit_primitives::{BillingMode, DepositStatus, LotSourceType, MicroUsd, Pool};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TbaDeposit {
	pub id: i64,
	pub account_id: i64,
	pub tx_hash: String,
	pub amount: MicroUsd,
	pub status: DepositStatus,
	pub lot_id: Option<String>,
	pub detected_at: DateTime<Utc>,
	pub bridged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
	pub correlation_id: String,
	pub reservation_id: String,
	pub receiver_lot_id: String,
	pub amount: MicroUsd,
}

const DEPOSIT_COLUMNS: &str =
	"id, account_id, tx_hash, amount, status, lot_id, detected_at, bridged_at";

fn deposit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TbaDeposit> {
	Ok(TbaDeposit {
		id: row.get(0)?,
		account_id: row.get(1)?,
		tx_hash: row.get(2)?,
		amount: micros_from_db(3, row.get(3)?)?,
		status: crate::store::parse_discriminant(4, row.get(4)?)?,
		lot_id: row.get(5)?,
		detected_at: ts_from_db(6, row.get(6)?)?,
		bridged_at: row.get::<_, Option<i64>>(7)?.map(|v| ts_from_db(7, v)).transpose()?,
	})
}

fn deposit_by_hash(tx: &LedgerTx<'_>, tx_hash: &str) -> Result<Option<TbaDeposit>> {
	tx.conn()
		.query_row(
			&format!("SELECT {DEPOSIT_COLUMNS} FROM tba_deposits WHERE tx_hash = ?1"),
			params![tx_hash],
			deposit_from_row,
		)
		.optional()
		.store_err(tx.op)
}

fn set_deposit_status(
	tx: &LedgerTx<'_>,
	deposit: &TbaDeposit,
	to: DepositStatus,
	lot_id: Option<&str>,
) -> Result<()> {
	DEPOSIT.ensure(tx.op, deposit.status, to)?;
	tx.conn()
		.execute(
			"UPDATE tba_deposits
			 SET status = ?2,
			     lot_id = COALESCE(?3, lot_id),
			     bridged_at = CASE WHEN ?2 = 'bridged' THEN ?4 ELSE bridged_at END
			 WHERE id = ?1",
			params![deposit.id, to.to_string(), lot_id, ts_to_db(tx.now)],
		)
		.store_err(tx.op)?;
	Ok(())
}

pub struct BridgingService {
	store: Arc<LedgerStore>,
}

impl BridgingService {
	pub fn new(store: Arc<LedgerStore>) -> Self {
		Self { store }
	}

	/// Bind an on-chain wallet to an agent account. Bumps the account
	/// version; the address itself lives with the identity service.
	pub fn bind_tba(&self, account_id: i64, address: &str) -> Result<()> {
		self.store.with_tx("bind_tba", |tx| {
			let account = tx.account_by_id(account_id)?;
			tx.conn()
				.execute(
					"UPDATE credit_accounts SET version = version + 1, updated_at = ?2
					 WHERE id = ?1",
					params![account.id, ts_to_db(tx.now)],
				)
				.store_err(tx.op)?;
			tx.emit(&EconomicEvent::new(
				EventType::TbaBound,
				account.entity_type,
				account.entity_id.as_str(),
				json!({ "address": address }),
			))?;
			tx.emit_legacy(
				LegacyEventType::WalletLinked,
				account.entity_type,
				&account.entity_id,
				json!({ "address": address }),
			)?;
			Ok(())
		})
	}

	/// Record a detected on-chain deposit. Idempotent on the transaction
	/// hash; a replay with a different amount or account is a bridge
	/// mismatch.
	pub fn record_deposit(
		&self,
		account_id: i64,
		tx_hash: &str,
		amount: MicroUsd,
	) -> Result<TbaDeposit> {
		self.store.with_tx("deposit_detect", |tx| {
			if let Some(existing) = deposit_by_hash(tx, tx_hash)? {
				if existing.account_id != account_id || existing.amount != amount {
					return Err(LedgerError::DepositBridgeMismatch {
						op: tx.op,
						detail: format!("tx {tx_hash} already recorded with a different payload"),
					});
				}
				return Ok(existing);
			}
			let account = tx.account_by_id(account_id)?;
			tx.conn()
				.execute(
					"INSERT INTO tba_deposits
						(account_id, tx_hash, amount, status, detected_at)
					 VALUES (?1, ?2, ?3, 'detected', ?4)",
					params![account_id, tx_hash, micros_to_db(amount), ts_to_db(tx.now)],
				)
				.store_err(tx.op)?;
			tx.emit(
				&EconomicEvent::new(
					EventType::TbaDepositDetected,
					account.entity_type,
					account.entity_id.as_str(),
					json!({ "tx_hash": tx_hash, "amount": amount }),
				)
				.idempotent(tx_hash.to_string()),
			)?;
			deposit_by_hash(tx, tx_hash)?.ok_or_else(|| {
				LedgerError::not_found(tx.op, format!("deposit {tx_hash}"))
			})
		})
	}

	pub fn confirm_deposit(&self, tx_hash: &str) -> Result<TbaDeposit> {
		self.store.with_tx("deposit_confirm", |tx| {
			let deposit = deposit_by_hash(tx, tx_hash)?
				.ok_or_else(|| LedgerError::not_found(tx.op, format!("deposit {tx_hash}")))?;
			set_deposit_status(tx, &deposit, DepositStatus::Confirmed, None)?;
			deposit_by_hash(tx, tx_hash)?.ok_or_else(|| {
				LedgerError::not_found(tx.op, format!("deposit {tx_hash}"))
			})
		})
	}

	/// Bridge a confirmed deposit: mint the lot, link it, mark bridged
	/// and emit the event, atomically. A unique-source collision means
	/// the credits already exist; the deposit converges onto that lot.
	pub fn bridge_deposit(&self, tx_hash: &str) -> Result<TbaDeposit> {
		self.store.with_tx("deposit_bridge", |tx| {
			let deposit = deposit_by_hash(tx, tx_hash)?
				.ok_or_else(|| LedgerError::not_found(tx.op, format!("deposit {tx_hash}")))?;
			if deposit.status == DepositStatus::Bridged {
				return Ok(deposit);
			}
			DEPOSIT.ensure(tx.op, deposit.status, DepositStatus::Bridged)?;

			let account = tx.account_by_id(deposit.account_id)?;
			let minted = mint_lot_in_tx(
				tx,
				deposit.account_id,
				deposit.amount,
				LotSourceType::Deposit,
				&MintOptions {
					pool: Some(Pool::agent(&account.entity_id)),
					source_id: Some(deposit.tx_hash.clone()),
					expires_at: None,
					idempotency_key: None,
				},
			)?;
			if minted.lot.original != deposit.amount {
				return Err(LedgerError::DepositBridgeMismatch {
					op: tx.op,
					detail: format!(
						"tx {tx_hash}: existing lot holds {} but the deposit is {}",
						minted.lot.original, deposit.amount
					),
				});
			}

			set_deposit_status(tx, &deposit, DepositStatus::Bridged, Some(&minted.lot.id))?;
			tx.emit(
				&EconomicEvent::new(
					EventType::TbaDepositBridged,
					account.entity_type,
					account.entity_id.as_str(),
					json!({
						"tx_hash": tx_hash,
						"lot_id": minted.lot.id,
						"amount": deposit.amount,
						"converged": minted.replayed,
					}),
				)
				.idempotent(tx_hash.to_string()),
			)?;
			info!(tx_hash, lot = %minted.lot.id, "deposit bridged");
			deposit_by_hash(tx, tx_hash)?.ok_or_else(|| {
				LedgerError::not_found(tx.op, format!("deposit {tx_hash}"))
			})
		})
	}

	pub fn fail_deposit(&self, tx_hash: &str, reason: &str) -> Result<TbaDeposit> {
		self.store.with_tx("deposit_fail", |tx| {
			let deposit = deposit_by_hash(tx, tx_hash)?
				.ok_or_else(|| LedgerError::not_found(tx.op, format!("deposit {tx_hash}")))?;
			set_deposit_status(tx, &deposit, DepositStatus::Failed, None)?;
			let account = tx.account_by_id(deposit.account_id)?;
			tx.emit(&EconomicEvent::new(
				EventType::TbaDepositFailed,
				account.entity_type,
				account.entity_id.as_str(),
				json!({ "tx_hash": tx_hash, "reason": reason }),
			))?;
			deposit_by_hash(tx, tx_hash)?.ok_or_else(|| {
				LedgerError::not_found(tx.op, format!("deposit {tx_hash}"))
			})
		})
	}

	/// Move credits between two accounts: debit the sender through a
	/// reservation finalized at the full amount and mint a `transfer_in`
	/// lot at the receiver, all in one transaction under one correlation
	/// id. The correlation id doubles as the lot's source id, so exactly
	/// one receiver lot can ever exist per completed transfer.
	pub fn transfer(
		&self,
		sender_account_id: i64,
		receiver_account_id: i64,
		amount: MicroUsd,
		pool: &Pool,
	) -> Result<TransferOutcome> {
		let correlation_id = Uuid::new_v4().to_string();
		let result = self.store.with_tx("transfer", |tx| {
			let sender = tx.account_by_id(sender_account_id)?;
			let receiver = tx.account_by_id(receiver_account_id)?;

			tx.emit(
				&EconomicEvent::new(
					EventType::PeerTransferInitiated,
					sender.entity_type,
					sender.entity_id.as_str(),
					json!({ "amount": amount, "receiver": receiver.entity_id }),
				)
				.correlated(correlation_id.clone()),
			)?;

			let reservation = reserve_in_tx(
				tx,
				&sender,
				amount,
				&ReserveOptions {
					pool: pool.clone(),
					billing_mode: BillingMode::Live,
					ttl: None,
					idempotency_key: None,
				},
			)?;
			let outcome = finalize_in_tx(tx, None, &reservation.id, amount)?;
			if outcome.consumed != amount {
				return Err(LedgerError::TransferImbalance {
					op: tx.op,
					debited: outcome.consumed,
					credited: amount,
				});
			}

			let minted = mint_lot_in_tx(
				tx,
				receiver_account_id,
				amount,
				LotSourceType::TransferIn,
				&MintOptions {
					pool: None,
					source_id: Some(correlation_id.clone()),
					expires_at: None,
					idempotency_key: None,
				},
			)?;
			if minted.lot.original != amount {
				return Err(LedgerError::TransferImbalance {
					op: tx.op,
					debited: amount,
					credited: minted.lot.original,
				});
			}

			tx.emit(
				&EconomicEvent::new(
					EventType::PeerTransferCompleted,
					receiver.entity_type,
					receiver.entity_id.as_str(),
					json!({
						"amount": amount,
						"sender": sender.entity_id,
						"reservation_id": reservation.id,
						"lot_id": minted.lot.id,
					}),
				)
				.correlated(correlation_id.clone()),
			)?;

			Ok(TransferOutcome {
				correlation_id: correlation_id.clone(),
				reservation_id: reservation.id,
				receiver_lot_id: minted.lot.id,
				amount,
			})
		});

		if let Err(error) = &result {
			// The transfer transaction rolled back whole; the rejection is
			// recorded on its own.
			let reason = error.to_string();
			let rejected = self.store.with_tx("transfer_reject", |tx| {
				let sender = tx.account_by_id(sender_account_id)?;
				tx.emit(
					&EconomicEvent::new(
						EventType::PeerTransferRejected,
						sender.entity_type,
						sender.entity_id.as_str(),
						json!({ "amount": amount, "reason": reason }),
					)
					.correlated(correlation_id.clone()),
				)?;
				Ok(())
			});
			if let Err(error) = rejected {
				warn!(correlation = %correlation_id, %error, "failed to record transfer rejection");
			}
		}
		result
	}
}
