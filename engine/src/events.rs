//! The economic event outbox and the legacy dual-write bridge.
//!
//! Events are written through the same [`LedgerTx`] as the state change
//! that emits them: a state change commits iff its event is visible in
//! the outbox. Consumers must treat delivery as at-least-once and key on
//! idempotency or correlation ids.
//!
//! During migration a subset of event types is mirrored into the legacy
//! audit table; a handful of legacy-only types never reach the outbox at
//! all and go straight to the audit table.

use crate::{
	error::{Result, StoreResultExt},
	store::{ts_to_db, LedgerTx},
};
use credit_primitives::EntityType;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// The closed vocabulary of outbox events.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	LotMinted,
	ReservationCreated,
	ReservationFinalized,
	ReservationReleased,
	ReferralRegistered,
	BonusGranted,
	BonusFlagged,
	EarningRecorded,
	EarningSettled,
	EarningClawedBack,
	PayoutRequested,
	PayoutApproved,
	PayoutCompleted,
	PayoutFailed,
	RewardsDistributed,
	ScoreImported,
	AgentBudgetWarning,
	AgentBudgetExhausted,
	AgentSettlementInstant,
	AgentClawbackPartial,
	AgentClawbackReceivableCreated,
	ConfigProposed,
	ConfigApproved,
	ConfigActivated,
	ReconciliationCompleted,
	ReconciliationDivergence,
	PeerTransferInitiated,
	PeerTransferCompleted,
	PeerTransferRejected,
	TbaBound,
	TbaDepositDetected,
	TbaDepositBridged,
	TbaDepositFailed,
	AgentProposalSubmitted,
	AgentProposalQuorumReached,
	AgentProposalActivated,
	AgentProposalRejected,
}

impl EventType {
	/// Whether the dual-write bridge mirrors this type into the legacy
	/// audit table. The mirrored subset is the balance-moving economic
	/// vocabulary; governance and reconciliation are outbox-only.
	pub fn legacy_mirrored(self) -> bool {
		matches!(
			self,
			EventType::LotMinted |
				EventType::ReservationCreated |
				EventType::ReservationFinalized |
				EventType::ReservationReleased |
				EventType::PeerTransferInitiated |
				EventType::PeerTransferCompleted |
				EventType::PeerTransferRejected |
				EventType::TbaDepositDetected |
				EventType::TbaDepositBridged |
				EventType::TbaDepositFailed |
				EventType::AgentBudgetWarning |
				EventType::AgentBudgetExhausted
		)
	}
}

/// Event types that only ever existed in the legacy audit table; they
/// have no outbox counterpart and bypass it entirely.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LegacyEventType {
	AccountCreated,
	LotExpired,
	BonusWithheld,
	PayoutProcessing,
	WalletLinked,
	WalletUnlinked,
}

/// An immutable economic event, produced in the same transaction as the
/// state change it records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EconomicEvent {
	pub event_type: EventType,
	pub entity_type: EntityType,
	pub entity_id: String,
	pub correlation_id: Option<String>,
	pub idempotency_key: Option<String>,
	pub config_version: Option<i64>,
	pub payload: serde_json::Value,
}

impl EconomicEvent {
	pub fn new(
		event_type: EventType,
		entity_type: EntityType,
		entity_id: impl Into<String>,
		payload: serde_json::Value,
	) -> Self {
		Self {
			event_type,
			entity_type,
			entity_id: entity_id.into(),
			correlation_id: None,
			idempotency_key: None,
			config_version: None,
			payload,
		}
	}

	pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
		self.correlation_id = Some(correlation_id.into());
		self
	}

	pub fn idempotent(mut self, key: impl Into<String>) -> Self {
		self.idempotency_key = Some(key.into());
		self
	}

	pub fn at_config_version(mut self, version: i64) -> Self {
		self.config_version = Some(version);
		self
	}
}

/// A row read back from the outbox, for consumers and tests.
#[derive(Debug, Clone)]
pub struct StoredEvent {
	pub id: i64,
	pub event: EconomicEvent,
}

impl LedgerTx<'_> {
	/// Append to the outbox and, for mirrored types, to the legacy audit
	/// table, atomically with the surrounding state change.
	pub fn emit(&self, event: &EconomicEvent) -> Result<i64> {
		self.conn()
			.execute(
				"INSERT INTO economic_events
					(event_type, entity_type, entity_id, correlation_id, idempotency_key,
					 config_version, payload, created_at)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
				params![
					event.event_type.to_string(),
					event.entity_type.to_string(),
					event.entity_id,
					event.correlation_id,
					event.idempotency_key,
					event.config_version,
					event.payload.to_string(),
					ts_to_db(self.now),
				],
			)
			.store_err(self.op)?;
		let id = self.conn().last_insert_rowid();

		if event.event_type.legacy_mirrored() {
			self.conn()
				.execute(
					"INSERT INTO legacy_audit_log
						(event_type, entity_type, entity_id, payload, created_at)
					 VALUES (?1, ?2, ?3, ?4, ?5)",
					params![
						event.event_type.to_string(),
						event.entity_type.to_string(),
						event.entity_id,
						event.payload.to_string(),
						ts_to_db(self.now),
					],
				)
				.store_err(self.op)?;
		}
		Ok(id)
	}

	/// Record a legacy-only event. Never touches the outbox.
	pub fn emit_legacy(
		&self,
		event_type: LegacyEventType,
		entity_type: EntityType,
		entity_id: &str,
		payload: serde_json::Value,
	) -> Result<()> {
		self.conn()
			.execute(
				"INSERT INTO legacy_audit_log
					(event_type, entity_type, entity_id, payload, created_at)
				 VALUES (?1, ?2, ?3, ?4, ?5)",
				params![
					event_type.to_string(),
					entity_type.to_string(),
					entity_id,
					payload.to_string(),
					ts_to_db(self.now),
				],
			)
			.store_err(self.op)?;
		Ok(())
	}

	/// Outbox rows for one entity, in insert order.
	pub fn events_for(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<StoredEvent>> {
		let mut stmt = self
			.conn()
			.prepare(
				"SELECT id, event_type, entity_type, entity_id, correlation_id,
				        idempotency_key, config_version, payload
				 FROM economic_events
				 WHERE entity_type = ?1 AND entity_id = ?2
				 ORDER BY id ASC",
			)
			.store_err(self.op)?;
		let rows = stmt
			.query_map(params![entity_type.to_string(), entity_id], |row| {
				Ok(StoredEvent {
					id: row.get(0)?,
					event: EconomicEvent {
						event_type: crate::store::parse_discriminant(1, row.get(1)?)?,
						entity_type: crate::store::parse_discriminant(2, row.get(2)?)?,
						entity_id: row.get(3)?,
						correlation_id: row.get(4)?,
						idempotency_key: row.get(5)?,
						config_version: row.get(6)?,
						payload: serde_json::from_str(&row.get::<_, String>(7)?).map_err(|e| {
							rusqlite::Error::FromSqlConversionFailure(
								7,
								rusqlite::types::Type::Text,
								Box::new(e),
							)
						})?,
					},
				})
			})
			.store_err(self.op)?
			.collect::<rusqlite::Result<Vec<_>>>()
			.store_err(self.op)?;
		Ok(rows)
	}

	pub fn count_events(&self, event_type: EventType) -> Result<i64> {
		self.conn()
			.query_row(
				"SELECT COUNT(*) FROM economic_events WHERE event_type = ?1",
				params![event_type.to_string()],
				|row| row.get(0),
			)
			.store_err(self.op)
	}

	pub fn count_legacy_events(&self, event_type: &str) -> Result<i64> {
		self.conn()
			.query_row(
				"SELECT COUNT(*) FROM legacy_audit_log WHERE event_type = ?1",
				params![event_type],
				|row| row.get(0),
			)
			.store_err(self.op)
	}
}
