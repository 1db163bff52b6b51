//! Configuration governance.
//!
//! Parameters are versioned rows with a lifecycle: draft →
//! pending_approval → cooling_down → active, with rejection terminal and
//! replacement marking the previous row superseded. Every parameter key
//! has a strict shape enforced at proposal time; seeded defaults are all
//! integer seconds or micro-USD strings, never floats, never months.
//!
//! Lookup precedence: the active (key, entity_type) override, else the
//! active global row, else the compile-time fallback.

use crate::{
	error::{LedgerError, Result, StoreResultExt},
	events::{EconomicEvent, EventType},
	state_machine::GOVERNANCE,
	store::{parse_discriminant, ts_from_db, ts_to_db, LedgerStore, LedgerTx},
};
use chrono::{DateTime, Duration, Utc};
use credit_primitives::{parse::parse_enforce, EntityType, ParamStatus};
use lazy_static::lazy_static;
use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tracing::info;

/// Shapes a parameter value may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
	Integer,
	/// Micro-USD carried as a canonical decimal string.
	BigintMicro,
	IntegerSeconds,
	IntegerPercent,
	Real,
	StringEnum,
	Nullable,
}

#[derive(Debug, Clone)]
pub struct ParamSchema {
	pub kind: ParamKind,
	pub min: Option<i64>,
	pub max: Option<i64>,
	pub allowed: &'static [&'static str],
}

impl ParamSchema {
	const fn integer(min: i64, max: i64) -> Self {
		Self { kind: ParamKind::Integer, min: Some(min), max: Some(max), allowed: &[] }
	}

	const fn seconds(min: i64, max: i64) -> Self {
		Self { kind: ParamKind::IntegerSeconds, min: Some(min), max: Some(max), allowed: &[] }
	}

	const fn micro() -> Self {
		Self { kind: ParamKind::BigintMicro, min: None, max: None, allowed: &[] }
	}
}

lazy_static! {
	/// Key → shape, enforced before any proposal enters the pipeline.
	static ref PARAM_SCHEMAS: HashMap<&'static str, ParamSchema> = HashMap::from([
		("reservation.default_ttl_seconds", ParamSchema::seconds(1, 86_400)),
		("governance.cooldown_seconds", ParamSchema::seconds(0, 2_592_000)),
		("governance.required_approvals", ParamSchema::integer(1, 10)),
		("budget.default_daily_cap_micro", ParamSchema::micro()),
		("budget.warning_threshold_bps", ParamSchema::integer(0, 10_000)),
		("revenue.commons_bps", ParamSchema::integer(0, 10_000)),
		("revenue.community_bps", ParamSchema::integer(0, 10_000)),
		("revenue.foundation_bps", ParamSchema::integer(0, 10_000)),
		("idempotency.ttl_seconds", ParamSchema::seconds(60, 31_536_000)),
		("kyc.basic_threshold_micro", ParamSchema::micro()),
	]);

	/// Compile-time fallbacks; also the rows seeded on first boot.
	static ref PARAM_DEFAULTS: Vec<(&'static str, Value)> = vec![
		("reservation.default_ttl_seconds", json!(300)),
		("governance.cooldown_seconds", json!(86_400)),
		("governance.required_approvals", json!(2)),
		("budget.default_daily_cap_micro", json!("50000000")),
		("budget.warning_threshold_bps", json!(8_000)),
		("revenue.commons_bps", json!(1_500)),
		("revenue.community_bps", json!(5_000)),
		("revenue.foundation_bps", json!(3_500)),
		("idempotency.ttl_seconds", json!(604_800)),
	];
}

pub fn schema_for(op: &'static str, key: &str) -> Result<&'static ParamSchema> {
	PARAM_SCHEMAS
		.get(key)
		.ok_or_else(|| LedgerError::not_found(op, format!("parameter schema for {key}")))
}

/// Validate a proposed value against the key's schema.
pub fn validate(op: &'static str, key: &str, value: &Value) -> Result<()> {
	let schema = schema_for(op, key)?;
	let bounds_check = |v: i64| -> Result<()> {
		if schema.min.is_some_and(|min| v < min) || schema.max.is_some_and(|max| v > max) {
			return Err(LedgerError::invalid_state(
				op,
				format!("{key}: {v} outside [{:?}, {:?}]", schema.min, schema.max),
			));
		}
		Ok(())
	};

	match schema.kind {
		ParamKind::Integer | ParamKind::IntegerSeconds | ParamKind::IntegerPercent => {
			let v = value.as_i64().ok_or_else(|| {
				LedgerError::invalid_state(op, format!("{key}: expected an integer"))
			})?;
			bounds_check(v)
		},
		ParamKind::BigintMicro => {
			let raw = value.as_str().ok_or_else(|| {
				LedgerError::invalid_state(op, format!("{key}: expected a micro-USD string"))
			})?;
			parse_enforce(raw).map_err(|source| LedgerError::Parse { op, source })?;
			Ok(())
		},
		ParamKind::Real => value
			.as_f64()
			.map(|_| ())
			.ok_or_else(|| LedgerError::invalid_state(op, format!("{key}: expected a number"))),
		ParamKind::StringEnum => {
			let raw = value.as_str().ok_or_else(|| {
				LedgerError::invalid_state(op, format!("{key}: expected a string"))
			})?;
			if schema.allowed.contains(&raw) {
				Ok(())
			} else {
				Err(LedgerError::invalid_state(op, format!("{key}: {raw} not allowed")))
			}
		},
		ParamKind::Nullable => Ok(()),
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRow {
	pub id: i64,
	pub param_key: String,
	pub entity_type: Option<EntityType>,
	pub value: Value,
	pub config_version: i64,
	pub status: ParamStatus,
	pub approval_count: i64,
	pub required_approvals: i64,
	pub cooldown_ends_at: Option<DateTime<Utc>>,
	pub activated_at: Option<DateTime<Utc>>,
}

const CONFIG_COLUMNS: &str = "id, param_key, entity_type, value_json, config_version, status, \
	approval_count, required_approvals, cooldown_ends_at, activated_at";

fn config_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfigRow> {
	Ok(ConfigRow {
		id: row.get(0)?,
		param_key: row.get(1)?,
		entity_type: row
			.get::<_, Option<String>>(2)?
			.map(|raw| parse_discriminant(2, raw))
			.transpose()?,
		value: serde_json::from_str(&row.get::<_, String>(3)?).map_err(|e| {
			rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
		})?,
		config_version: row.get(4)?,
		status: parse_discriminant(5, row.get(5)?)?,
		approval_count: row.get(6)?,
		required_approvals: row.get(7)?,
		cooldown_ends_at: row.get::<_, Option<i64>>(8)?.map(|v| ts_from_db(8, v)).transpose()?,
		activated_at: row.get::<_, Option<i64>>(9)?.map(|v| ts_from_db(9, v)).transpose()?,
	})
}

// ==== transaction-level lookups (shared with the other services) ====

fn active_row(
	tx: &LedgerTx<'_>,
	key: &str,
	entity_type: Option<EntityType>,
) -> Result<Option<ConfigRow>> {
	tx.conn()
		.query_row(
			&format!(
				"SELECT {CONFIG_COLUMNS} FROM system_config
				 WHERE param_key = ?1
				   AND COALESCE(entity_type, '__global__') = COALESCE(?2, '__global__')
				   AND status = 'active'"
			),
			params![key, entity_type.map(|e| e.to_string())],
			config_from_row,
		)
		.optional()
		.store_err(tx.op)
}

/// Active override for (key, entity), else the active global row, else
/// the compile-time fallback.
pub fn get_value(
	tx: &LedgerTx<'_>,
	key: &str,
	entity_type: Option<EntityType>,
) -> Result<Value> {
	if entity_type.is_some() {
		if let Some(row) = active_row(tx, key, entity_type)? {
			return Ok(row.value);
		}
	}
	if let Some(row) = active_row(tx, key, None)? {
		return Ok(row.value);
	}
	PARAM_DEFAULTS
		.iter()
		.find(|(k, _)| *k == key)
		.map(|(_, v)| v.clone())
		.ok_or_else(|| LedgerError::not_found(tx.op, format!("config {key}")))
}

pub fn get_i64(tx: &LedgerTx<'_>, key: &str, entity_type: Option<EntityType>) -> Result<i64> {
	get_value(tx, key, entity_type)?
		.as_i64()
		.ok_or_else(|| LedgerError::invalid_state(tx.op, format!("config {key} is not an integer")))
}

pub fn get_micro(
	tx: &LedgerTx<'_>,
	key: &str,
	entity_type: Option<EntityType>,
) -> Result<credit_primitives::MicroUsd> {
	let value = get_value(tx, key, entity_type)?;
	let raw = value.as_str().ok_or_else(|| {
		LedgerError::invalid_state(tx.op, format!("config {key} is not a micro-USD string"))
	})?;
	parse_enforce(raw).map_err(|source| LedgerError::Parse { op: tx.op, source })
}

fn next_version(tx: &LedgerTx<'_>, key: &str) -> Result<i64> {
	tx.conn()
		.query_row(
			"INSERT INTO system_config_version_seq (param_key, next_version)
			 VALUES (?1, 2)
			 ON CONFLICT (param_key) DO UPDATE SET next_version = next_version + 1
			 RETURNING next_version - 1",
			params![key],
			|row| row.get(0),
		)
		.store_err(tx.op)
}

fn audit(
	tx: &LedgerTx<'_>,
	config_id: i64,
	key: &str,
	from: Option<ParamStatus>,
	to: ParamStatus,
	actor: &str,
) -> Result<()> {
	tx.conn()
		.execute(
			"INSERT INTO system_config_audit
				(config_id, param_key, from_status, to_status, actor, created_at)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
			params![
				config_id,
				key,
				from.map(|s| s.to_string()),
				to.to_string(),
				actor,
				ts_to_db(tx.now)
			],
		)
		.store_err(tx.op)?;
	Ok(())
}

fn config_by_id(tx: &LedgerTx<'_>, id: i64) -> Result<ConfigRow> {
	tx.conn()
		.query_row(
			&format!("SELECT {CONFIG_COLUMNS} FROM system_config WHERE id = ?1"),
			params![id],
			config_from_row,
		)
		.optional()
		.store_err(tx.op)?
		.ok_or_else(|| LedgerError::not_found(tx.op, format!("config row #{id}")))
}

fn set_status(
	tx: &LedgerTx<'_>,
	row: &ConfigRow,
	to: ParamStatus,
	actor: &str,
	cooldown_ends_at: Option<DateTime<Utc>>,
	approval_count: Option<i64>,
) -> Result<()> {
	GOVERNANCE.ensure(tx.op, row.status, to)?;
	tx.conn()
		.execute(
			"UPDATE system_config
			 SET status = ?2,
			     approval_count = COALESCE(?3, approval_count),
			     cooldown_ends_at = COALESCE(?4, cooldown_ends_at),
			     activated_at = CASE WHEN ?2 = 'active' THEN ?5 ELSE activated_at END,
			     updated_at = ?5
			 WHERE id = ?1",
			params![
				row.id,
				to.to_string(),
				approval_count,
				cooldown_ends_at.map(ts_to_db),
				ts_to_db(tx.now)
			],
		)
		.store_err(tx.op)?;
	audit(tx, row.id, &row.param_key, Some(row.status), to, actor)
}

/// The governance service: proposals, approvals, the activator, and
/// first-boot seeding.
pub struct Governance {
	store: Arc<LedgerStore>,
}

impl Governance {
	pub fn new(store: Arc<LedgerStore>) -> Self {
		Self { store }
	}

	/// Seed missing defaults as already-active version-1 rows. Safe to
	/// run on every boot.
	pub fn seed_defaults(&self, actor: &str) -> Result<()> {
		self.store.with_tx("governance_seed", |tx| {
			for (key, value) in PARAM_DEFAULTS.iter() {
				if active_row(tx, key, None)?.is_some() {
					continue;
				}
				let version = next_version(tx, key)?;
				tx.conn()
					.execute(
						"INSERT INTO system_config
							(param_key, entity_type, value_json, config_version, status,
							 approval_count, required_approvals, activated_at, created_at, updated_at)
						 VALUES (?1, NULL, ?2, ?3, 'active', 0, ?4, ?5, ?5, ?5)",
						params![key, value.to_string(), version, 2, ts_to_db(tx.now)],
					)
					.store_err(tx.op)?;
				let id = tx.conn().last_insert_rowid();
				audit(tx, id, key, None, ParamStatus::Active, actor)?;
			}
			Ok(())
		})
	}

	/// Validate and file a proposal at `draft`.
	pub fn propose(
		&self,
		key: &str,
		entity_type: Option<EntityType>,
		value: Value,
		actor: &str,
	) -> Result<ConfigRow> {
		self.store.with_tx("governance_propose", |tx| {
			validate(tx.op, key, &value)?;
			let required = get_i64(tx, "governance.required_approvals", None)?;
			let version = next_version(tx, key)?;
			tx.conn()
				.execute(
					"INSERT INTO system_config
						(param_key, entity_type, value_json, config_version, status,
						 approval_count, required_approvals, created_at, updated_at)
					 VALUES (?1, ?2, ?3, ?4, 'draft', 0, ?5, ?6, ?6)",
					params![
						key,
						entity_type.map(|e| e.to_string()),
						value.to_string(),
						version,
						required,
						ts_to_db(tx.now)
					],
				)
				.store_err(tx.op)?;
			let id = tx.conn().last_insert_rowid();
			audit(tx, id, key, None, ParamStatus::Draft, actor)?;
			tx.emit(
				&EconomicEvent::new(
					EventType::ConfigProposed,
					EntityType::Protocol,
					key,
					json!({ "param_key": key, "value": value, "actor": actor }),
				)
				.at_config_version(version),
			)?;
			config_by_id(tx, id)
		})
	}

	/// Record one approval. The first approval moves draft to
	/// pending_approval; reaching the threshold starts the cooldown.
	pub fn approve(&self, config_id: i64, actor: &str) -> Result<ConfigRow> {
		self.store.with_tx("governance_approve", |tx| {
			let row = config_by_id(tx, config_id)?;
			let approvals = row.approval_count + 1;

			match row.status {
				ParamStatus::Draft => {
					set_status(tx, &row, ParamStatus::PendingApproval, actor, None, Some(approvals))?;
					// A threshold of one starts the cooldown immediately.
					if approvals >= row.required_approvals {
						let row = config_by_id(tx, config_id)?;
						let cooldown =
							Duration::seconds(get_i64(tx, "governance.cooldown_seconds", None)?);
						set_status(
							tx,
							&row,
							ParamStatus::CoolingDown,
							actor,
							Some(tx.now + cooldown),
							Some(approvals),
						)?;
					}
				},
				ParamStatus::PendingApproval if approvals >= row.required_approvals => {
					let cooldown =
						Duration::seconds(get_i64(tx, "governance.cooldown_seconds", None)?);
					set_status(
						tx,
						&row,
						ParamStatus::CoolingDown,
						actor,
						Some(tx.now + cooldown),
						Some(approvals),
					)?;
				},
				ParamStatus::PendingApproval => {
					tx.conn()
						.execute(
							"UPDATE system_config
							 SET approval_count = ?2, updated_at = ?3 WHERE id = ?1",
							params![row.id, approvals, ts_to_db(tx.now)],
						)
						.store_err(tx.op)?;
				},
				status if status.is_terminal() => {
					return Err(LedgerError::TerminalStateViolation {
						op: tx.op,
						state: status.to_string(),
					})
				},
				status => {
					return Err(LedgerError::invalid_state(
						tx.op,
						format!("cannot approve a {status} parameter"),
					))
				},
			}

			tx.emit(
				&EconomicEvent::new(
					EventType::ConfigApproved,
					EntityType::Protocol,
					row.param_key.as_str(),
					json!({ "param_key": row.param_key, "approvals": approvals, "actor": actor }),
				)
				.at_config_version(row.config_version),
			)?;
			config_by_id(tx, config_id)
		})
	}

	pub fn reject(&self, config_id: i64, actor: &str) -> Result<ConfigRow> {
		self.store.with_tx("governance_reject", |tx| {
			let row = config_by_id(tx, config_id)?;
			set_status(tx, &row, ParamStatus::Rejected, actor, None, None)?;
			config_by_id(tx, config_id)
		})
	}

	/// Promote every cooled-down row whose cooldown has lapsed. The same
	/// transaction marks the previously active row of the (key, entity)
	/// pair superseded, so exactly one row is active at every instant.
	/// Returns the activated keys so caches keyed on them can be
	/// invalidated.
	pub fn activate_due(&self) -> Result<Vec<String>> {
		self.store.with_tx("governance_activate", |tx| {
			let due: Vec<ConfigRow> = {
				let mut stmt = tx
					.conn()
					.prepare(&format!(
						"SELECT {CONFIG_COLUMNS} FROM system_config
						 WHERE status = 'cooling_down' AND cooldown_ends_at < ?1
						 ORDER BY cooldown_ends_at ASC"
					))
					.store_err(tx.op)?;
				let rows = stmt
					.query_map(params![ts_to_db(tx.now)], config_from_row)
					.store_err(tx.op)?
					.collect::<rusqlite::Result<Vec<_>>>()
					.store_err(tx.op)?;
				rows
			};

			let mut activated = Vec::new();
			for row in due {
				if let Some(previous) = active_row(tx, &row.param_key, row.entity_type)? {
					set_status(tx, &previous, ParamStatus::Superseded, "activator", None, None)?;
				}
				set_status(tx, &row, ParamStatus::Active, "activator", None, None)?;
				tx.emit(
					&EconomicEvent::new(
						EventType::ConfigActivated,
						EntityType::Protocol,
						row.param_key.as_str(),
						json!({ "param_key": row.param_key, "value": row.value }),
					)
					.at_config_version(row.config_version),
				)?;
				info!(param_key = %row.param_key, version = row.config_version, "config activated");
				activated.push(row.param_key);
			}
			Ok(activated)
		})
	}

	pub fn get(&self, key: &str, entity_type: Option<EntityType>) -> Result<Value> {
		self.store.read("governance_get", |tx| get_value(tx, key, entity_type))
	}
}
