//! Engine settings: a TOML file merged with command line overrides.

use clap::Parser;
use config::{Config, ConfigError, File};
use credit_primitives::ParseMode;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
	/// Path of the sqlite database file.
	pub path: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Redis {
	/// Redis URL for the distributed counter backend. Absent means the
	/// chain runs without the cache tier.
	pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Parsing {
	/// Boundary parser posture; shadow during migration.
	pub mode: ParseMode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Sweepers {
	pub reservation_expiry_seconds: u64,
	pub idempotency_ttl_seconds: u64,
	pub governance_activation_seconds: u64,
	pub reconciliation_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub database: Database,
	#[serde(default)]
	pub redis: Redis,
	pub parsing: Parsing,
	pub sweepers: Sweepers,
}

#[derive(Parser, Debug, Clone)]
pub struct CommandLineOptions {
	/// Path to the settings file.
	#[clap(long = "config", default_value = "config/engine.toml")]
	pub config_path: String,

	/// Override the database path from the settings file.
	#[clap(long = "db-path")]
	pub db_path: Option<String>,
}

impl Settings {
	pub fn new(opts: &CommandLineOptions) -> Result<Self, ConfigError> {
		let mut builder = Config::builder()
			.set_default("database.path", "credit-ledger.db")?
			.set_default("parsing.mode", "shadow")?
			.set_default("sweepers.reservation_expiry_seconds", 30u64)?
			.set_default("sweepers.idempotency_ttl_seconds", 3600u64)?
			.set_default("sweepers.governance_activation_seconds", 60u64)?
			.set_default("sweepers.reconciliation_seconds", 900u64)?
			.add_source(File::with_name(&opts.config_path).required(false));

		if let Some(db_path) = &opts.db_path {
			builder = builder.set_override("database.path", db_path.clone())?;
		}

		builder.build()?.try_deserialize()
	}
}
