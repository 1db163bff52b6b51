//! The credit-engine worker daemon.
//!
//! Boots the store, seeds governance defaults, and runs the periodic
//! workers (reservation expiry, idempotency TTL, governance activation,
//! reconciliation, lot-expiry audit). The request-facing API is a
//! library surface consumed by the transport layer; this binary only
//! keeps the ledger healthy.

use anyhow::Context;
use clap::Parser;
use credit_engine::{
	clock::SystemClock,
	counter::{ChainedCounter, CounterBackend, InMemoryCounter, RedisCounter, SqliteCounter},
	distribution::RevenueDistribution,
	governance::Governance,
	logging,
	reconciliation::Reconciler,
	reservation::ReservationEngine,
	settings::{CommandLineOptions, Settings},
	store::LedgerStore,
	sweepers::{
		self, GovernanceActivator, IdempotencySweeper, LotExpiryAuditor, ReconciliationJob,
	},
};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = CommandLineOptions::parse();
	logging::init();

	let settings = Settings::new(&opts).context("Failed to load settings")?;
	info!(db = %settings.database.path, mode = ?settings.parsing.mode, "starting credit-engine");

	let clock = Arc::new(SystemClock);
	let store = Arc::new(
		LedgerStore::open(Path::new(&settings.database.path), clock)
			.context("Failed to open the ledger database")?,
	);

	let governance = Arc::new(Governance::new(store.clone()));
	governance.seed_defaults("bootstrap").context("Failed to seed governance defaults")?;

	let distribution = Arc::new(RevenueDistribution::new());
	let reservations = Arc::new(ReservationEngine::new(store.clone(), distribution.clone()));
	let reconciler = Arc::new(Reconciler::new(store.clone()));

	// Counter chain: redis (when configured) in front of the durable
	// sqlite tier, memory as bootstrap.
	let mut backends: Vec<Arc<dyn CounterBackend>> = Vec::new();
	if let Some(url) = &settings.redis.url {
		backends
			.push(Arc::new(RedisCounter::new(url, "credit-engine", 86_400).context("redis counter")?));
	}
	backends.push(Arc::new(
		SqliteCounter::open(Path::new(&settings.database.path)).context("sqlite counter")?,
	));
	backends.push(Arc::new(InMemoryCounter::default()));
	let counters = Arc::new(ChainedCounter::new(backends));
	let carried_divergences = counters.get("parse_divergence:store").await.unwrap_or(0);
	info!(carried_divergences, "counter chain ready");

	let intervals = &settings.sweepers;
	tokio::spawn(sweepers::run_periodic(
		"reservation-expiry",
		Duration::from_secs(intervals.reservation_expiry_seconds),
		reservations,
	));
	tokio::spawn(sweepers::run_periodic(
		"idempotency-ttl",
		Duration::from_secs(intervals.idempotency_ttl_seconds),
		Arc::new(IdempotencySweeper::new(store.clone())),
	));
	tokio::spawn(sweepers::run_periodic(
		"governance-activator",
		Duration::from_secs(intervals.governance_activation_seconds),
		Arc::new(GovernanceActivator::new(governance, distribution)),
	));
	tokio::spawn(sweepers::run_periodic(
		"reconciliation",
		Duration::from_secs(intervals.reconciliation_seconds),
		Arc::new(ReconciliationJob::new(reconciler)),
	));
	tokio::spawn(sweepers::run_periodic(
		"lot-expiry-audit",
		Duration::from_secs(intervals.reservation_expiry_seconds),
		Arc::new(LotExpiryAuditor::new(store)),
	));

	tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
	info!("shutting down");
	Ok(())
}
