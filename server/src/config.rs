//! Environment configuration.
//!
//! All knobs come from the environment; `DATABASE_URL` is mandatory and
//! the process refuses to start without it. Every parse failure is a
//! `Error::Config` naming the offending variable.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use annolog_persist::config::{BatchConfig, CompactionConfig, StoreConfig};
use annolog_types::prelude::*;

#[derive(Clone, Debug)]
pub struct Config {
	pub listen: String,
	pub store: StoreConfig,
	pub batch: BatchConfig,
	pub compaction: CompactionConfig,
}

impl Config {
	pub fn from_env() -> AlResult<Self> {
		let url = env::var("DATABASE_URL")
			.ok()
			.filter(|v| !v.is_empty())
			.ok_or_else(|| Error::Config("DATABASE_URL is not set".into()))?;

		let mut store = StoreConfig::new(url);
		store.pool_size = parse_var("DB_POOL_SIZE", store.pool_size)?;
		store.idle_timeout = secs_var("DB_IDLE_TIMEOUT_SECS", store.idle_timeout)?;
		store.acquire_timeout = secs_var("DB_ACQUIRE_TIMEOUT_SECS", store.acquire_timeout)?;
		store.validate()?;

		let preset = env::var("BATCH_PRESET").unwrap_or_else(|_| "web".to_string());
		let batch = BatchConfig::preset(&preset)?;

		let mut compaction = CompactionConfig::default();
		compaction.update_threshold =
			parse_var("COMPACT_UPDATE_THRESHOLD", compaction.update_threshold)?;
		compaction.size_threshold =
			parse_var("COMPACT_SIZE_THRESHOLD", compaction.size_threshold)?;
		compaction.age_threshold =
			secs_var("COMPACT_AGE_THRESHOLD_SECS", compaction.age_threshold)?;
		compaction.keep_snapshots = parse_var("KEEP_SNAPSHOTS", compaction.keep_snapshots)?;
		compaction.auto_compact = parse_var("AUTO_COMPACT", compaction.auto_compact)?;
		compaction.sweep_interval = secs_var("SWEEP_INTERVAL_SECS", compaction.sweep_interval)?;
		compaction.validate()?;

		let listen = env::var("LISTEN").unwrap_or_else(|_| "127.0.0.1:7410".to_string());

		Ok(Self { listen, store, batch, compaction })
	}
}

fn parse_var<T: FromStr>(name: &str, default: T) -> AlResult<T> {
	match env::var(name) {
		Ok(raw) if !raw.is_empty() => raw
			.parse()
			.map_err(|_| Error::Config(format!("invalid value for {}: '{}'", name, raw))),
		_ => Ok(default),
	}
}

fn secs_var(name: &str, default: Duration) -> AlResult<Duration> {
	let secs: u64 = parse_var(name, default.as_secs())?;
	Ok(Duration::from_secs(secs))
}

// vim: ts=4
