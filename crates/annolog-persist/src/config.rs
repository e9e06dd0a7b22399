//! Configuration for the store, the batching writer, and compaction.
//!
//! Values mirror the service defaults; the server crate maps environment
//! variables onto these structs at startup and rejects invalid settings
//! with `Error::Config` before anything touches the database.

use std::time::Duration;

use annolog_types::prelude::*;

// Store //
//*******//
#[derive(Clone, Debug)]
pub struct StoreConfig {
	/// Postgres connection URL. Mandatory; the service refuses to start
	/// without it.
	pub url: String,
	/// Hard cap on pooled connections.
	pub pool_size: u32,
	/// Close idle connections after this long.
	pub idle_timeout: Duration,
	/// Fail `acquire` after this long.
	pub acquire_timeout: Duration,
	/// Per-operation deadline applied to every database call.
	pub op_deadline: Duration,
}

impl StoreConfig {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			pool_size: 10,
			idle_timeout: Duration::from_secs(30),
			acquire_timeout: Duration::from_secs(2),
			op_deadline: Duration::from_secs(5),
		}
	}

	pub fn validate(&self) -> AlResult<()> {
		if self.url.is_empty() {
			return Err(Error::Config("database URL must not be empty".into()));
		}
		if self.pool_size == 0 {
			return Err(Error::Config("pool size must be at least 1".into()));
		}
		Ok(())
	}
}

// Batching writer //
//*****************//
#[derive(Clone, Debug)]
pub struct BatchConfig {
	/// Flush as soon as this many updates are pending.
	pub max_batch_count: usize,
	/// Flush as soon as the pending payload bytes reach this.
	pub max_batch_bytes: usize,
	/// Hard deadline from the first enqueue of a batch. Never re-armed by
	/// subsequent enqueues.
	pub batch_timeout: Duration,
	/// Quiet-period timer, re-armed on every enqueue.
	pub debounce: Duration,
	/// Merge pending blobs through the codec before appending.
	pub coalesce: bool,
	/// Broadcast enqueue/flush events. Disabled for quiet test runs.
	pub emit_events: bool,
}

impl BatchConfig {
	/// Browser-facing deployments: larger batches, generous timers.
	pub fn web() -> Self {
		Self {
			max_batch_count: 100,
			max_batch_bytes: 1024 * 1024,
			batch_timeout: Duration::from_millis(2000),
			debounce: Duration::from_millis(300),
			coalesce: true,
			emit_events: true,
		}
	}

	/// Embedded/desktop deployments: tighter memory and latency bounds.
	pub fn embedded() -> Self {
		Self {
			max_batch_count: 50,
			max_batch_bytes: 256 * 1024,
			batch_timeout: Duration::from_millis(500),
			debounce: Duration::from_millis(100),
			coalesce: true,
			emit_events: true,
		}
	}

	/// Test profile: tiny thresholds so every path triggers quickly.
	pub fn test() -> Self {
		Self {
			max_batch_count: 10,
			max_batch_bytes: 10 * 1024,
			batch_timeout: Duration::from_millis(100),
			debounce: Duration::from_millis(20),
			coalesce: true,
			emit_events: true,
		}
	}

	pub fn preset(name: &str) -> AlResult<Self> {
		match name {
			"web" => Ok(Self::web()),
			"embedded" => Ok(Self::embedded()),
			"test" => Ok(Self::test()),
			other => Err(Error::Config(format!("unknown batching preset '{}'", other))),
		}
	}

	pub fn validate(&self) -> AlResult<()> {
		if self.max_batch_count < 1 {
			return Err(Error::Config("max_batch_count must be at least 1".into()));
		}
		if self.max_batch_bytes < 1 {
			return Err(Error::Config("max_batch_bytes must be at least 1".into()));
		}
		if self.batch_timeout.is_zero() {
			return Err(Error::Config("batch_timeout must be greater than zero".into()));
		}
		// debounce may be zero: flush on the next timer tick
		Ok(())
	}
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self::web()
	}
}

// Compaction //
//************//
#[derive(Clone, Debug)]
pub struct CompactionConfig {
	/// Compact once this many updates have accumulated.
	pub update_threshold: i64,
	/// Compact once the summed payload bytes reach this.
	pub size_threshold: i64,
	/// Compact once the oldest update is older than this.
	pub age_threshold: Duration,
	/// Snapshots retained per doc after pruning.
	pub keep_snapshots: i64,
	/// Run the non-blocking threshold check after every append.
	pub auto_compact: bool,
	/// Interval of the background sweep over all docs.
	pub sweep_interval: Duration,
}

impl Default for CompactionConfig {
	fn default() -> Self {
		Self {
			update_threshold: 100,
			size_threshold: 1024 * 1024,
			age_threshold: Duration::from_secs(24 * 60 * 60),
			keep_snapshots: 3,
			auto_compact: true,
			sweep_interval: Duration::from_secs(5 * 60),
		}
	}
}

impl CompactionConfig {
	pub fn validate(&self) -> AlResult<()> {
		if self.update_threshold < 1 {
			return Err(Error::Config("update_threshold must be at least 1".into()));
		}
		if self.size_threshold < 1 {
			return Err(Error::Config("size_threshold must be at least 1".into()));
		}
		if self.keep_snapshots < 1 {
			return Err(Error::Config("keep_snapshots must be at least 1".into()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn presets_match_profiles() {
		let web = BatchConfig::web();
		assert_eq!(web.max_batch_count, 100);
		assert_eq!(web.max_batch_bytes, 1024 * 1024);
		assert_eq!(web.batch_timeout, Duration::from_millis(2000));
		assert_eq!(web.debounce, Duration::from_millis(300));
		assert!(web.coalesce);

		let embedded = BatchConfig::embedded();
		assert_eq!(embedded.max_batch_count, 50);
		assert_eq!(embedded.batch_timeout, Duration::from_millis(500));

		let test = BatchConfig::test();
		assert_eq!(test.max_batch_count, 10);
		assert_eq!(test.max_batch_bytes, 10 * 1024);
	}

	#[test]
	fn preset_lookup_rejects_unknown_names() {
		assert!(matches!(BatchConfig::preset("mobile"), Err(Error::Config(_))));
		assert!(BatchConfig::preset("embedded").is_ok());
	}

	#[test]
	fn batch_validation_rejects_degenerate_configs() {
		let mut config = BatchConfig::test();
		config.max_batch_count = 0;
		assert!(matches!(config.validate(), Err(Error::Config(_))));

		let mut config = BatchConfig::test();
		config.max_batch_bytes = 0;
		assert!(matches!(config.validate(), Err(Error::Config(_))));

		let mut config = BatchConfig::test();
		config.batch_timeout = Duration::ZERO;
		assert!(matches!(config.validate(), Err(Error::Config(_))));

		let mut config = BatchConfig::test();
		config.debounce = Duration::ZERO;
		assert!(config.validate().is_ok());
	}

	#[test]
	fn store_validation_requires_url() {
		assert!(matches!(StoreConfig::new("").validate(), Err(Error::Config(_))));
		assert!(StoreConfig::new("postgres://localhost/annolog").validate().is_ok());
	}
}

// vim: ts=4
