//! Database access layer.
//!
//! A bounded Postgres pool with explicit transactions, retry handling for
//! transient failures, and a non-throwing health probe. Engines live in
//! the submodules; they share the pool through [`Store`].

use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};

use annolog_types::prelude::*;

use crate::config::StoreConfig;

pub mod compact;
pub mod delete;
pub mod log;
pub mod schema;
pub mod snapshot;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

pub(crate) fn inspect(err: &sqlx::Error) {
	warn!("DB: {:#?}", err);
}

/// Classify a database error as retryable (connection-level, transient)
/// or terminal. Retryable errors stay inside the retry loop and are never
/// surfaced to callers.
fn is_retryable(err: &sqlx::Error) -> bool {
	match err {
		sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
		sqlx::Error::Database(db) => match db.code() {
			// class 08: connection exception; 53300: too many connections;
			// 57P03: cannot connect now
			Some(code) => code.starts_with("08") || code == "53300" || code == "57P03",
			None => false,
		},
		_ => false,
	}
}

fn terminal(err: sqlx::Error) -> Error {
	match err {
		sqlx::Error::RowNotFound => Error::NotFound,
		err => {
			inspect(&err);
			Error::Db
		}
	}
}

/// Pool gauges reported by the health probe.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoolStatus {
	pub total: u32,
	pub idle: usize,
	pub waiting: usize,
}

/// Health probe result. Never an error: an unreachable database yields
/// `healthy: false` with the failure message.
#[derive(Clone, Debug, Serialize)]
pub struct HealthStatus {
	pub healthy: bool,
	pub latency_ms: u64,
	pub pool: PoolStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Store {
	pool: PgPool,
	op_deadline: Duration,
}

impl Store {
	/// Open a bounded pool against the configured database.
	pub async fn connect(config: &StoreConfig) -> AlResult<Self> {
		config.validate()?;

		let pool = PgPoolOptions::new()
			.max_connections(config.pool_size)
			.acquire_timeout(config.acquire_timeout)
			.idle_timeout(config.idle_timeout)
			.connect(&config.url)
			.await
			.inspect_err(inspect)
			.map_err(|_| Error::Db)?;

		Ok(Self { pool, op_deadline: config.op_deadline })
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	/// Begin an explicit transaction. Dropping the transaction without
	/// committing rolls it back, including on panic unwind.
	pub async fn begin(&self) -> AlResult<sqlx::Transaction<'static, sqlx::Postgres>> {
		self.pool.begin().await.inspect_err(inspect).map_err(|_| Error::Db)
	}

	/// Run a database operation with the per-call deadline and up to three
	/// attempts with exponential backoff on retryable failures.
	pub async fn with_retry<T, F, Fut>(&self, label: &str, op: F) -> AlResult<T>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, sqlx::Error>>,
	{
		let mut delay = RETRY_INITIAL_DELAY;
		let mut timed_out = false;

		for attempt in 1..=RETRY_ATTEMPTS {
			match tokio::time::timeout(self.op_deadline, op()).await {
				Ok(Ok(value)) => return Ok(value),
				Ok(Err(err)) => {
					if !is_retryable(&err) {
						return Err(terminal(err));
					}
					timed_out = false;
					warn!(
						"{}: transient database error (attempt {}/{}): {}",
						label, attempt, RETRY_ATTEMPTS, err
					);
				}
				Err(_) => {
					timed_out = true;
					warn!(
						"{}: database call exceeded {}ms deadline (attempt {}/{})",
						label,
						self.op_deadline.as_millis(),
						attempt,
						RETRY_ATTEMPTS
					);
				}
			}

			if attempt < RETRY_ATTEMPTS {
				tokio::time::sleep(delay).await;
				delay *= 2;
			}
		}

		Err(if timed_out { Error::Timeout } else { Error::Db })
	}

	/// Trivial round-trip probe plus pool gauges. sqlx exposes no waiter
	/// count, so `waiting` is reported as zero.
	pub async fn health(&self) -> HealthStatus {
		let pool = PoolStatus {
			total: self.pool.size(),
			idle: self.pool.num_idle(),
			waiting: 0,
		};

		let started = Instant::now();
		let probe = tokio::time::timeout(
			self.op_deadline,
			sqlx::query("SELECT now()").execute(&self.pool),
		)
		.await;
		let latency_ms = started.elapsed().as_millis() as u64;

		match probe {
			Ok(Ok(_)) => HealthStatus { healthy: true, latency_ms, pool, error: None },
			Ok(Err(err)) => HealthStatus {
				healthy: false,
				latency_ms,
				pool,
				error: Some(err.to_string()),
			},
			Err(_) => HealthStatus {
				healthy: false,
				latency_ms,
				pool,
				error: Some("health probe timed out".into()),
			},
		}
	}

	/// Close the pool. Installed at the process edge as part of graceful
	/// shutdown, after the batching writer has drained.
	pub async fn close(&self) {
		self.pool.close().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_connection_errors_as_retryable() {
		let io = sqlx::Error::Io(std::io::Error::new(
			std::io::ErrorKind::ConnectionRefused,
			"connection refused",
		));
		assert!(is_retryable(&io));
		assert!(is_retryable(&sqlx::Error::PoolTimedOut));
	}

	#[test]
	fn classifies_logic_errors_as_terminal() {
		assert!(!is_retryable(&sqlx::Error::RowNotFound));
		assert!(!is_retryable(&sqlx::Error::ColumnNotFound("missing".into())));
	}

	#[test]
	fn terminal_maps_row_not_found() {
		assert!(matches!(terminal(sqlx::Error::RowNotFound), Error::NotFound));
		assert!(matches!(terminal(sqlx::Error::PoolClosed), Error::Db));
	}
}

// vim: ts=4
