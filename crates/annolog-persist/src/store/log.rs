//! Update log engine.
//!
//! One immutable row per persisted blob. Ordering within a doc is always
//! `(timestamp ASC, id ASC)`; timestamps alone can collide, the monotonic
//! id breaks ties. Rows only ever disappear through compaction (which
//! uses a bounded delete inside its own transaction) or a doc delete.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;

use annolog_types::prelude::*;

use super::{Store, inspect};

/// One persisted update.
#[derive(Clone, Debug)]
pub struct UpdateRecord {
	pub id: i64,
	pub payload: Vec<u8>,
	pub client_id: Option<Box<str>>,
	pub timestamp: DateTime<Utc>,
}

/// Acknowledgement of a durable append.
#[derive(Clone, Copy, Debug)]
pub struct AppendAck {
	pub id: i64,
	pub timestamp: DateTime<Utc>,
	pub size: usize,
}

#[derive(Clone, Debug)]
pub struct LogEngine {
	store: Store,
}

impl LogEngine {
	pub fn new(store: Store) -> Self {
		Self { store }
	}

	/// Insert one update row with a server timestamp. Succeeds iff the
	/// row is durably stored.
	pub async fn append(
		&self,
		doc: &str,
		payload: &[u8],
		client_id: Option<&str>,
	) -> AlResult<AppendAck> {
		let pool = self.store.pool();
		let row = self
			.store
			.with_retry("log.append", || {
				sqlx::query(
					"INSERT INTO updates (doc_name, \"update\", client_id)
					VALUES ($1, $2, $3) RETURNING id, timestamp",
				)
				.bind(doc)
				.bind(payload)
				.bind(client_id)
				.fetch_one(pool)
			})
			.await?;

		Ok(AppendAck {
			id: row.try_get("id").map_err(|_| Error::Db)?,
			timestamp: row.try_get("timestamp").map_err(|_| Error::Db)?,
			size: payload.len(),
		})
	}

	/// All updates for a doc in `(timestamp, id)` ascending order.
	pub async fn read_all(&self, doc: &str) -> AlResult<Vec<UpdateRecord>> {
		let pool = self.store.pool();
		let rows = self
			.store
			.with_retry("log.read_all", || {
				sqlx::query(
					"SELECT id, \"update\", client_id, timestamp FROM updates
					WHERE doc_name = $1 ORDER BY timestamp, id",
				)
				.bind(doc)
				.fetch_all(pool)
			})
			.await?;

		rows.iter().map(map_update_row).collect()
	}

	/// Updates at or after the cutoff, used by `load` to fetch everything
	/// newer than the latest snapshot. The bound is inclusive: re-applying
	/// an update already folded into the snapshot is a CRDT no-op, while
	/// an exclusive bound could skip a row that committed during
	/// compaction with a timestamp at the snapshot boundary.
	pub async fn read_since(
		&self,
		doc: &str,
		cutoff: DateTime<Utc>,
	) -> AlResult<Vec<UpdateRecord>> {
		let pool = self.store.pool();
		let rows = self
			.store
			.with_retry("log.read_since", || {
				sqlx::query(
					"SELECT id, \"update\", client_id, timestamp FROM updates
					WHERE doc_name = $1 AND timestamp >= $2 ORDER BY timestamp, id",
				)
				.bind(doc)
				.bind(cutoff)
				.fetch_all(pool)
			})
			.await?;

		rows.iter().map(map_update_row).collect()
	}

	/// Delete all update rows for a doc. Returns the number removed.
	pub async fn clear(&self, doc: &str) -> AlResult<u64> {
		let pool = self.store.pool();
		let res = self
			.store
			.with_retry("log.clear", || {
				sqlx::query("DELETE FROM updates WHERE doc_name = $1").bind(doc).execute(pool)
			})
			.await?;
		Ok(res.rows_affected())
	}

	/// Delete update rows older than the given timestamp.
	pub async fn delete_before(&self, doc: &str, before: DateTime<Utc>) -> AlResult<u64> {
		let pool = self.store.pool();
		let res = self
			.store
			.with_retry("log.delete_before", || {
				sqlx::query("DELETE FROM updates WHERE doc_name = $1 AND timestamp < $2")
					.bind(doc)
					.bind(before)
					.execute(pool)
			})
			.await?;
		Ok(res.rows_affected())
	}

	/// Cheap aggregates for the compaction decision: row count, summed
	/// payload bytes, oldest and newest timestamps.
	pub async fn stats(&self, doc: &str) -> AlResult<LogStats> {
		let pool = self.store.pool();
		let row = self
			.store
			.with_retry("log.stats", || {
				sqlx::query(
					"SELECT count(*) AS count,
						coalesce(sum(octet_length(\"update\")), 0) AS total_bytes,
						min(timestamp) AS oldest,
						max(timestamp) AS newest
					FROM updates WHERE doc_name = $1",
				)
				.bind(doc)
				.fetch_one(pool)
			})
			.await?;

		Ok(LogStats {
			count: row.try_get("count").map_err(|_| Error::Db)?,
			total_bytes: row.try_get("total_bytes").map_err(|_| Error::Db)?,
			oldest: row.try_get("oldest").map_err(|_| Error::Db)?,
			newest: row.try_get("newest").map_err(|_| Error::Db)?,
		})
	}

	/// Distinct doc names with at least one pending update. Drives the
	/// background compaction sweep.
	pub async fn doc_names(&self) -> AlResult<Vec<Box<str>>> {
		let pool = self.store.pool();
		let rows = self
			.store
			.with_retry("log.doc_names", || {
				sqlx::query("SELECT DISTINCT doc_name FROM updates").fetch_all(pool)
			})
			.await?;

		let mut names = Vec::with_capacity(rows.len());
		for row in &rows {
			names.push(row.try_get("doc_name").inspect_err(inspect).map_err(|_| Error::Db)?);
		}
		Ok(names)
	}
}

/// Aggregates over the pending update log of one doc.
#[derive(Clone, Copy, Debug)]
pub struct LogStats {
	pub count: i64,
	pub total_bytes: i64,
	pub oldest: Option<DateTime<Utc>>,
	pub newest: Option<DateTime<Utc>>,
}

fn map_update_row(row: &PgRow) -> AlResult<UpdateRecord> {
	Ok(UpdateRecord {
		id: row.try_get("id").map_err(|_| Error::Db)?,
		payload: row.try_get("update").map_err(|_| Error::Db)?,
		client_id: row.try_get("client_id").map_err(|_| Error::Db)?,
		timestamp: row.try_get("timestamp").map_err(|_| Error::Db)?,
	})
}

// vim: ts=4
