//! Compaction engine.
//!
//! Replaces the accumulated update log of a doc with a single snapshot,
//! atomically. The whole algorithm runs inside one transaction: the log
//! shortens only if the snapshot write committed with it, so a crash at
//! any point leaves either the old log or the new snapshot, never
//! neither.
//!
//! Updates that commit while a compaction is running survive it: the
//! delete is bounded to the `(timestamp, id)` of the last row the
//! transaction actually read, never a blanket truncate.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use annolog_types::prelude::*;

use crate::codec;
use crate::config::CompactionConfig;

use super::log::LogEngine;
use super::snapshot::{SnapshotEngine, checksum_hex};
use super::{Store, inspect};

/// Outcome of a compaction request.
#[derive(Clone, Debug)]
pub enum CompactOutcome {
	Compacted { count: i64, checksum: Box<str>, size: usize },
	Skipped { update_count: i64 },
}

/// Read-only view of a doc's compaction state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactStatus {
	pub update_count: i64,
	pub total_bytes: i64,
	pub oldest_update: Option<DateTime<Utc>>,
	pub newest_update: Option<DateTime<Utc>>,
	pub snapshot_count: i64,
	pub latest_checksum: Option<Box<str>>,
	pub latest_snapshot_at: Option<DateTime<Utc>>,
	pub recommended: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<&'static str>,
}

#[derive(Debug)]
pub struct Compactor {
	store: Store,
	log: LogEngine,
	snapshots: SnapshotEngine,
	config: CompactionConfig,
	/// Compactions are serialized per doc, not globally.
	locks: DashMap<Box<str>, Arc<Mutex<()>>>,
}

impl Compactor {
	pub fn new(store: Store, config: CompactionConfig) -> Self {
		Self {
			log: LogEngine::new(store.clone()),
			snapshots: SnapshotEngine::new(store.clone()),
			store,
			config,
			locks: DashMap::new(),
		}
	}

	pub fn config(&self) -> &CompactionConfig {
		&self.config
	}

	fn doc_lock(&self, doc: &str) -> Arc<Mutex<()>> {
		self.locks
			.entry(doc.into())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone()
	}

	/// Threshold decision: compact when the update count, the summed
	/// payload size, or the age of the oldest update crosses its bound.
	fn recommend(&self, count: i64, total_bytes: i64, oldest: Option<DateTime<Utc>>) -> Option<&'static str> {
		if count >= self.config.update_threshold {
			return Some("count");
		}
		if total_bytes >= self.config.size_threshold {
			return Some("size");
		}
		if count >= 1 {
			if let Some(oldest) = oldest {
				let age = Utc::now().signed_duration_since(oldest);
				if age.num_seconds() >= self.config.age_threshold.as_secs() as i64 {
					return Some("age");
				}
			}
		}
		None
	}

	/// Read-only status for the `GET /persistence/compact` surface.
	pub async fn status(&self, doc: &str) -> AlResult<CompactStatus> {
		let log_stats = self.log.stats(doc).await?;
		let snapshot_count = self.snapshots.count(doc).await?;

		let pool = self.store.pool();
		let latest = self
			.store
			.with_retry("compact.status.latest", || {
				sqlx::query(
					"SELECT checksum, created_at FROM snapshots WHERE doc_name = $1
					ORDER BY created_at DESC, id DESC LIMIT 1",
				)
				.bind(doc)
				.fetch_optional(pool)
			})
			.await?;
		let (latest_checksum, latest_snapshot_at) = match latest {
			Some(row) => (
				Some(row.try_get("checksum").map_err(|_| Error::Db)?),
				Some(row.try_get("created_at").map_err(|_| Error::Db)?),
			),
			None => (None, None),
		};

		let reason = self.recommend(log_stats.count, log_stats.total_bytes, log_stats.oldest);

		Ok(CompactStatus {
			update_count: log_stats.count,
			total_bytes: log_stats.total_bytes,
			oldest_update: log_stats.oldest,
			newest_update: log_stats.newest,
			snapshot_count,
			latest_checksum,
			latest_snapshot_at,
			recommended: reason.is_some(),
			reason,
		})
	}

	/// Merge the accumulated updates of a doc into one snapshot and drop
	/// the consumed update range, all in one transaction. With
	/// `force: false` the threshold decision applies first.
	///
	/// The engine itself never retries; a failed transaction rolls back
	/// and the caller may try again.
	pub async fn compact(&self, doc: &str, force: bool) -> AlResult<CompactOutcome> {
		let lock = self.doc_lock(doc);
		let _guard = lock.lock().await;
		let started = Instant::now();

		if !force {
			let status = self.status(doc).await?;
			if !status.recommended {
				return Ok(CompactOutcome::Skipped { update_count: status.update_count });
			}
		}

		let mut tx = self.store.begin().await?;

		// 1. latest snapshot, if any
		let base = sqlx::query(
			"SELECT state FROM snapshots WHERE doc_name = $1
			ORDER BY created_at DESC, id DESC LIMIT 1",
		)
		.bind(doc)
		.fetch_optional(&mut *tx)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::Db)?;
		let base_state: Option<Vec<u8>> = base
			.map(|row| row.try_get("state").map_err(|_| Error::Db))
			.transpose()?;

		// 2. every update this transaction can see, in log order
		let rows = sqlx::query(
			"SELECT id, \"update\", timestamp FROM updates
			WHERE doc_name = $1 ORDER BY timestamp, id",
		)
		.bind(doc)
		.fetch_all(&mut *tx)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::Db)?;

		if rows.is_empty() {
			// nothing to fold; commit the no-op
			tx.commit().await.inspect_err(inspect).map_err(|_| Error::Db)?;
			return Ok(CompactOutcome::Skipped { update_count: 0 });
		}

		let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(rows.len());
		for row in &rows {
			payloads.push(row.try_get("update").map_err(|_| Error::Db)?);
		}
		let last = &rows[rows.len() - 1];
		let cut_ts: DateTime<Utc> = last.try_get("timestamp").map_err(|_| Error::Db)?;
		let cut_id: i64 = last.try_get("id").map_err(|_| Error::Db)?;
		let count = rows.len() as i64;

		// 3-4. rebuild and re-encode
		let state = codec::fold(base_state.as_deref(), &payloads)?;
		let checksum = checksum_hex(&state);
		let size = state.len();

		// 5. write the snapshot
		let snapshot_id = Uuid::new_v4();
		let note_id = DocName::new(doc).ok().and_then(|d| {
			d.note_id().and_then(|raw| Uuid::parse_str(raw).ok())
		});
		sqlx::query(
			"INSERT INTO snapshots
				(id, note_id, doc_name, state, checksum, update_count, size_bytes)
			VALUES ($1, $2, $3, $4, $5, $6, $7)",
		)
		.bind(snapshot_id)
		.bind(note_id)
		.bind(doc)
		.bind(&state)
		.bind(&checksum)
		.bind(count as i32)
		.bind(size as i32)
		.execute(&mut *tx)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::Db)?;

		// 6. bounded delete: only the rows read in step 2. A concurrent
		// append lands above the cut and survives.
		sqlx::query(
			"DELETE FROM updates WHERE doc_name = $1 AND (timestamp, id) <= ($2, $3)",
		)
		.bind(doc)
		.bind(cut_ts)
		.bind(cut_id)
		.execute(&mut *tx)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::Db)?;

		// 7. retention
		sqlx::query(
			"DELETE FROM snapshots WHERE doc_name = $1 AND id NOT IN (
				SELECT id FROM snapshots WHERE doc_name = $1
				ORDER BY created_at DESC, id DESC LIMIT $2
			)",
		)
		.bind(doc)
		.bind(self.config.keep_snapshots)
		.execute(&mut *tx)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::Db)?;

		// 8. observability entry
		let duration_ms = started.elapsed().as_millis() as i32;
		sqlx::query(
			"INSERT INTO compaction_log
				(id, doc_name, updates_before, updates_after, snapshot_size, duration_ms)
			VALUES ($1, $2, $3, 0, $4, $5)",
		)
		.bind(Uuid::new_v4())
		.bind(doc)
		.bind(count as i32)
		.bind(size as i32)
		.bind(duration_ms)
		.execute(&mut *tx)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::Db)?;

		// 9. commit
		tx.commit().await.inspect_err(inspect).map_err(|_| Error::Db)?;

		info!(
			"compacted {}: {} updates -> {} byte snapshot in {}ms",
			doc, count, size, duration_ms
		);

		Ok(CompactOutcome::Compacted { count, checksum: checksum.into(), size })
	}

	/// Post-append trigger: compact if a threshold is crossed, swallowing
	/// nothing - the caller decides what to do with errors.
	pub async fn compact_if_needed(&self, doc: &str) -> AlResult<CompactOutcome> {
		self.compact(doc, false).await
	}

	/// Background sweep over every doc with pending updates. Returns the
	/// number of docs compacted; per-doc failures are logged and the
	/// sweep moves on.
	pub async fn sweep(&self) -> AlResult<u32> {
		let docs = self.log.doc_names().await?;

		let mut compacted = 0u32;
		for doc in docs {
			match self.compact(&doc, false).await {
				Ok(CompactOutcome::Compacted { count, size, .. }) => {
					debug!("sweep compacted {}: {} updates, {} bytes", doc, count, size);
					compacted += 1;
				}
				Ok(CompactOutcome::Skipped { .. }) => {}
				Err(err) => warn!("sweep: compaction of {} failed: {}", doc, err),
			}
		}
		Ok(compacted)
	}
}

// vim: ts=4
