//! Snapshot engine.
//!
//! A snapshot row holds a full CRDT state encoding plus a SHA-256
//! checksum over it. Saves are idempotent by checksum: writing a blob
//! that already exists for the doc returns the existing row instead of
//! inserting a duplicate. At most K snapshots are retained per doc,
//! newest kept.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use annolog_types::prelude::*;

use super::Store;

/// Lowercase hex SHA-256 of a state blob.
pub fn checksum_hex(data: &[u8]) -> String {
	use std::fmt::Write;

	let digest = Sha256::digest(data);
	let mut out = String::with_capacity(digest.len() * 2);
	for byte in digest {
		let _ = write!(out, "{:02x}", byte);
	}
	out
}

/// One stored snapshot, metadata plus state blob.
#[derive(Clone, Debug)]
pub struct SnapshotRecord {
	pub id: Uuid,
	pub note_id: Option<Uuid>,
	pub state: Vec<u8>,
	pub checksum: Box<str>,
	pub update_count: Option<i32>,
	pub size_bytes: Option<i32>,
	pub panels: Option<serde_json::Value>,
	pub created_at: DateTime<Utc>,
}

/// Result of a save: either a fresh row or the pre-existing duplicate.
#[derive(Clone, Debug)]
pub struct SavedSnapshot {
	pub id: Uuid,
	pub checksum: Box<str>,
	pub created_at: DateTime<Utc>,
	pub size: usize,
	pub duplicate: bool,
}

/// Everything `save` needs beyond doc name and blob.
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
	/// Caller-computed checksum; a mismatch with the server-computed
	/// value rejects the write.
	pub expected_checksum: Option<String>,
	/// Opaque panel layout sidecar, stored verbatim.
	pub panels: Option<serde_json::Value>,
	/// Number of updates folded into this snapshot, if known.
	pub update_count: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct SnapshotEngine {
	store: Store,
}

impl SnapshotEngine {
	pub fn new(store: Store) -> Self {
		Self { store }
	}

	/// Insert a snapshot row, verifying integrity first. Idempotent: if a
	/// snapshot with the same checksum already exists for the doc, no row
	/// is written and the existing one is returned with `duplicate: true`.
	pub async fn save(
		&self,
		doc: &DocName,
		state: &[u8],
		opts: SaveOptions,
	) -> AlResult<SavedSnapshot> {
		if state.is_empty() {
			return Err(Error::Validation("snapshot must not be empty".into()));
		}

		let checksum = checksum_hex(state);
		if let Some(expected) = &opts.expected_checksum {
			if !expected.eq_ignore_ascii_case(&checksum) {
				return Err(Error::Validation(format!(
					"checksum mismatch: expected {}, computed {}",
					expected, checksum
				)));
			}
		}

		if let Some(existing) = self.by_checksum(doc.as_str(), &checksum).await? {
			debug!("snapshot for {} already stored (checksum {})", doc, checksum);
			return Ok(SavedSnapshot {
				id: existing.id,
				checksum: existing.checksum,
				created_at: existing.created_at,
				size: existing.state.len(),
				duplicate: true,
			});
		}

		let id = Uuid::new_v4();
		let note_id = doc.note_id().and_then(|raw| Uuid::parse_str(raw).ok());
		let size = state.len();

		let pool = self.store.pool();
		let row = self
			.store
			.with_retry("snapshot.save", || {
				sqlx::query(
					"INSERT INTO snapshots
						(id, note_id, doc_name, state, checksum, update_count, size_bytes, panels)
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
					RETURNING created_at",
				)
				.bind(id)
				.bind(note_id)
				.bind(doc.as_str())
				.bind(state)
				.bind(&checksum)
				.bind(opts.update_count)
				.bind(size as i32)
				.bind(&opts.panels)
				.fetch_one(pool)
			})
			.await?;

		Ok(SavedSnapshot {
			id,
			checksum: checksum.into(),
			created_at: row.try_get("created_at").map_err(|_| Error::Db)?,
			size,
			duplicate: false,
		})
	}

	/// The most recent snapshot for a doc, if any.
	pub async fn latest(&self, doc: &str) -> AlResult<Option<SnapshotRecord>> {
		let pool = self.store.pool();
		let row = self
			.store
			.with_retry("snapshot.latest", || {
				sqlx::query(
					"SELECT id, note_id, state, checksum, update_count, size_bytes, panels, created_at
					FROM snapshots WHERE doc_name = $1
					ORDER BY created_at DESC, id DESC LIMIT 1",
				)
				.bind(doc)
				.fetch_optional(pool)
			})
			.await?;

		row.as_ref().map(map_snapshot_row).transpose()
	}

	/// Look a snapshot up by its checksum, for idempotent saves.
	pub async fn by_checksum(
		&self,
		doc: &str,
		checksum: &str,
	) -> AlResult<Option<SnapshotRecord>> {
		let pool = self.store.pool();
		let row = self
			.store
			.with_retry("snapshot.by_checksum", || {
				sqlx::query(
					"SELECT id, note_id, state, checksum, update_count, size_bytes, panels, created_at
					FROM snapshots WHERE doc_name = $1 AND checksum = $2
					ORDER BY created_at DESC, id DESC LIMIT 1",
				)
				.bind(doc)
				.bind(checksum)
				.fetch_optional(pool)
			})
			.await?;

		row.as_ref().map(map_snapshot_row).transpose()
	}

	/// Delete all but the newest `keep` snapshots. Returns the number
	/// removed.
	pub async fn prune_to_last(&self, doc: &str, keep: i64) -> AlResult<u64> {
		if keep < 1 {
			return Err(Error::Validation("keepLast must be at least 1".into()));
		}
		let pool = self.store.pool();
		let res = self
			.store
			.with_retry("snapshot.prune", || {
				sqlx::query(
					"DELETE FROM snapshots WHERE doc_name = $1 AND id NOT IN (
						SELECT id FROM snapshots WHERE doc_name = $1
						ORDER BY created_at DESC, id DESC LIMIT $2
					)",
				)
				.bind(doc)
				.bind(keep)
				.execute(pool)
			})
			.await?;
		Ok(res.rows_affected())
	}

	/// Number of stored snapshots for a doc.
	pub async fn count(&self, doc: &str) -> AlResult<i64> {
		let pool = self.store.pool();
		let row = self
			.store
			.with_retry("snapshot.count", || {
				sqlx::query("SELECT count(*) AS count FROM snapshots WHERE doc_name = $1")
					.bind(doc)
					.fetch_one(pool)
			})
			.await?;
		row.try_get("count").map_err(|_| Error::Db)
	}
}

pub(crate) fn map_snapshot_row(row: &PgRow) -> AlResult<SnapshotRecord> {
	Ok(SnapshotRecord {
		id: row.try_get("id").map_err(|_| Error::Db)?,
		note_id: row.try_get("note_id").map_err(|_| Error::Db)?,
		state: row.try_get("state").map_err(|_| Error::Db)?,
		checksum: row.try_get("checksum").map_err(|_| Error::Db)?,
		update_count: row.try_get("update_count").map_err(|_| Error::Db)?,
		size_bytes: row.try_get("size_bytes").map_err(|_| Error::Db)?,
		panels: row.try_get("panels").map_err(|_| Error::Db)?,
		created_at: row.try_get("created_at").map_err(|_| Error::Db)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn checksum_is_lowercase_hex_sha256() {
		// sha256("") and sha256("abc") are well-known vectors
		assert_eq!(
			checksum_hex(b""),
			"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
		);
		assert_eq!(
			checksum_hex(b"abc"),
			"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
		);
	}

	#[test]
	fn checksum_differs_on_different_blobs() {
		assert_ne!(checksum_hex(b"one"), checksum_hex(b"two"));
	}
}

// vim: ts=4
