//! Service facade.
//!
//! The one public surface over the engines. Validates inputs, keeps the
//! flush-before-read discipline (readers and destructive operations see a
//! log that includes everything acknowledged before them), and emits one
//! structured log line per operation.
//!
//! The service is an explicitly constructed object; lifetime management
//! (signal handling, shutdown ordering) belongs to the process edge.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use annolog_types::prelude::*;

use crate::batch::{BatchStats, BatchWriter, FlushReason, UpdateSink};
use crate::codec;
use crate::config::{BatchConfig, CompactionConfig};
use crate::store::compact::{CompactOutcome, CompactStatus, Compactor};
use crate::store::delete::{DeleteCoordinator, DeleteReport};
use crate::store::log::{AppendAck, LogEngine, UpdateRecord};
use crate::store::snapshot::{
	SaveOptions, SavedSnapshot, SnapshotEngine, SnapshotRecord, checksum_hex,
};
use crate::store::{HealthStatus, Store};

/// Confirmation token a caller must present for a hard delete.
pub const HARD_DELETE_CONFIRMATION: &str = "PERMANENTLY-DELETE";

/// Sink wiring the batching writer to the log engine, with the optional
/// non-blocking compaction check after every append.
struct LogSink {
	log: LogEngine,
	compactor: Arc<Compactor>,
	auto_compact: bool,
}

#[async_trait]
impl UpdateSink for LogSink {
	async fn append(&self, doc: &str, payload: &[u8], client_id: Option<&str>) -> AlResult<()> {
		self.log.append(doc, payload, client_id).await?;

		if self.auto_compact {
			// persistence must not fail because compaction failed: run the
			// check detached and swallow its errors
			let compactor = Arc::clone(&self.compactor);
			let doc: Box<str> = doc.into();
			tokio::spawn(async move {
				match compactor.compact_if_needed(&doc).await {
					Ok(CompactOutcome::Compacted { count, size, .. }) => {
						debug!("auto-compacted {}: {} updates -> {} bytes", doc, count, size);
					}
					Ok(CompactOutcome::Skipped { .. }) => {}
					Err(err) => warn!("auto-compaction of {} failed: {}", doc, err),
				}
			});
		}

		Ok(())
	}
}

pub struct PersistService {
	store: Store,
	log: LogEngine,
	snapshots: SnapshotEngine,
	compactor: Arc<Compactor>,
	writer: Arc<BatchWriter>,
	deletes: DeleteCoordinator,
}

impl PersistService {
	pub fn new(
		store: Store,
		batch: BatchConfig,
		compaction: CompactionConfig,
	) -> AlResult<Arc<Self>> {
		batch.validate()?;
		compaction.validate()?;

		let log = LogEngine::new(store.clone());
		let snapshots = SnapshotEngine::new(store.clone());
		let compactor = Arc::new(Compactor::new(store.clone(), compaction.clone()));
		let sink = Arc::new(LogSink {
			log: log.clone(),
			compactor: Arc::clone(&compactor),
			auto_compact: compaction.auto_compact,
		});
		let writer = BatchWriter::new(sink, batch)?;

		Ok(Arc::new(Self {
			deletes: DeleteCoordinator::new(store.clone()),
			store,
			log,
			snapshots,
			compactor,
			writer,
		}))
	}

	pub fn writer(&self) -> &Arc<BatchWriter> {
		&self.writer
	}

	// Write path //
	//************//

	/// Queue one update for durable storage. Acknowledges as soon as the
	/// payload is queued; durability follows on flush (at-least-once).
	/// During shutdown the queue is bypassed and the append is
	/// synchronous, so an acknowledgement always implies durability.
	pub async fn persist(
		self: &Arc<Self>,
		doc: &DocName,
		payload: Vec<u8>,
		client_id: Option<&str>,
	) -> AlResult<()> {
		let started = Instant::now();
		let res = self.persist_inner(doc, payload, client_id).await;
		log_op("persist", doc.as_str(), started, &res);
		res
	}

	async fn persist_inner(
		self: &Arc<Self>,
		doc: &DocName,
		payload: Vec<u8>,
		client_id: Option<&str>,
	) -> AlResult<()> {
		if payload.is_empty() {
			return Err(Error::Validation("update payload must not be empty".into()));
		}
		self.writer.enqueue(doc, payload, client_id).await
	}

	/// Append one update durably, skipping the batcher. Flushes the doc
	/// first so the log keeps arrival order.
	pub async fn persist_durable(
		self: &Arc<Self>,
		doc: &DocName,
		payload: Vec<u8>,
		client_id: Option<&str>,
	) -> AlResult<AppendAck> {
		let started = Instant::now();
		let res = async {
			if payload.is_empty() {
				return Err(Error::Validation("update payload must not be empty".into()));
			}
			self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;
			self.log.append(doc.as_str(), &payload, client_id).await
		}
		.await;
		log_op("persistDurable", doc.as_str(), started, &res);
		res
	}

	// Read path //
	//***********//

	/// Fold the latest snapshot and every newer update into one state
	/// blob. `None` for a never-seen doc. Reflects every update
	/// acknowledged before this call.
	pub async fn load(self: &Arc<Self>, doc: &DocName) -> AlResult<Option<Vec<u8>>> {
		let started = Instant::now();
		let res = self.load_inner(doc).await;
		log_op("load", doc.as_str(), started, &res);
		res
	}

	async fn load_inner(self: &Arc<Self>, doc: &DocName) -> AlResult<Option<Vec<u8>>> {
		self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;

		let snapshot = self.snapshots.latest(doc.as_str()).await?;
		let updates = match &snapshot {
			Some(snap) => self.log.read_since(doc.as_str(), snap.created_at).await?,
			None => self.log.read_all(doc.as_str()).await?,
		};

		if snapshot.is_none() && updates.is_empty() {
			return Ok(None);
		}

		let payloads: Vec<&[u8]> = updates.iter().map(|u| u.payload.as_slice()).collect();
		let state = codec::fold(snapshot.as_ref().map(|s| s.state.as_slice()), &payloads)?;
		Ok(Some(state))
	}

	/// Raw update rows in `(timestamp, id)` order.
	pub async fn read_all(self: &Arc<Self>, doc: &DocName) -> AlResult<Vec<UpdateRecord>> {
		let started = Instant::now();
		let res = async {
			self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;
			self.log.read_all(doc.as_str()).await
		}
		.await;
		log_op("getAllUpdates", doc.as_str(), started, &res);
		res
	}

	/// Updates at or after a cutoff, for incremental readers.
	pub async fn read_since(
		self: &Arc<Self>,
		doc: &DocName,
		since: DateTime<Utc>,
	) -> AlResult<Vec<UpdateRecord>> {
		let started = Instant::now();
		let res = async {
			self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;
			self.log.read_since(doc.as_str(), since).await
		}
		.await;
		log_op("getUpdatesSince", doc.as_str(), started, &res);
		res
	}

	// Log maintenance //
	//*****************//

	/// Drop all update rows for a doc. Snapshots are untouched.
	pub async fn clear_updates(self: &Arc<Self>, doc: &DocName) -> AlResult<u64> {
		let started = Instant::now();
		let res = async {
			self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;
			self.log.clear(doc.as_str()).await
		}
		.await;
		log_op("clearUpdates", doc.as_str(), started, &res);
		res
	}

	/// Drop update rows older than the cutoff. Snapshots are untouched.
	pub async fn clear_updates_before(
		self: &Arc<Self>,
		doc: &DocName,
		before: DateTime<Utc>,
	) -> AlResult<u64> {
		let started = Instant::now();
		let res = async {
			self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;
			self.log.delete_before(doc.as_str(), before).await
		}
		.await;
		log_op("clearUpdates", doc.as_str(), started, &res);
		res
	}

	// Snapshots //
	//***********//

	/// Store a full-state snapshot, idempotent by checksum.
	pub async fn save_snapshot(
		self: &Arc<Self>,
		doc: &DocName,
		state: Vec<u8>,
		opts: SaveOptions,
	) -> AlResult<SavedSnapshot> {
		let started = Instant::now();
		let res = async {
			self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;
			self.snapshots.save(doc, &state, opts).await
		}
		.await;
		log_op("saveSnapshot", doc.as_str(), started, &res);
		res
	}

	/// Fetch a snapshot: the newest one, or an exact checksum match.
	pub async fn load_snapshot(
		self: &Arc<Self>,
		doc: &DocName,
		checksum: Option<&str>,
	) -> AlResult<Option<SnapshotRecord>> {
		let started = Instant::now();
		let res = async {
			match checksum {
				Some(sum) => self.snapshots.by_checksum(doc.as_str(), sum).await,
				None => self.snapshots.latest(doc.as_str()).await,
			}
		}
		.await;
		log_op("loadSnapshot", doc.as_str(), started, &res);
		res
	}

	/// Keep only the newest `keep` snapshots for a doc.
	pub async fn prune_snapshots(self: &Arc<Self>, doc: &DocName, keep: i64) -> AlResult<u64> {
		let started = Instant::now();
		let res = self.snapshots.prune_to_last(doc.as_str(), keep).await;
		log_op("pruneSnapshots", doc.as_str(), started, &res);
		res
	}

	// Compaction //
	//************//

	pub async fn compact(self: &Arc<Self>, doc: &DocName, force: bool) -> AlResult<CompactOutcome> {
		let started = Instant::now();
		let res = async {
			self.writer.flush_doc(doc.as_str(), FlushReason::Manual).await?;
			self.compactor.compact(doc.as_str(), force).await
		}
		.await;
		log_op("compact", doc.as_str(), started, &res);
		res
	}

	pub async fn compact_status(self: &Arc<Self>, doc: &DocName) -> AlResult<CompactStatus> {
		let started = Instant::now();
		let res = self.compactor.status(doc.as_str()).await;
		log_op("compactStatus", doc.as_str(), started, &res);
		res
	}

	/// One pass of the background sweep.
	pub async fn sweep(self: &Arc<Self>) -> AlResult<u32> {
		self.compactor.sweep().await
	}

	pub fn compaction_config(&self) -> &CompactionConfig {
		self.compactor.config()
	}

	// Delete //
	//********//

	/// Soft or hard delete of a note document and its panels. A hard
	/// delete demands the `PERMANENTLY-DELETE` confirmation token.
	pub async fn delete_doc(
		self: &Arc<Self>,
		doc: &DocName,
		hard: bool,
		confirmation: Option<&str>,
	) -> AlResult<DeleteReport> {
		let started = Instant::now();
		let res = async {
			if hard && confirmation != Some(HARD_DELETE_CONFIRMATION) {
				return Err(Error::PermissionDenied);
			}
			self.writer.flush_all().await?;
			self.deletes.delete(doc, hard).await
		}
		.await;
		log_op("deleteDoc", doc.as_str(), started, &res);
		res
	}

	// Observability //
	//***************//

	/// Liveness probe; reports instead of failing.
	pub async fn health(&self) -> HealthStatus {
		self.store.health().await
	}

	/// Batching writer counters.
	pub fn stats(&self) -> BatchStats {
		self.writer.stats()
	}

	/// Compute the canonical checksum for a blob, for callers that want
	/// to pre-check idempotent saves.
	pub fn checksum(state: &[u8]) -> String {
		checksum_hex(state)
	}

	// Lifecycle //
	//***********//

	pub async fn flush_all(self: &Arc<Self>) -> AlResult<()> {
		self.writer.flush_all().await
	}

	/// Drain the writer, then close the pool. Called from the process
	/// edge after the HTTP server stops accepting requests.
	pub async fn shutdown(self: &Arc<Self>) -> AlResult<()> {
		let res = self.writer.shutdown().await;
		self.store.close().await;
		info!("persistence service shut down");
		res
	}
}

impl std::fmt::Debug for PersistService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PersistService").field("writer", &self.writer).finish_non_exhaustive()
	}
}

/// One structured line per operation, success or not.
fn log_op<T>(action: &'static str, doc: &str, started: Instant, res: &AlResult<T>) {
	let duration_ms = started.elapsed().as_millis() as u64;
	match res {
		Ok(_) => {
			info!(action, doc_name = doc, duration_ms, success = true);
		}
		Err(err) => {
			warn!(action, doc_name = doc, duration_ms, success = false, error = %err);
		}
	}
}

// vim: ts=4
