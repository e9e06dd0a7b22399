//! Postgres-backed integration tests
//!
//! These exercise the log/snapshot/compaction engines and the delete
//! cascade against a real database. They are ignored by default; run
//! them with a scratch database:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/annolog_test cargo test -- --ignored
//! ```
//!
//! Doc names are freshly generated per test so runs are repeatable.

use std::sync::Arc;

use uuid::Uuid;
use yrs::{GetString, ReadTxn, Text, Transact};

use annolog_persist::codec;
use annolog_persist::config::{BatchConfig, CompactionConfig, StoreConfig};
use annolog_persist::service::{HARD_DELETE_CONFIRMATION, PersistService};
use annolog_persist::store::compact::CompactOutcome;
use annolog_persist::store::snapshot::{SaveOptions, checksum_hex};
use annolog_persist::store::{Store, schema};
use annolog_types::prelude::*;

async fn test_store() -> Store {
	let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
	let store = Store::connect(&StoreConfig::new(url)).await.expect("connect");
	schema::init_db(store.pool()).await.expect("schema init");
	store
}

async fn test_service(compaction: CompactionConfig) -> Arc<PersistService> {
	let store = test_store().await;
	let mut batch = BatchConfig::test();
	batch.emit_events = false;
	PersistService::new(store, batch, compaction).expect("service builds")
}

fn fresh_note_doc() -> (Uuid, DocName) {
	let id = Uuid::new_v4();
	(id, DocName::new(format!("note:{}", id)).expect("valid doc name"))
}

/// Incremental text-insert updates from one Yjs doc, appending chunks.
fn text_updates(chunks: &[&str]) -> Vec<Vec<u8>> {
	let ydoc = codec::new_doc();
	let text = ydoc.get_or_insert_text("body");
	let mut updates = Vec::with_capacity(chunks.len());
	let mut position = 0u32;
	for chunk in chunks {
		let before = {
			let txn = ydoc.transact();
			txn.state_vector()
		};
		{
			let mut txn = ydoc.transact_mut();
			text.insert(&mut txn, position, chunk);
		}
		position += chunk.chars().count() as u32;
		let txn = ydoc.transact();
		updates.push(txn.encode_state_as_update_v1(&before));
	}
	updates
}

fn body_of(blob: &[u8]) -> String {
	let ydoc = codec::new_doc();
	codec::apply(&ydoc, blob).expect("blob applies");
	let text = ydoc.get_or_insert_text("body");
	let txn = ydoc.transact();
	text.get_string(&txn)
}

// Round trips //
//*************//

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn persist_flush_load_roundtrip() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();

	for update in text_updates(&["Hello", ", world"]) {
		service.persist(&doc, update, Some("producer-1")).await.expect("persist");
	}
	service.flush_all().await.expect("flush");

	let state = service.load(&doc).await.expect("load").expect("doc exists");
	assert_eq!(body_of(&state), "Hello, world");
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn load_of_unknown_doc_is_none() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();
	assert!(service.load(&doc).await.expect("load").is_none());
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn read_all_returns_updates_in_order() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();

	for update in text_updates(&["a", "b", "c"]) {
		service.persist_durable(&doc, update, None).await.expect("append");
	}

	let updates = service.read_all(&doc).await.expect("read_all");
	assert_eq!(updates.len(), 3);
	assert!(updates.windows(2).all(|w| {
		(w[0].timestamp, w[0].id) <= (w[1].timestamp, w[1].id)
	}));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn empty_update_is_rejected() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();
	let err = service.persist(&doc, Vec::new(), None).await.expect_err("must fail");
	assert!(matches!(err, Error::Validation(_)));
}

// Snapshots //
//***********//

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn snapshot_save_is_idempotent_by_checksum() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();

	let updates = text_updates(&["snapshot me"]);
	let state = codec::fold(None, &updates).expect("fold");
	let expected = checksum_hex(&state);

	let first = service
		.save_snapshot(&doc, state.clone(), SaveOptions::default())
		.await
		.expect("first save");
	assert!(!first.duplicate);
	assert_eq!(first.checksum.as_ref(), expected);

	let second = service
		.save_snapshot(&doc, state, SaveOptions::default())
		.await
		.expect("second save");
	assert!(second.duplicate);
	assert_eq!(second.checksum, first.checksum);
	assert_eq!(second.id, first.id);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn snapshot_save_rejects_checksum_mismatch() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();

	let updates = text_updates(&["x"]);
	let state = codec::fold(None, &updates).expect("fold");
	let opts = SaveOptions {
		expected_checksum: Some("deadbeef".repeat(8)),
		..SaveOptions::default()
	};
	let err = service.save_snapshot(&doc, state, opts).await.expect_err("must fail");
	assert!(matches!(err, Error::Validation(_)));
}

// Compaction //
//************//

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn compaction_preserves_state_and_truncates_log() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();

	let chunks: Vec<String> = (0..100).map(|i| format!("c{};", i)).collect();
	let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
	for update in text_updates(&chunk_refs) {
		service.persist_durable(&doc, update, None).await.expect("append");
	}

	let before = service.load(&doc).await.expect("load").expect("doc exists");

	let outcome = service.compact(&doc, true).await.expect("compact");
	let CompactOutcome::Compacted { count, checksum, size } = outcome else {
		panic!("expected a compaction, got a skip");
	};
	assert_eq!(count, 100);
	assert!(size > 0);
	assert_eq!(checksum.len(), 64);

	// log is empty, snapshot holds everything
	let updates = service.read_all(&doc).await.expect("read_all");
	assert!(updates.is_empty());
	let status = service.compact_status(&doc).await.expect("status");
	assert_eq!(status.update_count, 0);
	assert_eq!(status.snapshot_count, 1);

	// state is byte-identical after re-encoding both sides
	let after = service.load(&doc).await.expect("load").expect("doc exists");
	assert_eq!(body_of(&after), body_of(&before));
	let re_before = codec::fold(Some(&before), &[] as &[Vec<u8>]).expect("fold");
	let re_after = codec::fold(Some(&after), &[] as &[Vec<u8>]).expect("fold");
	assert_eq!(re_before, re_after);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn compaction_of_empty_doc_is_a_skip() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();

	let outcome = service.compact(&doc, true).await.expect("compact");
	assert!(matches!(outcome, CompactOutcome::Skipped { update_count: 0 }));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn retention_keeps_at_most_k_snapshots() {
	let config = CompactionConfig {
		auto_compact: false,
		keep_snapshots: 2,
		..Default::default()
	};
	let service = test_service(config).await;
	let (_, doc) = fresh_note_doc();

	// each round adds one update and forces a compaction -> one snapshot
	for round in 0..4 {
		let chunk = format!("round {};", round);
		for update in text_updates(&[chunk.as_str()]) {
			service.persist_durable(&doc, update, None).await.expect("append");
		}
		service.compact(&doc, true).await.expect("compact");
	}

	let status = service.compact_status(&doc).await.expect("status");
	assert!(status.snapshot_count <= 2, "retention must prune to K");
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn threshold_decision_matches_config() {
	let config = CompactionConfig {
		auto_compact: false,
		update_threshold: 5,
		..Default::default()
	};
	let service = test_service(config).await;
	let (_, doc) = fresh_note_doc();

	let chunks: Vec<String> = (0..4).map(|i| format!("u{}", i)).collect();
	let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
	for update in text_updates(&chunk_refs) {
		service.persist_durable(&doc, update, None).await.expect("append");
	}

	// below threshold: unforced compaction skips
	let outcome = service.compact(&doc, false).await.expect("compact");
	assert!(matches!(outcome, CompactOutcome::Skipped { update_count: 4 }));

	// fifth update crosses it
	for update in text_updates(&["u4"]) {
		service.persist_durable(&doc, update, None).await.expect("append");
	}
	let status = service.compact_status(&doc).await.expect("status");
	assert!(status.recommended);
	let outcome = service.compact(&doc, false).await.expect("compact");
	assert!(matches!(outcome, CompactOutcome::Compacted { .. }));
}

// Delete cascade //
//****************//

async fn seed_note_rows(store: &Store, note_id: Uuid, panel_ids: &[Uuid]) {
	sqlx::query("INSERT INTO notes (id, title) VALUES ($1, 'test note')")
		.bind(note_id)
		.execute(store.pool())
		.await
		.expect("insert note");
	for panel_id in panel_ids {
		sqlx::query("INSERT INTO panels (id, note_id) VALUES ($1, $2)")
			.bind(panel_id)
			.bind(note_id)
			.execute(store.pool())
			.await
			.expect("insert panel");
	}
	sqlx::query("INSERT INTO branches (id, note_id) VALUES ($1, $2)")
		.bind(Uuid::new_v4())
		.bind(note_id)
		.execute(store.pool())
		.await
		.expect("insert branch");
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn soft_delete_cascades_and_hard_delete_finishes_the_job() {
	let store = test_store().await;
	let mut batch = BatchConfig::test();
	batch.emit_events = false;
	let service = PersistService::new(
		store.clone(),
		batch,
		CompactionConfig { auto_compact: false, ..Default::default() },
	)
	.expect("service builds");

	let (note_id, note_doc) = fresh_note_doc();
	let panel_ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
	seed_note_rows(&store, note_id, &panel_ids).await;

	// updates on the note doc and each panel doc
	for update in text_updates(&["note body"]) {
		service.persist_durable(&note_doc, update, None).await.expect("append");
	}
	for panel_id in &panel_ids {
		let panel_doc = DocName::new(format!("panel:{}:{}", note_id, panel_id))
			.expect("valid doc name");
		for update in text_updates(&["panel body"]) {
			service.persist_durable(&panel_doc, update, None).await.expect("append");
		}
	}

	// soft delete: log and snapshots purged, rows marked
	service.delete_doc(&note_doc, false, None).await.expect("soft delete");

	let remaining: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM updates WHERE doc_name = $1 OR doc_name LIKE $2",
	)
	.bind(note_doc.as_str())
	.bind(format!("panel:{}:%", note_id))
	.fetch_one(store.pool())
	.await
	.expect("count updates");
	assert_eq!(remaining, 0);

	let marked: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM panels WHERE note_id = $1 AND deleted_at IS NOT NULL",
	)
	.bind(note_id)
	.fetch_one(store.pool())
	.await
	.expect("count panels");
	assert_eq!(marked, panel_ids.len() as i64);

	let note_marked: Option<chrono::DateTime<chrono::Utc>> =
		sqlx::query_scalar("SELECT deleted_at FROM notes WHERE id = $1")
			.bind(note_id)
			.fetch_one(store.pool())
			.await
			.expect("note row");
	assert!(note_marked.is_some());

	// repeated soft delete is a no-op success
	service.delete_doc(&note_doc, false, None).await.expect("idempotent soft delete");

	// hard delete without confirmation is refused, nothing changes
	let err = service.delete_doc(&note_doc, true, None).await.expect_err("must fail");
	assert!(matches!(err, Error::PermissionDenied));

	// hard delete after soft delete removes the rows
	service
		.delete_doc(&note_doc, true, Some(HARD_DELETE_CONFIRMATION))
		.await
		.expect("hard delete");
	let note_rows: i64 = sqlx::query_scalar("SELECT count(*) FROM notes WHERE id = $1")
		.bind(note_id)
		.fetch_one(store.pool())
		.await
		.expect("count notes");
	assert_eq!(note_rows, 0);
	let panel_rows: i64 = sqlx::query_scalar("SELECT count(*) FROM panels WHERE note_id = $1")
		.bind(note_id)
		.fetch_one(store.pool())
		.await
		.expect("count panels");
	assert_eq!(panel_rows, 0);
}

// Concurrency //
//*************//

#[tokio::test]
#[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
async fn updates_during_compaction_are_not_lost() {
	let service = test_service(CompactionConfig { auto_compact: false, ..Default::default() }).await;
	let (_, doc) = fresh_note_doc();

	let chunks: Vec<String> = (0..20).map(|i| format!("w{};", i)).collect();
	let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
	let updates = text_updates(&chunk_refs);
	let (first, rest) = updates.split_at(10);

	for update in first {
		service.persist_durable(&doc, update.clone(), None).await.expect("append");
	}

	// compactions racing with appends: every acknowledged update must end
	// up in the snapshot or in the surviving log, never vanish
	let compact_task = {
		let service = Arc::clone(&service);
		let doc = doc.clone();
		tokio::spawn(async move { service.compact(&doc, true).await })
	};
	for update in rest {
		service.persist_durable(&doc, update.clone(), None).await.expect("append");
	}
	compact_task.await.expect("join").expect("compact");

	let state = service.load(&doc).await.expect("load").expect("doc exists");
	let body = body_of(&state);
	for i in 0..20 {
		assert!(body.contains(&format!("w{};", i)), "update w{} was lost", i);
	}
}

// vim: ts=4
