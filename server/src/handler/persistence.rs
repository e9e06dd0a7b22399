//! Persistence API handlers.
//!
//! A unified `POST /persistence` action endpoint plus specialised
//! update/snapshot/compaction routes. All binary output is base64;
//! ingest also accepts the legacy integer-array encoding.

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use annolog_persist::store::compact::CompactOutcome;
use annolog_persist::store::log::UpdateRecord;
use annolog_persist::store::snapshot::{SaveOptions, SavedSnapshot, SnapshotRecord};
use annolog_types::prelude::*;

use crate::app::App;
use crate::types::{BinaryInput, to_base64};

// Unified action endpoint //
//*************************//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
	pub action: String,
	pub doc_name: Option<DocName>,
	pub update: Option<BinaryInput>,
	pub snapshot: Option<BinaryInput>,
	pub client_id: Option<String>,
	pub checksum: Option<String>,
	pub panels: Option<Value>,
	#[serde(default)]
	pub force: bool,
}

fn require_doc(doc: Option<DocName>) -> AlResult<DocName> {
	doc.ok_or_else(|| Error::Validation("docName is required".into()))
}

/// POST /persistence
pub async fn post_action(
	State(app): State<App>,
	Json(req): Json<ActionRequest>,
) -> AlResult<Json<Value>> {
	let service = &app.service;

	match req.action.as_str() {
		"persist" => {
			let doc = require_doc(req.doc_name)?;
			let update = req
				.update
				.ok_or_else(|| Error::Validation("update is required".into()))?
				.decode()?;
			service.persist(&doc, update, req.client_id.as_deref()).await?;
			Ok(Json(json!({ "accepted": true, "docName": doc })))
		}
		"load" => {
			let doc = require_doc(req.doc_name)?;
			let state = service.load(&doc).await?;
			Ok(Json(load_response(&doc, state)))
		}
		"getAllUpdates" => {
			let doc = require_doc(req.doc_name)?;
			let updates = service.read_all(&doc).await?;
			Ok(Json(updates_response(&doc, &updates)))
		}
		"clearUpdates" => {
			let doc = require_doc(req.doc_name)?;
			let deleted = service.clear_updates(&doc).await?;
			Ok(Json(json!({ "deletedCount": deleted })))
		}
		"saveSnapshot" => {
			let doc = require_doc(req.doc_name)?;
			let state = req
				.snapshot
				.ok_or_else(|| Error::Validation("snapshot is required".into()))?
				.decode()?;
			let opts = SaveOptions {
				expected_checksum: req.checksum,
				panels: req.panels,
				update_count: None,
			};
			let saved = service.save_snapshot(&doc, state, opts).await?;
			Ok(Json(saved_snapshot_response(&saved)))
		}
		"loadSnapshot" => {
			let doc = require_doc(req.doc_name)?;
			let snapshot = service.load_snapshot(&doc, req.checksum.as_deref()).await?;
			Ok(Json(snapshot_response(&doc, snapshot.as_ref())))
		}
		"compact" => {
			let doc = require_doc(req.doc_name)?;
			let outcome = service.compact(&doc, req.force).await?;
			Ok(Json(compact_response(&outcome)))
		}
		other => Err(Error::Validation(format!("unknown action '{}'", other))),
	}
}

// Updates //
//*********//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesQuery {
	pub doc_name: DocName,
	pub since: Option<DateTime<Utc>>,
}

/// GET /persistence/updates?docName&since?
pub async fn get_updates(
	State(app): State<App>,
	Query(query): Query<UpdatesQuery>,
) -> AlResult<Json<Value>> {
	let updates = match query.since {
		Some(since) => app.service.read_since(&query.doc_name, since).await?,
		None => app.service.read_all(&query.doc_name).await?,
	};
	Ok(Json(updates_response(&query.doc_name, &updates)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostUpdateRequest {
	pub doc_name: DocName,
	pub update: BinaryInput,
	pub client_id: Option<String>,
}

/// POST /persistence/updates - durable single append, bypassing the
/// batcher (the unified `persist` action is the batched path).
pub async fn post_update(
	State(app): State<App>,
	Json(req): Json<PostUpdateRequest>,
) -> AlResult<Json<Value>> {
	let payload = req.update.decode()?;
	let ack = app
		.service
		.persist_durable(&req.doc_name, payload, req.client_id.as_deref())
		.await?;
	Ok(Json(json!({ "id": ack.id, "timestamp": ack.timestamp, "size": ack.size })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUpdatesQuery {
	pub doc_name: DocName,
	pub before: Option<DateTime<Utc>>,
}

/// DELETE /persistence/updates?docName&before?
pub async fn delete_updates(
	State(app): State<App>,
	Query(query): Query<DeleteUpdatesQuery>,
) -> AlResult<Json<Value>> {
	let deleted = match query.before {
		Some(before) => app.service.clear_updates_before(&query.doc_name, before).await?,
		None => app.service.clear_updates(&query.doc_name).await?,
	};
	Ok(Json(json!({ "deletedCount": deleted })))
}

// Snapshots //
//***********//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsQuery {
	pub doc_name: DocName,
	pub checksum: Option<String>,
}

/// GET /persistence/snapshots?docName&checksum?
pub async fn get_snapshot(
	State(app): State<App>,
	Query(query): Query<SnapshotsQuery>,
) -> AlResult<Json<Value>> {
	let snapshot =
		app.service.load_snapshot(&query.doc_name, query.checksum.as_deref()).await?;
	Ok(Json(snapshot_response(&query.doc_name, snapshot.as_ref())))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSnapshotRequest {
	pub doc_name: DocName,
	pub snapshot: BinaryInput,
	pub checksum: Option<String>,
	pub panels: Option<Value>,
}

/// POST /persistence/snapshots
pub async fn post_snapshot(
	State(app): State<App>,
	Json(req): Json<PostSnapshotRequest>,
) -> AlResult<Json<Value>> {
	let state = req.snapshot.decode()?;
	let opts = SaveOptions {
		expected_checksum: req.checksum,
		panels: req.panels,
		update_count: None,
	};
	let saved = app.service.save_snapshot(&req.doc_name, state, opts).await?;
	Ok(Json(saved_snapshot_response(&saved)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSnapshotsQuery {
	pub doc_name: DocName,
	pub keep_last: Option<i64>,
}

/// DELETE /persistence/snapshots?docName&keepLast=K
pub async fn delete_snapshots(
	State(app): State<App>,
	Query(query): Query<DeleteSnapshotsQuery>,
) -> AlResult<Json<Value>> {
	let keep = query
		.keep_last
		.unwrap_or_else(|| app.service.compaction_config().keep_snapshots);
	let deleted = app.service.prune_snapshots(&query.doc_name, keep).await?;
	Ok(Json(json!({ "deletedCount": deleted })))
}

// Compaction //
//************//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCompactRequest {
	pub doc_name: DocName,
	#[serde(default)]
	pub force: bool,
}

/// POST /persistence/compact
pub async fn post_compact(
	State(app): State<App>,
	Json(req): Json<PostCompactRequest>,
) -> AlResult<Json<Value>> {
	let outcome = app.service.compact(&req.doc_name, req.force).await?;
	Ok(Json(compact_response(&outcome)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactStatusQuery {
	pub doc_name: DocName,
}

/// GET /persistence/compact?docName
pub async fn get_compact_status(
	State(app): State<App>,
	Query(query): Query<CompactStatusQuery>,
) -> AlResult<Json<Value>> {
	let status = app.service.compact_status(&query.doc_name).await?;
	Ok(Json(serde_json::to_value(status)?))
}

// Response builders //
//*******************//

fn load_response(doc: &DocName, state: Option<Vec<u8>>) -> Value {
	match state {
		Some(blob) => json!({
			"docName": doc,
			"doc": to_base64(&blob),
			"size": blob.len(),
		}),
		None => json!({ "docName": doc, "doc": Value::Null }),
	}
}

fn updates_response(doc: &DocName, updates: &[UpdateRecord]) -> Value {
	let items: Vec<Value> = updates
		.iter()
		.map(|u| {
			json!({
				"id": u.id,
				"update": to_base64(&u.payload),
				"clientId": u.client_id,
				"timestamp": u.timestamp,
			})
		})
		.collect();
	json!({ "docName": doc, "updates": items, "count": items.len() })
}

fn saved_snapshot_response(saved: &SavedSnapshot) -> Value {
	if saved.duplicate {
		json!({ "duplicate": true, "checksum": saved.checksum })
	} else {
		json!({
			"id": saved.id,
			"checksum": saved.checksum,
			"createdAt": saved.created_at,
			"size": saved.size,
		})
	}
}

fn snapshot_response(doc: &DocName, snapshot: Option<&SnapshotRecord>) -> Value {
	match snapshot {
		Some(snap) => json!({
			"docName": doc,
			"snapshot": {
				"id": snap.id,
				"noteId": snap.note_id,
				"snapshot": to_base64(&snap.state),
				"checksum": snap.checksum,
				"updateCount": snap.update_count,
				"sizeBytes": snap.size_bytes,
				"panels": snap.panels,
				"createdAt": snap.created_at,
			},
		}),
		None => json!({ "docName": doc, "snapshot": Value::Null }),
	}
}

fn compact_response(outcome: &CompactOutcome) -> Value {
	match outcome {
		CompactOutcome::Compacted { count, checksum, size } => json!({
			"compacted": true,
			"compactedCount": count,
			"checksum": checksum,
			"size": size,
		}),
		CompactOutcome::Skipped { update_count } => json!({
			"skipped": true,
			"updateCount": update_count,
		}),
	}
}

// vim: ts=4
