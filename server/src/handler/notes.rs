//! Note deletion endpoint.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use annolog_persist::service::HARD_DELETE_CONFIRMATION;
use annolog_types::prelude::*;

use crate::app::App;

const CONFIRM_HEADER: &str = "x-confirm-delete";

#[derive(Debug, Deserialize)]
pub struct DeleteNoteQuery {
	#[serde(default)]
	pub hard: bool,
}

/// DELETE /notes/{note_id}[?hard=true]
///
/// Soft delete marks the note/panel/branch rows and purges the CRDT log
/// and snapshots. Hard delete additionally removes the rows and demands
/// the `X-Confirm-Delete: PERMANENTLY-DELETE` header.
pub async fn delete_note(
	State(app): State<App>,
	Path(note_id): Path<Uuid>,
	Query(query): Query<DeleteNoteQuery>,
	headers: HeaderMap,
) -> AlResult<Json<Value>> {
	let confirmation = headers.get(CONFIRM_HEADER).and_then(|v| v.to_str().ok());
	let doc = DocName::new(format!("note:{}", note_id))?;

	let report = app.service.delete_doc(&doc, query.hard, confirmation).await?;

	Ok(Json(json!({
		"deleted": true,
		"docName": doc,
		"hard": report.hard,
		"updatesDeleted": report.updates_deleted,
		"snapshotsDeleted": report.snapshots_deleted,
	})))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn confirmation_token_matches_client_header_value() {
		assert_eq!(HARD_DELETE_CONFIRMATION, "PERMANENTLY-DELETE");
	}
}

// vim: ts=4
