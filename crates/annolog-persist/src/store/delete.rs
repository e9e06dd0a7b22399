//! Delete coordinator.
//!
//! Removes a note document from the persistence layer across every table
//! that references it, in one transaction per request. Soft delete marks
//! the application rows and purges the CRDT log and snapshots; hard
//! delete additionally removes the application rows themselves,
//! children first.
//!
//! Doc-name coverage follows the prefix convention: the note's own doc
//! `note:<id>` plus every panel doc `panel:<id>:<panel>`.

use uuid::Uuid;

use annolog_types::prelude::*;

use super::{Store, inspect};

/// Counters from one delete cascade, for the operation log line.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteReport {
	pub updates_deleted: u64,
	pub snapshots_deleted: u64,
	pub panels_affected: u64,
	pub branches_affected: u64,
	pub hard: bool,
}

#[derive(Clone, Debug)]
pub struct DeleteCoordinator {
	store: Store,
}

impl DeleteCoordinator {
	pub fn new(store: Store) -> Self {
		Self { store }
	}

	/// Run the delete cascade for a note doc. Only `note:<uuid>` names
	/// are deletable; panel docs disappear with their note.
	///
	/// Soft delete is idempotent: repeating it is a successful no-op.
	/// Hard delete after soft delete is allowed and removes the rows.
	pub async fn delete(&self, doc: &DocName, hard: bool) -> AlResult<DeleteReport> {
		let DocKind::Note(raw_id) = doc.kind() else {
			return Err(Error::Validation(
				"only note documents can be deleted (expected note:<uuid>)".into(),
			));
		};
		let note_id = Uuid::parse_str(raw_id)
			.map_err(|_| Error::Validation(format!("invalid note id '{}'", raw_id)))?;

		let note_doc = doc.as_str();
		let panel_pattern = format!("panel:{}:%", raw_id);

		let mut tx = self.store.begin().await?;
		let mut report = DeleteReport { hard, ..DeleteReport::default() };

		if !hard {
			// soft delete is only meaningful for a live note; a missing or
			// already-deleted note still purges the log below (no-op) and
			// succeeds
			sqlx::query("UPDATE notes SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL")
				.bind(note_id)
				.execute(&mut *tx)
				.await
				.inspect_err(inspect)
				.map_err(|_| Error::Db)?;
		}

		let res = sqlx::query("DELETE FROM updates WHERE doc_name = $1 OR doc_name LIKE $2")
			.bind(note_doc)
			.bind(&panel_pattern)
			.execute(&mut *tx)
			.await
			.inspect_err(inspect)
			.map_err(|_| Error::Db)?;
		report.updates_deleted = res.rows_affected();

		let res = sqlx::query("DELETE FROM snapshots WHERE doc_name = $1 OR doc_name LIKE $2")
			.bind(note_doc)
			.bind(&panel_pattern)
			.execute(&mut *tx)
			.await
			.inspect_err(inspect)
			.map_err(|_| Error::Db)?;
		report.snapshots_deleted = res.rows_affected();

		if hard {
			// children first, then the note row itself
			let res = sqlx::query("DELETE FROM branches WHERE note_id = $1")
				.bind(note_id)
				.execute(&mut *tx)
				.await
				.inspect_err(inspect)
				.map_err(|_| Error::Db)?;
			report.branches_affected = res.rows_affected();

			let res = sqlx::query("DELETE FROM panels WHERE note_id = $1")
				.bind(note_id)
				.execute(&mut *tx)
				.await
				.inspect_err(inspect)
				.map_err(|_| Error::Db)?;
			report.panels_affected = res.rows_affected();

			sqlx::query("DELETE FROM notes WHERE id = $1")
				.bind(note_id)
				.execute(&mut *tx)
				.await
				.inspect_err(inspect)
				.map_err(|_| Error::Db)?;
		} else {
			let res = sqlx::query(
				"UPDATE panels SET deleted_at = now() WHERE note_id = $1 AND deleted_at IS NULL",
			)
			.bind(note_id)
			.execute(&mut *tx)
			.await
			.inspect_err(inspect)
			.map_err(|_| Error::Db)?;
			report.panels_affected = res.rows_affected();

			let res = sqlx::query(
				"UPDATE branches SET deleted_at = now() WHERE note_id = $1 AND deleted_at IS NULL",
			)
			.bind(note_id)
			.execute(&mut *tx)
			.await
			.inspect_err(inspect)
			.map_err(|_| Error::Db)?;
			report.branches_affected = res.rows_affected();
		}

		tx.commit().await.inspect_err(inspect).map_err(|_| Error::Db)?;

		// observability only; no cross-client broadcast guarantee
		info!(
			"deleted {} ({}): {} updates, {} snapshots, {} panels, {} branches",
			note_doc,
			if hard { "hard" } else { "soft" },
			report.updates_deleted,
			report.snapshots_deleted,
			report.panels_affected,
			report.branches_affected
		);

		Ok(report)
	}
}

// vim: ts=4
