//! Database schema initialization.
//!
//! Creates the persistence tables and indexes if they don't exist. The
//! `notes`/`panels`/`branches` tables are owned by the application layer;
//! minimal versions are created here so a fresh database works end to
//! end, and the core only ever touches their `id`/`note_id`/`deleted_at`
//! columns.

use sqlx::PgPool;

/// Initialize the database schema with all required tables and indexes.
pub async fn init_db(db: &PgPool) -> Result<(), sqlx::Error> {
	let mut tx = db.begin().await?;

	// Update log
	//************
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS updates (
		id bigserial PRIMARY KEY,
		doc_name text NOT NULL,
		\"update\" bytea NOT NULL,
		client_id text,
		timestamp timestamptz NOT NULL DEFAULT now()
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query(
		"CREATE INDEX IF NOT EXISTS idx_updates_doc_name_timestamp
		ON updates (doc_name, timestamp)",
	)
	.execute(&mut *tx)
	.await?;

	// Snapshots
	//***********
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS snapshots (
		id uuid PRIMARY KEY,
		note_id uuid,
		doc_name text NOT NULL,
		state bytea NOT NULL,
		checksum text NOT NULL,
		update_count integer,
		size_bytes integer,
		panels jsonb,
		created_at timestamptz NOT NULL DEFAULT now()
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query(
		"CREATE INDEX IF NOT EXISTS idx_snapshots_doc_name_created_at
		ON snapshots (doc_name, created_at DESC)",
	)
	.execute(&mut *tx)
	.await?;

	// Compaction log (observability only)
	//*************************************
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS compaction_log (
		id uuid PRIMARY KEY,
		doc_name text,
		updates_before integer,
		updates_after integer,
		snapshot_size integer,
		duration_ms integer,
		created_at timestamptz NOT NULL DEFAULT now()
	)",
	)
	.execute(&mut *tx)
	.await?;

	// Application tables participating in the delete cascade
	//********************************************************
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS notes (
		id uuid PRIMARY KEY,
		title text,
		created_at timestamptz NOT NULL DEFAULT now(),
		deleted_at timestamptz
	)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS panels (
		id uuid PRIMARY KEY,
		note_id uuid NOT NULL,
		position jsonb,
		created_at timestamptz NOT NULL DEFAULT now(),
		deleted_at timestamptz
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_panels_note_id ON panels (note_id)")
		.execute(&mut *tx)
		.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS branches (
		id uuid PRIMARY KEY,
		note_id uuid NOT NULL,
		parent_id uuid,
		created_at timestamptz NOT NULL DEFAULT now(),
		deleted_at timestamptz
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_branches_note_id ON branches (note_id)")
		.execute(&mut *tx)
		.await?;

	tx.commit().await?;

	Ok(())
}

// vim: ts=4
