//! API routes

use axum::{
	Router,
	routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::handler::{health, notes, persistence};

pub fn init(app: App) -> Router {
	Router::new()
		// --- Health ---
		.route("/health", get(health::get_health))
		.route("/persistence/stats", get(health::get_stats))

		// --- Unified action endpoint ---
		.route("/persistence", post(persistence::post_action))

		// --- Update log ---
		.route(
			"/persistence/updates",
			get(persistence::get_updates)
				.post(persistence::post_update)
				.delete(persistence::delete_updates),
		)

		// --- Snapshots ---
		.route(
			"/persistence/snapshots",
			get(persistence::get_snapshot)
				.post(persistence::post_snapshot)
				.delete(persistence::delete_snapshots),
		)

		// --- Compaction ---
		.route(
			"/persistence/compact",
			get(persistence::get_compact_status).post(persistence::post_compact),
		)

		// --- Note deletion cascade ---
		.route("/notes/{note_id}", delete(notes::delete_note))

		.layer(TraceLayer::new_for_http())
		.with_state(app)
}

// vim: ts=4
