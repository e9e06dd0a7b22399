//! Health endpoint.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::app::App;

/// GET /health
///
/// Never errors: a broken database yields a 503 with the failure
/// message, not an exception.
pub async fn get_health(State(app): State<App>) -> (StatusCode, Json<Value>) {
	let health = app.service.health().await;
	let timestamp = chrono::Utc::now();

	if health.healthy {
		(
			StatusCode::OK,
			Json(json!({
				"healthy": true,
				"latency": health.latency_ms,
				"poolStatus": health.pool,
				"timestamp": timestamp,
			})),
		)
	} else {
		(
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({
				"healthy": false,
				"error": health.error,
				"timestamp": timestamp,
			})),
		)
	}
}

/// GET /persistence/stats - batching writer counters.
pub async fn get_stats(State(app): State<App>) -> Json<Value> {
	let stats = app.service.stats();
	Json(json!({ "batching": stats, "timestamp": chrono::Utc::now() }))
}

// vim: ts=4
