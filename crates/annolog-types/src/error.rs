//! Error handling subsystem. Implements a custom Error type.

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use crate::prelude::*;

pub type AlResult<T> = std::result::Result<T, Error>;

/// Error taxonomy of the persistence core.
///
/// Transient database failures are retried inside the store layer and
/// never reach callers; everything here is terminal from the caller's
/// point of view.
#[derive(Debug)]
pub enum Error {
	// Core errors
	NotFound,
	PermissionDenied, // 403 - missing hard-delete confirmation
	Db,               // terminal database failure, after retries
	Timeout,          // operation deadline exceeded

	// Input validation and constraints
	Validation(String), // 400 - invalid input data

	// Data handling
	Codec(String), // malformed CRDT update or snapshot blob

	// System and configuration
	Config(String),             // missing or invalid configuration
	ServiceUnavailable(String), // 503 - shutting down / temporary failures
	Internal(String),           // internal invariant violations, for debugging

	// externals
	Io(std::io::Error),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!("io error: {}", err);
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		warn!("json error: {}", err);
		Error::Validation("invalid JSON payload".into())
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::NotFound => write!(f, "not found"),
			Error::PermissionDenied => write!(f, "permission denied"),
			Error::Db => write!(f, "database error"),
			Error::Timeout => write!(f, "operation timed out"),
			Error::Validation(msg) => write!(f, "validation failed: {}", msg),
			Error::Codec(msg) => write!(f, "codec error: {}", msg),
			Error::Config(msg) => write!(f, "configuration error: {}", msg),
			Error::ServiceUnavailable(msg) => write!(f, "service unavailable: {}", msg),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
			Error::Io(err) => write!(f, "io error: {}", err),
		}
	}
}

impl std::error::Error for Error {}

/// JSON body returned for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
	pub error: String,
	pub status: u16,
	pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorResponse {
	pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
		Self { error: error.into(), status: status.as_u16(), timestamp: chrono::Utc::now() }
	}
}

impl IntoResponse for Error {
	fn into_response(self) -> axum::response::Response {
		let (status, message) = match self {
			Error::NotFound => (StatusCode::NOT_FOUND, "Resource not found".to_string()),
			Error::PermissionDenied => (
				StatusCode::FORBIDDEN,
				"Hard delete requires the PERMANENTLY-DELETE confirmation".to_string(),
			),
			Error::Validation(msg) => {
				(StatusCode::BAD_REQUEST, format!("Request validation failed: {}", msg))
			}
			Error::Timeout => (StatusCode::REQUEST_TIMEOUT, "Request timeout".to_string()),
			Error::ServiceUnavailable(msg) => (
				StatusCode::SERVICE_UNAVAILABLE,
				format!("Service temporarily unavailable: {}", msg),
			),
			Error::Codec(_) => {
				(StatusCode::INTERNAL_SERVER_ERROR, "Document codec failure".to_string())
			}
			// Server errors (5xx) - no message exposure
			Error::Db => (StatusCode::INTERNAL_SERVER_ERROR, "Storage failure".to_string()),
			Error::Internal(msg) => {
				warn!("internal error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
			}
			Error::Config(msg) => {
				warn!("config error: {}", msg);
				(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
			}
			Error::Io(err) => {
				warn!("io error: {}", err);
				(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
			}
		};

		(status, Json(ErrorResponse::new(status, message))).into_response()
	}
}

// vim: ts=4
