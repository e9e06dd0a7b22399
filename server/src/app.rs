//! App state type

use std::sync::Arc;

use annolog_persist::service::PersistService;

pub struct AppState {
	pub service: Arc<PersistService>,
}

pub type App = Arc<AppState>;

// vim: ts=4
