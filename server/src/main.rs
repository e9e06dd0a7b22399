//! Process edge: configuration, wiring, signal handling.
//!
//! The service is built from explicitly constructed parts (store,
//! batching writer, engines) and shut down cooperatively: the HTTP
//! server stops accepting requests, the batching writer drains, then the
//! pool closes.

use std::sync::Arc;

use annolog_persist::config::CompactionConfig;
use annolog_persist::service::PersistService;
use annolog_persist::store::{Store, schema};
use annolog_types::prelude::*;

mod app;
mod config;
mod handler;
mod routes;
mod types;

use app::AppState;
use config::Config;

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_target(false)
		.init();

	if let Err(err) = run().await {
		error!("fatal: {}", err);
		std::process::exit(1);
	}
}

async fn run() -> AlResult<()> {
	let config = Config::from_env()?;

	let store = Store::connect(&config.store).await?;
	schema::init_db(store.pool()).await.map_err(|err| {
		error!("schema init failed: {}", err);
		Error::Db
	})?;

	let service =
		PersistService::new(store, config.batch.clone(), config.compaction.clone())?;
	let app = Arc::new(AppState { service: Arc::clone(&service) });

	let sweeper = spawn_sweep(Arc::clone(&service), &config.compaction);

	let router = routes::init(app);
	let listener = tokio::net::TcpListener::bind(&config.listen).await?;
	info!("listening on {}", config.listen);

	axum::serve(listener, router)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	// drain: no new requests are in flight past this point
	if let Some(sweeper) = sweeper {
		sweeper.abort();
	}
	service.shutdown().await?;

	Ok(())
}

/// Periodic compaction sweep across all docs with pending updates.
fn spawn_sweep(
	service: Arc<PersistService>,
	config: &CompactionConfig,
) -> Option<tokio::task::JoinHandle<()>> {
	if !config.auto_compact {
		return None;
	}
	let interval = config.sweep_interval;
	Some(tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		ticker.tick().await; // first tick fires immediately; skip it
		loop {
			ticker.tick().await;
			match service.sweep().await {
				Ok(0) => debug!("compaction sweep: nothing to do"),
				Ok(n) => info!("compaction sweep: compacted {} docs", n),
				Err(err) => warn!("compaction sweep failed: {}", err),
			}
		}
	}))
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			warn!("failed to install SIGINT handler: {}", err);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(err) => {
				warn!("failed to install SIGTERM handler: {}", err);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => info!("received SIGINT, shutting down"),
		_ = terminate => info!("received SIGTERM, shutting down"),
	}
}

// vim: ts=4
