//! Batching writer.
//!
//! Per-document in-memory queues between producers and the update log.
//! Enqueues are O(1); a debounce timer (re-armed per enqueue) and a hard
//! deadline timer (armed once per batch) decide when a quiet doc flushes,
//! while count and size thresholds flush a busy doc immediately. At flush
//! time the pending blobs are coalesced through the codec into a single
//! update, cutting write amplification by one to two orders of magnitude.
//!
//! Guarantees:
//! - at most one flush per doc is in flight at any instant
//! - a failed flush re-queues its blobs in order; updates are never
//!   dropped, retry happens on the next timer fire
//! - after `shutdown` begins, new enqueues bypass the queue and append
//!   synchronously, so no acknowledged update can be lost

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use annolog_types::prelude::*;

use crate::codec;
use crate::config::BatchConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Destination of flushed batches. The service implements this over the
/// log engine; tests substitute an in-memory recorder.
#[async_trait]
pub trait UpdateSink: Send + Sync + 'static {
	async fn append(&self, doc: &str, payload: &[u8], client_id: Option<&str>) -> AlResult<()>;
}

/// What caused a flush.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushReason {
	Timeout,
	Size,
	Count,
	Manual,
}

impl FlushReason {
	pub fn as_str(self) -> &'static str {
		match self {
			FlushReason::Timeout => "timeout",
			FlushReason::Size => "size",
			FlushReason::Count => "count",
			FlushReason::Manual => "manual",
		}
	}
}

/// Observability events. Emission is optional; nothing here carries a
/// delivery guarantee.
#[derive(Clone, Debug)]
pub enum BatchEvent {
	Enqueued { doc: Box<str>, queued: usize, queued_bytes: usize },
	Flushed { doc: Box<str>, updates: usize, bytes: usize, reason: FlushReason },
	Shutdown,
}

struct PendingUpdate {
	payload: Vec<u8>,
	client_id: Option<Box<str>>,
}

#[derive(Clone, Copy)]
enum TimerKind {
	Debounce,
	Deadline,
}

#[derive(Default)]
struct QueueState {
	pending: Vec<PendingUpdate>,
	bytes: usize,
	debounce: Option<JoinHandle<()>>,
	deadline: Option<JoinHandle<()>>,
	/// Set when a threshold trigger found a flush already in flight; the
	/// in-flight flush re-checks the queue before releasing the doc.
	flush_again: bool,
}

impl QueueState {
	fn cancel_timers(&mut self) {
		if let Some(timer) = self.debounce.take() {
			timer.abort();
		}
		if let Some(timer) = self.deadline.take() {
			timer.abort();
		}
	}
}

struct DocQueue {
	state: Mutex<QueueState>,
	/// Held for the duration of a flush body; at-most-one per doc.
	flushing: Mutex<()>,
}

impl DocQueue {
	fn new() -> Self {
		Self { state: Mutex::new(QueueState::default()), flushing: Mutex::new(()) }
	}
}

// Metrics //
//*********//
#[derive(Default)]
struct Counters {
	enqueued: AtomicU64,
	appended: AtomicU64,
	batches: AtomicU64,
	flush_timeout: AtomicU64,
	flush_size: AtomicU64,
	flush_count: AtomicU64,
	flush_manual: AtomicU64,
	bytes_in: AtomicU64,
	bytes_out: AtomicU64,
	errors: AtomicU64,
	last_flush_ms: AtomicI64,
}

/// Point-in-time snapshot of the writer's counters.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
	pub enqueued: u64,
	/// Appends that reached the sink. `enqueued - appended` is the number
	/// of updates that disappeared into a merge.
	pub appended: u64,
	pub coalesced: u64,
	pub batches: u64,
	pub flushes_timeout: u64,
	pub flushes_size: u64,
	pub flushes_count: u64,
	pub flushes_manual: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub avg_batch_size: f64,
	/// Pre-merge bytes over post-merge bytes.
	pub compression_ratio: f64,
	pub errors: u64,
	pub last_flush_ms: i64,
}

pub struct BatchWriter {
	sink: Arc<dyn UpdateSink>,
	config: BatchConfig,
	queues: DashMap<Box<str>, Arc<DocQueue>>,
	shutting_down: AtomicBool,
	counters: Counters,
	events: broadcast::Sender<BatchEvent>,
}

impl BatchWriter {
	pub fn new(sink: Arc<dyn UpdateSink>, config: BatchConfig) -> AlResult<Arc<Self>> {
		config.validate()?;
		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Ok(Arc::new(Self {
			sink,
			config,
			queues: DashMap::new(),
			shutting_down: AtomicBool::new(false),
			counters: Counters::default(),
			events,
		}))
	}

	pub fn config(&self) -> &BatchConfig {
		&self.config
	}

	pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
		self.events.subscribe()
	}

	fn emit(&self, event: BatchEvent) {
		if self.config.emit_events {
			let _ = self.events.send(event);
		}
	}

	fn queue(&self, doc: &str) -> Arc<DocQueue> {
		if let Some(entry) = self.queues.get(doc) {
			return entry.value().clone();
		}
		self.queues.entry(doc.into()).or_insert_with(|| Arc::new(DocQueue::new())).clone()
	}

	/// Queue one payload for a doc. Returns once the payload is queued
	/// (or, during shutdown, once it is durably appended).
	pub async fn enqueue(
		self: &Arc<Self>,
		doc: &DocName,
		payload: Vec<u8>,
		client_id: Option<&str>,
	) -> AlResult<()> {
		if self.shutting_down.load(Ordering::SeqCst) {
			// bypass: nothing queued during shutdown may be lost
			self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
			self.counters.bytes_in.fetch_add(payload.len() as u64, Ordering::Relaxed);
			self.counters.appended.fetch_add(1, Ordering::Relaxed);
			self.counters.bytes_out.fetch_add(payload.len() as u64, Ordering::Relaxed);
			return self.sink.append(doc.as_str(), &payload, client_id).await;
		}

		let queue = self.queue(doc.as_str());
		let payload_len = payload.len();

		let (queued, queued_bytes, trigger) = {
			let mut state = queue.state.lock().await;
			state.pending.push(PendingUpdate {
				payload,
				client_id: client_id.map(Into::into),
			});
			state.bytes += payload_len;

			let trigger = if state.pending.len() >= self.config.max_batch_count {
				Some(FlushReason::Count)
			} else if state.bytes >= self.config.max_batch_bytes {
				Some(FlushReason::Size)
			} else {
				None
			};

			if trigger.is_none() {
				// debounce re-arms on every enqueue
				if let Some(timer) = state.debounce.take() {
					timer.abort();
				}
				state.debounce = Some(self.spawn_timer(
					doc.as_str(),
					self.config.debounce,
					TimerKind::Debounce,
				));
				// the hard deadline runs from the first enqueue of the
				// batch and is never pushed back
				if state.deadline.is_none() {
					state.deadline = Some(self.spawn_timer(
						doc.as_str(),
						self.config.batch_timeout,
						TimerKind::Deadline,
					));
				}
			}

			(state.pending.len(), state.bytes, trigger)
		};

		self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
		self.counters.bytes_in.fetch_add(payload_len as u64, Ordering::Relaxed);
		self.emit(BatchEvent::Enqueued { doc: doc.as_str().into(), queued, queued_bytes });

		if let Some(reason) = trigger {
			match queue.flushing.try_lock() {
				Ok(_guard) => {
					// a threshold flush must not fail the enqueue; the
					// batch is back in the queue and retries on a timer
					if let Err(err) = self.run_flush(&queue, doc.as_str(), reason).await {
						warn!("threshold flush of {} failed, re-queued: {}", doc, err);
					}
				}
				Err(_) => {
					queue.state.lock().await.flush_again = true;
				}
			}
		}

		Ok(())
	}

	fn spawn_timer(
		self: &Arc<Self>,
		doc: &str,
		delay: std::time::Duration,
		kind: TimerKind,
	) -> JoinHandle<()> {
		let writer = Arc::clone(self);
		let doc: Box<str> = doc.into();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			// drop our own handle before flushing: timer cancellation must
			// only ever abort a timer that is still sleeping, never the
			// task performing a flush
			if let Some(queue) = writer.queues.get(&*doc).map(|entry| entry.value().clone()) {
				let mut state = queue.state.lock().await;
				match kind {
					TimerKind::Debounce => drop(state.debounce.take()),
					TimerKind::Deadline => drop(state.deadline.take()),
				}
			}
			if let Err(err) = writer.flush_doc(&doc, FlushReason::Timeout).await {
				warn!("timer flush of {} failed, re-queued: {}", doc, err);
			}
		})
	}

	/// Flush one doc, waiting for any in-flight flush to finish first.
	/// A fired timer with an empty queue is a no-op.
	pub async fn flush_doc(self: &Arc<Self>, doc: &str, reason: FlushReason) -> AlResult<()> {
		let Some(queue) = self.queues.get(doc).map(|entry| entry.value().clone()) else {
			return Ok(());
		};
		let _guard = queue.flushing.lock().await;
		self.run_flush(&queue, doc, reason).await
	}

	/// Flush every doc. Awaits in-flight flushes; returns the first error
	/// after attempting all docs.
	pub async fn flush_all(self: &Arc<Self>) -> AlResult<()> {
		let docs: Vec<Box<str>> =
			self.queues.iter().map(|entry| entry.key().clone()).collect();
		let mut first_err = None;
		for doc in docs {
			if let Err(err) = self.flush_doc(&doc, FlushReason::Manual).await {
				warn!("flush_all: {} failed: {}", doc, err);
				if first_err.is_none() {
					first_err = Some(err);
				}
			}
		}
		match first_err {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Cooperative drain. Flips the writer into bypass mode, cancels all
	/// timers and flushes everything still queued.
	pub async fn shutdown(self: &Arc<Self>) -> AlResult<()> {
		self.shutting_down.store(true, Ordering::SeqCst);

		let queues: Vec<Arc<DocQueue>> =
			self.queues.iter().map(|entry| entry.value().clone()).collect();
		for queue in queues {
			queue.state.lock().await.cancel_timers();
		}

		let res = self.flush_all().await;
		self.emit(BatchEvent::Shutdown);
		info!("batching writer drained");
		res
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::SeqCst)
	}

	/// Flush body. Caller holds the doc's flush lock; loops until the
	/// queue is empty so a batch that arrived mid-flush is not stranded
	/// until the next timer.
	async fn run_flush(
		self: &Arc<Self>,
		queue: &Arc<DocQueue>,
		doc: &str,
		reason: FlushReason,
	) -> AlResult<()> {
		loop {
			let batch = {
				let mut state = queue.state.lock().await;
				state.flush_again = false;
				state.cancel_timers();
				if state.pending.is_empty() {
					return Ok(());
				}
				state.bytes = 0;
				std::mem::take(&mut state.pending)
			};

			if let Err(err) = self.write_batch(doc, &batch, reason).await {
				self.counters.errors.fetch_add(1, Ordering::Relaxed);
				let mut state = queue.state.lock().await;
				// put the un-persisted blobs back in front of anything
				// that arrived meanwhile, order preserved
				let mut restored = batch;
				restored.extend(state.pending.drain(..));
				state.bytes = restored.iter().map(|u| u.payload.len()).sum();
				state.pending = restored;
				if !self.shutting_down.load(Ordering::SeqCst) {
					if let Some(timer) = state.debounce.take() {
						timer.abort();
					}
					state.debounce =
						Some(self.spawn_timer(doc, self.config.debounce, TimerKind::Debounce));
				}
				return Err(err);
			}

			let again = {
				let state = queue.state.lock().await;
				state.flush_again || !state.pending.is_empty()
			};
			if !again {
				return Ok(());
			}
		}
	}

	/// Hand one batch to the sink, coalescing when configured. A codec
	/// failure is non-retryable: fall back to appending the blobs
	/// individually, order preserved.
	async fn write_batch(
		&self,
		doc: &str,
		batch: &[PendingUpdate],
		reason: FlushReason,
	) -> AlResult<()> {
		let updates = batch.len();
		let bytes_in: usize = batch.iter().map(|u| u.payload.len()).sum();
		let mut bytes_out = 0usize;

		let coalesce = self.config.coalesce && updates >= 2;
		let mut merged: Option<Vec<u8>> = None;
		if coalesce {
			let payloads: Vec<&[u8]> = batch.iter().map(|u| u.payload.as_slice()).collect();
			match codec::merge(&payloads) {
				Ok(blob) => merged = Some(blob),
				Err(err) => {
					warn!("coalescing {} updates for {} failed, appending individually: {}",
						updates, doc, err);
				}
			}
		}

		match merged {
			Some(blob) => {
				// per-update attribution is unrecoverable after a merge;
				// keep the producer id only when the batch has one
				let client_id = uniform_client_id(batch);
				bytes_out = blob.len();
				self.sink.append(doc, &blob, client_id).await?;
				self.counters.appended.fetch_add(1, Ordering::Relaxed);
			}
			None => {
				for update in batch {
					self.sink
						.append(doc, &update.payload, update.client_id.as_deref())
						.await?;
					bytes_out += update.payload.len();
					self.counters.appended.fetch_add(1, Ordering::Relaxed);
				}
			}
		}

		self.counters.batches.fetch_add(1, Ordering::Relaxed);
		self.counters.bytes_out.fetch_add(bytes_out as u64, Ordering::Relaxed);
		match reason {
			FlushReason::Timeout => &self.counters.flush_timeout,
			FlushReason::Size => &self.counters.flush_size,
			FlushReason::Count => &self.counters.flush_count,
			FlushReason::Manual => &self.counters.flush_manual,
		}
		.fetch_add(1, Ordering::Relaxed);
		self.counters
			.last_flush_ms
			.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);

		debug!("flushed {}: {} updates, {} -> {} bytes ({})",
			doc, updates, bytes_in, bytes_out, reason.as_str());
		self.emit(BatchEvent::Flushed {
			doc: doc.into(),
			updates,
			bytes: bytes_out,
			reason,
		});

		Ok(())
	}

	pub fn stats(&self) -> BatchStats {
		let enqueued = self.counters.enqueued.load(Ordering::Relaxed);
		let appended = self.counters.appended.load(Ordering::Relaxed);
		let batches = self.counters.batches.load(Ordering::Relaxed);
		let bytes_in = self.counters.bytes_in.load(Ordering::Relaxed);
		let bytes_out = self.counters.bytes_out.load(Ordering::Relaxed);

		BatchStats {
			enqueued,
			appended,
			coalesced: enqueued.saturating_sub(appended),
			batches,
			flushes_timeout: self.counters.flush_timeout.load(Ordering::Relaxed),
			flushes_size: self.counters.flush_size.load(Ordering::Relaxed),
			flushes_count: self.counters.flush_count.load(Ordering::Relaxed),
			flushes_manual: self.counters.flush_manual.load(Ordering::Relaxed),
			bytes_in,
			bytes_out,
			avg_batch_size: if batches == 0 { 0.0 } else { enqueued as f64 / batches as f64 },
			compression_ratio: if bytes_out == 0 {
				1.0
			} else {
				bytes_in as f64 / bytes_out as f64
			},
			errors: self.counters.errors.load(Ordering::Relaxed),
			last_flush_ms: self.counters.last_flush_ms.load(Ordering::Relaxed),
		}
	}
}

fn uniform_client_id(batch: &[PendingUpdate]) -> Option<&str> {
	let first = batch.first()?.client_id.as_deref();
	for update in &batch[1..] {
		if update.client_id.as_deref() != first {
			return None;
		}
	}
	first
}

impl std::fmt::Debug for BatchWriter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BatchWriter")
			.field("config", &self.config)
			.field("docs", &self.queues.len())
			.field("shutting_down", &self.shutting_down)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct NullSink;

	#[async_trait]
	impl UpdateSink for NullSink {
		async fn append(&self, _doc: &str, _payload: &[u8], _client: Option<&str>) -> AlResult<()> {
			Ok(())
		}
	}

	#[test]
	fn constructor_rejects_invalid_config() {
		let mut config = BatchConfig::test();
		config.max_batch_count = 0;
		assert!(matches!(
			BatchWriter::new(Arc::new(NullSink), config),
			Err(Error::Config(_))
		));
	}

	#[test]
	fn uniform_client_id_requires_agreement() {
		let batch = vec![
			PendingUpdate { payload: vec![1], client_id: Some("a".into()) },
			PendingUpdate { payload: vec![2], client_id: Some("a".into()) },
		];
		assert_eq!(uniform_client_id(&batch), Some("a"));

		let mixed = vec![
			PendingUpdate { payload: vec![1], client_id: Some("a".into()) },
			PendingUpdate { payload: vec![2], client_id: Some("b".into()) },
		];
		assert_eq!(uniform_client_id(&mixed), None);

		let anonymous = vec![PendingUpdate { payload: vec![1], client_id: None }];
		assert_eq!(uniform_client_id(&anonymous), None);
	}

	#[test]
	fn flush_reason_labels() {
		assert_eq!(FlushReason::Size.as_str(), "size");
		assert_eq!(FlushReason::Timeout.as_str(), "timeout");
	}
}

// vim: ts=4
