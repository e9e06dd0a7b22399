//! Opaque CRDT codec.
//!
//! Thin wrapper around yrs (the Rust Yjs port). Update blobs and snapshot
//! blobs are both v1 lib0 encodings; a snapshot is simply a full-state
//! update. Nothing outside this module decodes either.
//!
//! `merge` is associative over the Yjs update semigroup and accepts its
//! inputs in any order; callers keep arrival order anyway for the
//! non-coalesced fallback path.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use annolog_types::prelude::*;

/// Combine several update blobs into one semantically equivalent blob.
///
/// Any malformed input fails the whole merge with `Error::Codec`; the
/// batching writer treats that as non-retryable and falls back to
/// persisting the blobs individually.
pub fn merge<B: AsRef<[u8]>>(blobs: &[B]) -> AlResult<Vec<u8>> {
	let mut updates = Vec::with_capacity(blobs.len());
	for blob in blobs {
		updates.push(decode(blob.as_ref())?);
	}
	Ok(Update::merge_updates(updates).encode_v1())
}

/// A fresh empty document.
pub fn new_doc() -> Doc {
	Doc::new()
}

/// Fold one update blob into an in-memory document.
pub fn apply(doc: &Doc, blob: &[u8]) -> AlResult<()> {
	let update = decode(blob)?;
	let mut txn = doc.transact_mut();
	txn.apply_update(update)
		.map_err(|err| Error::Codec(format!("failed to apply update: {}", err)))
}

/// Encode the full document state as a snapshot blob.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
	let txn = doc.transact();
	txn.encode_state_as_update_v1(&StateVector::default())
}

/// Rebuild a document from an optional snapshot plus a sequence of
/// updates and re-encode the result. Used by `load` and by compaction.
pub fn fold<B: AsRef<[u8]>>(snapshot: Option<&[u8]>, updates: &[B]) -> AlResult<Vec<u8>> {
	let doc = new_doc();
	if let Some(state) = snapshot {
		apply(&doc, state)?;
	}
	for update in updates {
		apply(&doc, update.as_ref())?;
	}
	Ok(encode_state(&doc))
}

fn decode(blob: &[u8]) -> AlResult<Update> {
	Update::decode_v1(blob).map_err(|err| Error::Codec(format!("malformed update blob: {}", err)))
}

#[cfg(test)]
mod tests {
	use yrs::{GetString, Text};

	use super::*;

	fn text_doc() -> (Doc, yrs::TextRef) {
		let doc = Doc::new();
		let text = doc.get_or_insert_text("body");
		(doc, text)
	}

	fn insert_update(doc: &Doc, text: &yrs::TextRef, index: u32, chunk: &str) -> Vec<u8> {
		let before = {
			let txn = doc.transact();
			txn.state_vector()
		};
		{
			let mut txn = doc.transact_mut();
			text.insert(&mut txn, index, chunk);
		}
		let txn = doc.transact();
		txn.encode_state_as_update_v1(&before)
	}

	fn body_of(blob: &[u8]) -> String {
		let doc = new_doc();
		apply(&doc, blob).expect("blob applies");
		let text = doc.get_or_insert_text("body");
		let txn = doc.transact();
		text.get_string(&txn)
	}

	#[test]
	fn merge_is_equivalent_to_sequential_apply() {
		let (doc, text) = text_doc();
		let u1 = insert_update(&doc, &text, 0, "Hello");
		let u2 = insert_update(&doc, &text, 5, ", world");
		let u3 = insert_update(&doc, &text, 12, "!");

		let merged = merge(&[u1.clone(), u2.clone(), u3.clone()]).expect("merge succeeds");
		assert_eq!(body_of(&merged), "Hello, world!");

		let folded = fold(None, &[u1, u2, u3]).expect("fold succeeds");
		assert_eq!(body_of(&folded), "Hello, world!");
	}

	#[test]
	fn merge_is_order_independent() {
		let (doc, text) = text_doc();
		let u1 = insert_update(&doc, &text, 0, "ab");
		let u2 = insert_update(&doc, &text, 2, "cd");

		let forward = merge(&[u1.clone(), u2.clone()]).expect("merge succeeds");
		let backward = merge(&[u2, u1]).expect("merge succeeds");
		assert_eq!(body_of(&forward), body_of(&backward));
	}

	#[test]
	fn merge_rejects_garbage() {
		let (doc, text) = text_doc();
		let good = insert_update(&doc, &text, 0, "x");
		let err = merge(&[good.as_slice(), b"not an update".as_slice()])
			.expect_err("garbage must fail");
		assert!(matches!(err, Error::Codec(_)));
	}

	#[test]
	fn apply_rejects_garbage() {
		let doc = new_doc();
		assert!(matches!(apply(&doc, b"\xff\xff\xff"), Err(Error::Codec(_))));
	}

	#[test]
	fn snapshot_roundtrip_is_deterministic() {
		let (doc, text) = text_doc();
		let _ = insert_update(&doc, &text, 0, "stable contents");
		let snapshot = encode_state(&doc);

		let reencoded = fold(Some(&snapshot), &[] as &[Vec<u8>]).expect("fold succeeds");
		let reencoded_again =
			fold(Some(&reencoded), &[] as &[Vec<u8>]).expect("fold succeeds");
		assert_eq!(reencoded, reencoded_again);
	}

	#[test]
	fn fold_layers_updates_over_snapshot() {
		let (doc, text) = text_doc();
		let _ = insert_update(&doc, &text, 0, "base");
		let snapshot = encode_state(&doc);
		let tail = insert_update(&doc, &text, 4, " + tail");

		let folded = fold(Some(&snapshot), &[tail]).expect("fold succeeds");
		assert_eq!(body_of(&folded), "base + tail");
	}
}

// vim: ts=4
