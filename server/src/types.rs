//! Transport types.
//!
//! Binary payloads cross the JSON boundary as standard padded base64.
//! Legacy clients send integer arrays on ingest paths; those are
//! accepted but never produced.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use annolog_types::prelude::*;

/// Binary payload as received from a client.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum BinaryInput {
	/// Standard padded base64 string (the normative encoding).
	Base64(String),
	/// Legacy array-of-integers encoding.
	Bytes(Vec<u8>),
}

impl BinaryInput {
	pub fn decode(self) -> AlResult<Vec<u8>> {
		match self {
			BinaryInput::Base64(raw) => BASE64
				.decode(raw.as_bytes())
				.map_err(|_| Error::Validation("payload is not valid base64".into())),
			BinaryInput::Bytes(bytes) => Ok(bytes),
		}
	}
}

/// Encode an outgoing blob; output is always base64.
pub fn to_base64(data: &[u8]) -> String {
	BASE64.encode(data)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_base64_strings() {
		let input: BinaryInput =
			serde_json::from_str("\"aGVsbG8=\"").expect("deserializes");
		assert_eq!(input.decode().expect("decodes"), b"hello");
	}

	#[test]
	fn decodes_legacy_integer_arrays() {
		let input: BinaryInput = serde_json::from_str("[104, 105]").expect("deserializes");
		assert_eq!(input.decode().expect("decodes"), b"hi");
	}

	#[test]
	fn rejects_malformed_base64() {
		let input: BinaryInput =
			serde_json::from_str("\"!!not-base64!!\"").expect("deserializes");
		assert!(matches!(input.decode(), Err(Error::Validation(_))));
	}

	#[test]
	fn outputs_padded_base64() {
		assert_eq!(to_base64(b"hello"), "aGVsbG8=");
	}
}

// vim: ts=4
