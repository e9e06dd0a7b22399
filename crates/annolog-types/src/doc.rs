//! Document name convention.
//!
//! A logical document is identified by a stable string key. The key
//! encodes its kind by prefix: `note:<uuid>` for a note body and
//! `panel:<noteId>:<panelId>` for a panel attached to a note. The delete
//! cascade relies on this convention; everything else treats the name as
//! an opaque key.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AlResult, Error};

/// Upper bound on doc name length, matching the updates index width.
const MAX_DOC_NAME_LEN: usize = 512;

// DocName //
//*********//
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DocName(Box<str>);

impl DocName {
	/// Validate and wrap a raw document key.
	pub fn new(name: impl Into<Box<str>>) -> AlResult<Self> {
		let name = name.into();
		if name.is_empty() {
			return Err(Error::Validation("docName must not be empty".into()));
		}
		if name.len() > MAX_DOC_NAME_LEN {
			return Err(Error::Validation(format!(
				"docName exceeds {} bytes",
				MAX_DOC_NAME_LEN
			)));
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Parse the kind prefix. Names outside the convention are `Other`
	/// and still fully usable as persistence keys.
	pub fn kind(&self) -> DocKind<'_> {
		if let Some(id) = self.0.strip_prefix("note:") {
			if !id.is_empty() {
				return DocKind::Note(id);
			}
		} else if let Some(rest) = self.0.strip_prefix("panel:") {
			if let Some((note_id, panel_id)) = rest.split_once(':') {
				if !note_id.is_empty() && !panel_id.is_empty() {
					return DocKind::Panel { note_id, panel_id };
				}
			}
		}
		DocKind::Other
	}

	/// The note uuid this document belongs to, if the name follows the
	/// note/panel convention.
	pub fn note_id(&self) -> Option<&str> {
		match self.kind() {
			DocKind::Note(id) => Some(id),
			DocKind::Panel { note_id, .. } => Some(note_id),
			DocKind::Other => None,
		}
	}
}

impl std::fmt::Display for DocName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl AsRef<str> for DocName {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

impl Serialize for DocName {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for DocName {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;
		DocName::new(raw).map_err(serde::de::Error::custom)
	}
}

/// Kind encoded by the doc name prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DocKind<'a> {
	Note(&'a str),
	Panel { note_id: &'a str, panel_id: &'a str },
	Other,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_empty_name() {
		assert!(matches!(DocName::new(""), Err(Error::Validation(_))));
	}

	#[test]
	fn rejects_oversized_name() {
		let name = "x".repeat(MAX_DOC_NAME_LEN + 1);
		assert!(matches!(DocName::new(name), Err(Error::Validation(_))));
	}

	#[test]
	fn parses_note_kind() {
		let doc = DocName::new("note:4a3f2e10-9f6c-4f7e-a0d5-6f1b7c2d3e4f").expect("valid name");
		assert_eq!(doc.kind(), DocKind::Note("4a3f2e10-9f6c-4f7e-a0d5-6f1b7c2d3e4f"));
		assert_eq!(doc.note_id(), Some("4a3f2e10-9f6c-4f7e-a0d5-6f1b7c2d3e4f"));
	}

	#[test]
	fn parses_panel_kind() {
		let doc = DocName::new("panel:note-1:panel-7").expect("valid name");
		assert_eq!(doc.kind(), DocKind::Panel { note_id: "note-1", panel_id: "panel-7" });
		assert_eq!(doc.note_id(), Some("note-1"));
	}

	#[test]
	fn unprefixed_names_are_other() {
		let doc = DocName::new("scratchpad").expect("valid name");
		assert_eq!(doc.kind(), DocKind::Other);
		assert_eq!(doc.note_id(), None);
	}

	#[test]
	fn degenerate_prefixes_are_other() {
		assert_eq!(DocName::new("note:").expect("valid name").kind(), DocKind::Other);
		assert_eq!(DocName::new("panel:x").expect("valid name").kind(), DocKind::Other);
		assert_eq!(DocName::new("panel::y").expect("valid name").kind(), DocKind::Other);
	}
}

// vim: ts=4
