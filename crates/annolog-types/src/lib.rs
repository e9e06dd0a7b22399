//! Shared types for the Annolog persistence core.
//!
//! This crate contains the vocabulary shared between the persistence
//! engines and the HTTP server: the error sum type, the document name
//! convention, and the common prelude.

pub mod doc;
pub mod error;
pub mod prelude;

// vim: ts=4
