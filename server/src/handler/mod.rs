//! HTTP handlers.

pub mod health;
pub mod notes;
pub mod persistence;

// vim: ts=4
