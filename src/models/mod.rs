//! Core data models for the archive versioning and lifecycle engine.
//!
//! These are plain typed records; the metadata index maps them to and from
//! its own row types so no component handles untyped documents.

pub mod archive;
pub mod history;
pub mod staged_upload;
