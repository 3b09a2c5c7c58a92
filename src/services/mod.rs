pub mod archive_error;
pub mod archive_service;
pub mod blob_store;
pub mod expiry_reclaimer;
pub mod history_tracker;
pub mod lifecycle_engine;
pub mod metadata_index;
pub mod query_service;
pub mod validation;
pub mod version_resolver;
