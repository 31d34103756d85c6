//! The ingest validator performs metadata acceptance checks for each
//! match: an etag-verified fetch of the metadata CSV, the identifier
//! character policy, filename agreement, and a dry-run create against the
//! record service. Every match produces exactly one outbound message so
//! the submitter always sees an outcome.

mod ingest;

pub use ingest::{Ingest, MetadataSource, Verdict};
