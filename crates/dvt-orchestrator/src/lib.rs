//! Migration orchestrator.
//!
//! Sequences entity imports by dependency tier so references always resolve,
//! re-applies deferred (self- and cyclic-reference) fields in a second pass,
//! associates many-to-many pairs in a third, and streams progress, errors and
//! a final summary to disk. The export path drives the same pool in the
//! other direction: query, page, archive.

mod archive;
mod export;
mod orchestrator;
mod request;

pub use archive::{ArchiveManifest, ArchiveWriter, DataArchive, RelationshipPair};
pub use export::{DEFAULT_PAGE_SIZE, ExportOutcome, ExportRequest, run_export};
pub use orchestrator::{MigrationOrchestrator, UserMapping, load_user_mapping};
pub use request::{ImportMode, OrchestratorRequest};
