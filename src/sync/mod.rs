//! The bidirectional sync engine: upload (agent → planner) and download
//! (planner → agent) pipelines, the snapshot diff between them, and the
//! per-task lock registry both sides serialize through.

pub mod diff;
pub mod download;
pub mod locks;
pub mod upload;

pub use diff::{changed_fields, DeleteDetector, DiffOutcome};
pub use download::DownloadPipeline;
pub use locks::TaskLocks;
pub use upload::UploadPipeline;
