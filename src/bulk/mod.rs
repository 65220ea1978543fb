//! Bulk download orchestration.
//!
//! A [`BulkJob`] is created from CivitAI search results, flattened into
//! [`FileDescriptor`]s and processed in batches by [`BulkDownloadManager`].
//! Every file goes through the transfer collaborator under retry and is then
//! handed to the security scanner; only files that pass count as downloaded.
//!
//! ```text
//! PENDING -> PROCESSING -> COMPLETED | FAILED | CANCELLED
//!               ^    |
//!               |    v
//!              PAUSED
//! ```

mod job;
mod manager;
mod model;

use thiserror::Error;

pub use job::{
    BatchConfig, BatchStrategy, BulkJob, BulkStatistics, BulkStatus, FileOutcome, JobOptions, JobProgress, JobReport,
    TaskReport,
};
pub use manager::{BulkDownloadManager, CompletionCallback, ProgressCallback};
pub use model::{FileDescriptor, ModelFile, ModelSearchResult, ModelVersion, extract_files, parse_search_results};

#[derive(Error, Debug)]
pub enum BulkError {
    #[error("unknown bulk job: {job_id}")]
    UnknownJob { job_id: String },

    #[error("bulk job {job_id} is {status}, expected PENDING")]
    InvalidState { job_id: String, status: BulkStatus },
}
