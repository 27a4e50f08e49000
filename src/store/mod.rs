//! Storage traits for records and run records.
//!
//! `RecordStorage` is everything the record transitions and the daemon need
//! from durable storage; `RunStorage` holds the per-run lifecycle records.
//! [`fs::FsRecordStore`] implements both on the local filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::daemon::{AnyRunRecord, RunId, RunRecord, RunState};
use crate::domain::record::{AnyRecord, Archived, Failed, Record, RecordId, RecordState, Sent};
use crate::error::{Result, TexpostError};
use crate::mailer::OutgoingMail;
use crate::template::Template;

pub mod fs;

pub use fs::FsRecordStore;

#[async_trait]
pub trait RecordStorage: Send + Sync {
    /// Stream every active record in the data directory, in file name order.
    ///
    /// Each input is paired with its persisted ledger; inputs without one are
    /// new `pending` records. Records whose ledger is already terminal are
    /// skipped. A malformed input yields `InvalidRecord` for that item only;
    /// `StoreUnavailable` means the directory itself cannot be read.
    fn list_pending(&self) -> BoxStream<'_, Result<AnyRecord>>;

    /// Persisted state of one record, if it has a ledger.
    async fn get_record(&self, id: &RecordId) -> Result<Option<AnyRecord>>;

    /// Durably write a record's state before the next stage may begin.
    async fn persist<T: RecordState + Clone>(&self, record: &Record<T>) -> Result<()>
    where
        AnyRecord: From<Record<T>>;

    /// Private working directory of a record, for its source and artifact.
    fn work_dir(&self, id: &RecordId) -> PathBuf;

    /// Directory a sent record will be archived into. An interrupted archive
    /// of the same record resumes in the same directory.
    async fn archive_location(&self, record: &Record<Sent>) -> Result<PathBuf>;

    /// Write rendered source into the record's working directory.
    async fn write_source(&self, id: &RecordId, text: &str) -> Result<PathBuf>;

    /// Write the outgoing message next to the other staged mails.
    async fn stage_email(&self, mail: &OutgoingMail) -> Result<PathBuf>;

    /// Move the input, working directory, staged mail and ledger into the
    /// archive and write the final state there.
    ///
    /// Nothing is persisted on error; the ledger keeps saying `sent`.
    async fn archive(&self, record: &Record<Archived>) -> Result<()>;

    /// Persist the failed state, then move the record's files into the
    /// failed area together with a diagnostics file.
    async fn fail(&self, record: &Record<Failed>) -> Result<()>;

    /// Move an input that could not be read as a record into the failed area.
    async fn quarantine(&self, path: &Path, error: &TexpostError) -> Result<()>;

    /// Finish finalizations interrupted by a crash. Returns how many records
    /// were finalized.
    async fn recover(&self) -> Result<usize>;

    /// Load and parse a template by file name.
    async fn load_template(&self, name: &str, required: &[String]) -> Result<Template>;
}

#[async_trait]
pub trait RunStorage: Send + Sync {
    async fn persist_run<T: RunState + Clone>(&self, record: &RunRecord<T>) -> Result<()>
    where
        AnyRunRecord: From<RunRecord<T>>;

    async fn get_run(&self, run_id: RunId) -> Result<AnyRunRecord>;

    async fn list_runs(&self) -> Result<Vec<AnyRunRecord>>;
}
