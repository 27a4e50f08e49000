//! Filesystem-backed record store.
//!
//! Layout under the configured root:
//!
//! ```text
//! data/<input>.json          input records
//! data/.state/<id>.json      state ledger, one per active record
//! data/.state/runs/<id>.json run records
//! templates/<name>           templates
//! pdfs/<id>/                 private working directory (source + artifact)
//! emails/<id>.json           staged outgoing message
//! archive/<id>/              finalized sent records
//! failed/<id>/               finalized failed records, with diagnostics.txt
//! ```
//!
//! Every state write goes to a temp file that is synced and renamed over the
//! target, so a ledger is always either the old or the new state.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::{RecordStorage, RunStorage};
use crate::config::PathsConfig;
use crate::daemon::{AnyRunRecord, RunId, RunRecord, RunState};
use crate::domain::input::parse_record;
use crate::domain::record::{AnyRecord, Archived, Failed, Record, RecordId, RecordState, Sent};
use crate::error::{Result, TexpostError};
use crate::mailer::OutgoingMail;
use crate::template::Template;

const STATE_FILE: &str = "state.json";
const DIAGNOSTICS_FILE: &str = "diagnostics.txt";

/// Record store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    data_dir: PathBuf,
    state_dir: PathBuf,
    runs_dir: PathBuf,
    templates_dir: PathBuf,
    pdfs_dir: PathBuf,
    emails_dir: PathBuf,
    archive_dir: PathBuf,
    failed_dir: PathBuf,
}

impl FsRecordStore {
    /// Open the store, creating missing directories.
    ///
    /// Fails with `StoreUnavailable` if the data directory cannot be read.
    pub async fn open(paths: &PathsConfig) -> Result<Self> {
        // Working directories are handed to a child process that runs
        // inside them, so every path is kept absolute.
        let absolute = |dir: PathBuf| {
            std::path::absolute(&dir).map_err(|source| unavailable(&dir, source))
        };
        let data_dir = absolute(paths.data_dir())?;
        let state_dir = data_dir.join(".state");
        let store = Self {
            runs_dir: state_dir.join("runs"),
            state_dir,
            templates_dir: absolute(paths.templates_dir())?,
            pdfs_dir: absolute(paths.pdfs_dir())?,
            emails_dir: absolute(paths.emails_dir())?,
            archive_dir: absolute(paths.archive_dir())?,
            failed_dir: absolute(paths.failed_dir())?,
            data_dir,
        };

        for dir in [
            &store.data_dir,
            &store.runs_dir,
            &store.pdfs_dir,
            &store.emails_dir,
            &store.archive_dir,
            &store.failed_dir,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| unavailable(dir, source))?;
        }
        tokio::fs::read_dir(&store.data_dir)
            .await
            .map_err(|source| unavailable(&store.data_dir, source))?;

        tracing::debug!(data_dir = %store.data_dir.display(), "Record store opened");
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    fn ledger_path(&self, id: &RecordId) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }

    fn email_path(&self, id: &RecordId) -> PathBuf {
        self.emails_dir.join(format!("{}.json", id))
    }

    /// Input files in the data directory, sorted by file name.
    async fn input_files(&self) -> Result<Vec<PathBuf>> {
        list_json_files(&self.data_dir)
            .await
            .map_err(|source| unavailable(&self.data_dir, source))
    }

    async fn read_ledger(&self, id: &RecordId) -> Result<Option<AnyRecord>> {
        match tokio::fs::read_to_string(self.ledger_path(id)).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load one input together with its ledger. `None` if the input vanished
    /// or the record is already terminal.
    async fn load_input(&self, path: PathBuf) -> Result<Option<AnyRecord>> {
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TexpostError::InvalidRecord {
                    path,
                    reason: format!("cannot read file: {}", e),
                });
            }
        };
        let data = parse_record(&path, &raw)?;

        match self.read_ledger(&data.id).await? {
            Some(ledger) if ledger.data().source_file != path => {
                if tokio::fs::try_exists(&ledger.data().source_file)
                    .await
                    .unwrap_or(false)
                {
                    return Err(TexpostError::InvalidRecord {
                        path,
                        reason: format!(
                            "record id '{}' is already used by {}",
                            data.id,
                            ledger.data().source_file.display()
                        ),
                    });
                }
                Ok((!ledger.is_terminal()).then_some(ledger))
            }
            Some(ledger) => Ok((!ledger.is_terminal()).then_some(ledger)),
            None => Ok(Some(AnyRecord::Pending(Record::new(data)))),
        }
    }

    /// Pick the directory for a finalized record: `<base>/<id>`, or the first
    /// free `<base>/<id>_<n>`. A directory whose state file belongs to the
    /// same record is reused so interrupted finalizations resume in place.
    async fn finalize_location<F>(
        &self,
        base: &Path,
        id: &RecordId,
        is_same: F,
    ) -> Result<PathBuf>
    where
        F: Fn(&AnyRecord) -> bool,
    {
        let mut candidate = base.join(id.as_str());
        let mut n = 1;
        loop {
            if !tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
            if let Ok(raw) = tokio::fs::read_to_string(candidate.join(STATE_FILE)).await
                && let Ok(existing) = serde_json::from_str::<AnyRecord>(&raw)
                && existing.id() == id
                && is_same(&existing)
            {
                return Ok(candidate);
            }
            candidate = base.join(format!("{}_{}", id, n));
            n += 1;
        }
    }

    async fn failed_location(&self, record: &Record<Failed>) -> Result<PathBuf> {
        let failed_at = record.state.failed_at;
        self.finalize_location(&self.failed_dir, &record.data.id, |existing| {
            matches!(existing, AnyRecord::Failed(f) if f.state.failed_at == failed_at)
        })
        .await
    }

    /// Move everything a record owns into `location`. Moving the input out of
    /// the data directory is the last step.
    async fn move_record_files(
        &self,
        id: &RecordId,
        source_file: &Path,
        location: &Path,
    ) -> Result<()> {
        move_path(&self.pdfs_dir.join(id.as_str()), &location.join("pdfs")).await?;
        move_path(&self.email_path(id), &location.join("email.json")).await?;
        if let Some(name) = source_file.file_name() {
            move_path(source_file, &location.join(name)).await?;
        }
        Ok(())
    }

    async fn finalize_failed(&self, record: &Record<Failed>) -> Result<PathBuf> {
        let location = self.failed_location(record).await?;
        tokio::fs::create_dir_all(&location).await?;
        write_json(&location.join(STATE_FILE), &AnyRecord::from(record.clone())).await?;
        write_atomic(
            &location.join(DIAGNOSTICS_FILE),
            failure_diagnostics(record).as_bytes(),
        )
        .await?;
        self.move_record_files(&record.data.id, &record.data.source_file, &location)
            .await?;
        remove_if_exists(&self.ledger_path(&record.data.id)).await?;
        Ok(location)
    }

    /// Finish an archive whose input already left the data directory.
    async fn finish_archive(&self, record: &Record<Sent>) -> Result<bool> {
        let sent_at = record.state.sent_at;
        let location = self
            .finalize_location(&self.archive_dir, &record.data.id, |existing| {
                matches!(existing, AnyRecord::Archived(a) if a.state.sent_at == sent_at)
            })
            .await?;
        if !tokio::fs::try_exists(location.join(STATE_FILE)).await? {
            return Ok(false);
        }
        self.move_record_files(&record.data.id, &record.data.source_file, &location)
            .await?;
        remove_if_exists(&self.ledger_path(&record.data.id)).await?;
        Ok(true)
    }

    async fn ledgers(&self) -> Result<Vec<AnyRecord>> {
        let mut ledgers = Vec::new();
        for path in list_json_files(&self.state_dir).await? {
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match serde_json::from_str::<AnyRecord>(&raw) {
                    Ok(record) => ledgers.push(record),
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Skipping unreadable ledger"
                        );
                    }
                },
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ledgers)
    }
}

fn unavailable(path: &Path, source: std::io::Error) -> TexpostError {
    TexpostError::StoreUnavailable {
        path: path.to_path_buf(),
        source,
    }
}

fn failure_diagnostics(record: &Record<Failed>) -> String {
    format!(
        "record: {}\nstage: {:?}\nfailed_at: {}\ncompile_attempts: {}\n\
         delivery_attempts: {}\n\n{}\n",
        record.data.id,
        record.state.stage,
        record.state.failed_at.to_rfc3339(),
        record.state.attempts.compile,
        record.state.attempts.delivery,
        record.state.reason.to_error_message()
    )
}

#[async_trait]
impl RecordStorage for FsRecordStore {
    fn list_pending(&self) -> BoxStream<'_, Result<AnyRecord>> {
        stream::once(self.input_files())
            .flat_map(move |listing| match listing {
                Ok(paths) => stream::iter(paths)
                    .then(move |path| self.load_input(path))
                    .filter_map(|item| futures::future::ready(item.transpose()))
                    .left_stream(),
                Err(e) => stream::iter(vec![Err(e)]).right_stream(),
            })
            .boxed()
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<AnyRecord>> {
        self.read_ledger(id).await
    }

    async fn persist<T: RecordState + Clone>(&self, record: &Record<T>) -> Result<()>
    where
        AnyRecord: From<Record<T>>,
    {
        let any = AnyRecord::from(record.clone());
        write_json(&self.ledger_path(any.id()), &any).await?;
        tracing::trace!(record_id = %any.id(), state = %any.status(), "Persisted record state");
        Ok(())
    }

    fn work_dir(&self, id: &RecordId) -> PathBuf {
        self.pdfs_dir.join(id.as_str())
    }

    async fn archive_location(&self, record: &Record<Sent>) -> Result<PathBuf> {
        let sent_at = record.state.sent_at;
        self.finalize_location(&self.archive_dir, &record.data.id, |existing| {
            matches!(existing, AnyRecord::Archived(a) if a.state.sent_at == sent_at)
        })
        .await
    }

    async fn write_source(&self, id: &RecordId, text: &str) -> Result<PathBuf> {
        let work_dir = self.work_dir(id);
        tokio::fs::create_dir_all(&work_dir).await?;
        // A stale artifact must never be mistaken for the new one.
        remove_if_exists(&work_dir.join(format!("{}.pdf", id))).await?;
        let path = work_dir.join(format!("{}.tex", id));
        write_atomic(&path, text.as_bytes()).await?;
        Ok(path)
    }

    async fn stage_email(&self, mail: &OutgoingMail) -> Result<PathBuf> {
        let path = self.email_path(&mail.record_id);
        write_json(&path, mail).await?;
        Ok(path)
    }

    #[tracing::instrument(skip_all, fields(record_id = %record.data.id))]
    async fn archive(&self, record: &Record<Archived>) -> Result<()> {
        let location = &record.state.location;
        tokio::fs::create_dir_all(location).await?;
        write_json(&location.join(STATE_FILE), &AnyRecord::from(record.clone())).await?;
        self.move_record_files(&record.data.id, &record.data.source_file, location)
            .await?;
        remove_if_exists(&self.ledger_path(&record.data.id)).await?;
        tracing::info!(location = %location.display(), "Record archived");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(record_id = %record.data.id))]
    async fn fail(&self, record: &Record<Failed>) -> Result<()> {
        self.persist(record).await?;
        let location = self.finalize_failed(record).await?;
        tracing::warn!(
            location = %location.display(),
            reason = %record.state.reason.to_error_message(),
            "Record failed"
        );
        Ok(())
    }

    async fn quarantine(&self, path: &Path, error: &TexpostError) -> Result<()> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = RecordId::sanitized(&stem);
        let location = self
            .finalize_location(&self.failed_dir, &id, |_| false)
            .await?;
        tokio::fs::create_dir_all(&location).await?;
        write_atomic(
            &location.join(DIAGNOSTICS_FILE),
            format!(
                "input: {}\nstage: intake\nfailed_at: {}\n\n{}\n",
                path.display(),
                chrono::Utc::now().to_rfc3339(),
                error
            )
            .as_bytes(),
        )
        .await?;
        if let Some(name) = path.file_name() {
            move_path(path, &location.join(name)).await?;
        }
        tracing::warn!(input = %path.display(), error = %error, "Quarantined invalid input");
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let mut finalized = 0;
        for ledger in self.ledgers().await? {
            let input_present = tokio::fs::try_exists(&ledger.data().source_file).await?;
            match ledger {
                AnyRecord::Failed(record) => {
                    self.finalize_failed(&record).await?;
                    finalized += 1;
                }
                AnyRecord::Sent(record) if !input_present => {
                    if self.finish_archive(&record).await? {
                        finalized += 1;
                    } else {
                        tracing::warn!(
                            record_id = %record.data.id,
                            "Sent record has no input and no archive; leaving ledger in place"
                        );
                    }
                }
                other if !input_present => {
                    tracing::warn!(
                        record_id = %other.id(),
                        state = %other.status(),
                        "Ledger has no input file; leaving it in place"
                    );
                }
                _ => {}
            }
        }
        if finalized > 0 {
            tracing::info!(finalized, "Finished interrupted finalizations");
        }
        Ok(finalized)
    }

    async fn load_template(&self, name: &str, required: &[String]) -> Result<Template> {
        let path = self.templates_dir.join(name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| TexpostError::TemplateInvalid {
                name: name.to_string(),
                reason: format!("cannot read {}: {}", path.display(), e),
            })?;
        Template::parse(name, text, required)
    }
}

#[async_trait]
impl RunStorage for FsRecordStore {
    async fn persist_run<T: RunState + Clone>(&self, record: &RunRecord<T>) -> Result<()>
    where
        AnyRunRecord: From<RunRecord<T>>,
    {
        let any = AnyRunRecord::from(record.clone());
        write_json(&self.runs_dir.join(format!("{}.json", any.id())), &any).await
    }

    async fn get_run(&self, run_id: RunId) -> Result<AnyRunRecord> {
        let raw = tokio::fs::read_to_string(self.runs_dir.join(format!("{}.json", run_id))).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn list_runs(&self) -> Result<Vec<AnyRunRecord>> {
        let mut runs = Vec::new();
        for path in list_json_files(&self.runs_dir).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str(&raw) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable run record"
                ),
            }
        }
        Ok(runs)
    }
}

// ============================================================================
// Filesystem helpers
// ============================================================================

/// Non-hidden `*.json` files in a directory, sorted by file name.
async fn list_json_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden
            && entry.file_type().await?.is_file()
            && path.extension().is_some_and(|ext| ext == "json")
        {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

/// Write via temp file, fsync and rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp", file_name));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    sync_dir(parent).await;
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Move a file or directory, falling back to copying across filesystems.
/// Returns `false` if `from` does not exist.
async fn move_path(from: &Path, to: &Path) -> std::io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(from).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(true),
        Err(_) if meta.is_file() => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
            Ok(true)
        }
        Err(_) if meta.is_dir() => {
            tokio::fs::create_dir_all(to).await?;
            let mut entries = tokio::fs::read_dir(from).await?;
            while let Some(entry) = entries.next_entry().await? {
                Box::pin(move_path(&entry.path(), &to.join(entry.file_name()))).await?;
            }
            tokio::fs::remove_dir(from).await?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
