//! Daemon that drives records through render, compile and deliver.
//!
//! A batch pulls every active record from the store and processes them with
//! bounded parallelism. Each record runs in its own task and walks its state
//! machine until it is archived, failed, or interrupted; every transition is
//! persisted before the next stage starts.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::compiler::Compiler;
use crate::config::{Config, TemplateConfig};
use crate::domain::record::{
    AnyRecord, CompileOutcome, DeliveryOutcome, Failed, MailDefaults, Record, RecordId,
    RenderOutcome, RetryPolicy,
};
use crate::error::error_serialization::serialize_chain;
use crate::error::{Result, TexpostError};
use crate::mailer::Mailer;
use crate::store::{RecordStorage, RunStorage};
use crate::template::Template;

pub mod transitions;
pub mod types;

pub use types::{
    AnyRunRecord, Finished, Initializing, RunData, RunId, RunRecord, RunState, RunStats, Running,
};

/// Configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Records processed in parallel. Each record's own stages are sequential.
    pub max_concurrent_records: usize,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// Interval for refreshing the run record (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Pause between batches in watch mode (milliseconds)
    pub poll_interval_ms: u64,

    /// Interval for logging daemon status (records in flight) in milliseconds.
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_records: 4,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
            heartbeat_interval_ms: 10_000,
            poll_interval_ms: 5_000,
            status_log_interval_ms: Some(2_000),
        }
    }
}

impl DaemonConfig {
    /// Retry policy for a stage with the given attempt limit.
    pub fn retry_policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_ms: self.backoff_ms,
            backoff_factor: self.backoff_factor,
            max_backoff_ms: self.max_backoff_ms,
        }
    }
}

/// A record that ended `failed`, with its diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecord {
    pub id: String,
    pub diagnostic: String,
}

impl From<&Record<Failed>> for FailedRecord {
    fn from(record: &Record<Failed>) -> Self {
        Self {
            id: record.data.id.to_string(),
            diagnostic: record.state.reason.to_error_message(),
        }
    }
}

/// What a run achieved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub batches: u64,
    pub sent: u64,
    pub failed: Vec<FailedRecord>,
    /// Records still active in the data directory when the run ended.
    pub pending: u64,
}

impl RunSummary {
    fn absorb(&mut self, batch: RunSummary) {
        self.batches += batch.batches;
        self.sent += batch.sent;
        self.failed.extend(batch.failed);
        self.pending = batch.pending;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent: {}, failed: {}, pending: {}",
            self.sent,
            self.failed.len(),
            self.pending
        )?;
        for failed in &self.failed {
            write!(f, "\n  {}: {}", failed.id, failed.diagnostic)?;
        }
        Ok(())
    }
}

enum RecordOutcome {
    Sent,
    /// Sent by an earlier run; only the archive step ran now.
    Archived,
    Failed(FailedRecord),
    /// Stopped between stages; the persisted state is resumed next batch.
    Interrupted,
    /// Already terminal.
    Skipped,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    in_flight: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> RunStats {
        RunStats {
            batches: self.batches.load(Ordering::Relaxed),
            records_sent: self.sent.load(Ordering::Relaxed),
            records_failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            records_in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Everything a record task needs, owned by one batch.
struct BatchContext<S, C, M> {
    storage: Arc<S>,
    compiler: Arc<C>,
    mailer: Arc<M>,
    templates: DashMap<String, Arc<Template>>,
    template_config: TemplateConfig,
    compile_policy: RetryPolicy,
    delivery_policy: RetryPolicy,
    mail_defaults: MailDefaults,
    counters: Arc<Counters>,
    /// Cancelled on shutdown or on a batch-level error.
    stop: CancellationToken,
}

impl<S, C, M> BatchContext<S, C, M>
where
    S: RecordStorage,
    C: Compiler,
    M: Mailer,
{
    async fn template(&self, name: Option<&str>) -> Result<Arc<Template>> {
        let name = name.unwrap_or(self.template_config.default_name.as_str());
        if let Some(template) = self.templates.get(name) {
            return Ok(template.value().clone());
        }
        let template = Arc::new(
            self.storage
                .load_template(name, &self.template_config.required_placeholders)
                .await?,
        );
        self.templates.insert(name.to_string(), template.clone());
        Ok(template)
    }

    /// Sleep until `not_before`. Returns false if the batch is stopping.
    async fn wait_until(&self, not_before: Option<DateTime<Utc>>) -> bool {
        let Some(at) = not_before else {
            return true;
        };
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            return true;
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting for retry backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.stop.cancelled() => false,
        }
    }

    /// Walk one record through its remaining stages.
    async fn drive(&self, record: AnyRecord) -> Result<RecordOutcome> {
        let storage = self.storage.as_ref();
        let mut current = record;
        let mut delivered = false;
        loop {
            if self.stop.is_cancelled() {
                tracing::info!(state = %current.status(), "Record interrupted, state persisted");
                return Ok(RecordOutcome::Interrupted);
            }

            current = match current {
                AnyRecord::Pending(record) => {
                    if !self.wait_until(record.state.not_before).await {
                        return Ok(RecordOutcome::Interrupted);
                    }
                    let template = self.template(record.data.template.as_deref()).await?;
                    match record
                        .render(&template, &self.mail_defaults, storage)
                        .await?
                    {
                        RenderOutcome::Rendered(r) => r.into(),
                        RenderOutcome::Failed(f) => return Ok(RecordOutcome::Failed((&f).into())),
                    }
                }
                AnyRecord::Rendered(record) => {
                    if !self.wait_until(record.state.not_before).await {
                        return Ok(RecordOutcome::Interrupted);
                    }
                    match record
                        .compile(self.compiler.as_ref(), &self.compile_policy, storage)
                        .await?
                    {
                        CompileOutcome::Compiled(r) => r.into(),
                        CompileOutcome::Retry(r) => {
                            self.counters.retries.fetch_add(1, Ordering::Relaxed);
                            r.into()
                        }
                        CompileOutcome::Failed(f) => {
                            return Ok(RecordOutcome::Failed((&f).into()));
                        }
                    }
                }
                AnyRecord::Compiled(record) => {
                    match record
                        .deliver(self.mailer.as_ref(), &self.delivery_policy, storage)
                        .await?
                    {
                        DeliveryOutcome::Sent(r) => {
                            delivered = true;
                            r.into()
                        }
                        DeliveryOutcome::Retry(r) => {
                            self.counters.retries.fetch_add(1, Ordering::Relaxed);
                            r.into()
                        }
                        DeliveryOutcome::Failed(f) => {
                            return Ok(RecordOutcome::Failed((&f).into()));
                        }
                    }
                }
                AnyRecord::Sent(record) => {
                    if let Err((_, e)) = record.archive(storage).await {
                        tracing::warn!(error = %e, "Archive failed, record stays sent");
                    }
                    return Ok(if delivered {
                        RecordOutcome::Sent
                    } else {
                        RecordOutcome::Archived
                    });
                }
                AnyRecord::Archived(_) | AnyRecord::Failed(_) => {
                    return Ok(RecordOutcome::Skipped);
                }
            };
        }
    }
}

/// Daemon that processes the records in the data directory.
pub struct Daemon<S, C, M>
where
    S: RecordStorage + RunStorage,
    C: Compiler,
    M: Mailer,
{
    run_id: RunId,
    storage: Arc<S>,
    compiler: Arc<C>,
    mailer: Arc<M>,
    config: Config,
    counters: Arc<Counters>,
    shutdown_token: CancellationToken,
}

impl<S, C, M> Daemon<S, C, M>
where
    S: RecordStorage + RunStorage + 'static,
    C: Compiler + 'static,
    M: Mailer + 'static,
{
    /// Create a new daemon.
    pub fn new(
        storage: Arc<S>,
        compiler: Arc<C>,
        mailer: Arc<M>,
        config: Config,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            storage,
            compiler,
            mailer,
            config,
            counters: Arc::new(Counters::default()),
            shutdown_token,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Run one batch, or keep polling for new records if `watch` is set.
    ///
    /// The run is registered in storage for its whole duration and closed
    /// with its final statistics, including on error.
    #[tracing::instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn run(&self, watch: bool) -> Result<RunSummary> {
        let record = RunRecord {
            data: RunData {
                id: self.run_id,
                hostname: types::get_hostname(),
                pid: std::process::id(),
                version: types::get_version(),
                watch,
                config_snapshot: self.config.redacted_snapshot(),
            },
            state: Initializing {
                started_at: Utc::now(),
            },
        };
        let running = record.start(self.storage.as_ref()).await?;
        tracing::info!(watch, "Run started");

        let tasks_done = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(running.clone(), tasks_done.clone());
        if let Some(interval_ms) = self.config.daemon.status_log_interval_ms {
            self.spawn_status_log(interval_ms, tasks_done.clone());
        }

        let result = self.run_batches(watch).await;

        tasks_done.cancel();
        let running = match heartbeat.await {
            Ok(latest) => latest,
            Err(e) => {
                tracing::error!(error = %e, "Heartbeat task panicked");
                running
            }
        };
        let error = result.as_ref().err().map(|e| serialize_chain(e));
        if let Err(e) = running
            .finish(self.counters.snapshot(), error, self.storage.as_ref())
            .await
        {
            tracing::error!(error = %e, "Failed to close run record");
        }

        match &result {
            Ok(summary) => tracing::info!(
                sent = summary.sent,
                failed = summary.failed.len(),
                pending = summary.pending,
                "Run finished"
            ),
            Err(e) => tracing::error!(error = %e, "Run aborted"),
        }
        result
    }

    fn spawn_heartbeat(
        &self,
        running: RunRecord<Running>,
        done: CancellationToken,
    ) -> tokio::task::JoinHandle<RunRecord<Running>> {
        let storage = self.storage.clone();
        let counters = self.counters.clone();
        let interval_ms = self.config.daemon.heartbeat_interval_ms.max(1);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await;
            let mut record = running;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Keep the last good record if the write fails.
                        let refreshed = record
                            .clone()
                            .heartbeat(counters.snapshot(), storage.as_ref())
                            .await;
                        match refreshed {
                            Ok(updated) => {
                                record = updated;
                                tracing::trace!("Heartbeat sent");
                            }
                            Err(e) => tracing::error!(error = %e, "Failed to send heartbeat"),
                        }
                    }
                    _ = done.cancelled() => break,
                }
            }
            record
        })
    }

    fn spawn_status_log(&self, interval_ms: u64, done: CancellationToken) {
        let counters = self.counters.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracing::debug!(
                            records_in_flight = counters.in_flight.load(Ordering::Relaxed),
                            records_sent = counters.sent.load(Ordering::Relaxed),
                            "Daemon status"
                        );
                    }
                    _ = done.cancelled() => break,
                }
            }
        });
    }

    async fn run_batches(&self, watch: bool) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            let batch = self.run_batch().await?;
            summary.absorb(batch);

            if !watch || self.shutdown_token.is_cancelled() {
                break;
            }
            let poll = Duration::from_millis(self.config.daemon.poll_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(poll) => {},
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping daemon");
                    break;
                }
            }
        }
        Ok(summary)
    }

    /// Process every active record once, to completion or interruption.
    #[tracing::instrument(skip(self))]
    pub async fn run_batch(&self) -> Result<RunSummary> {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.storage.recover().await?;

        let ctx = Arc::new(BatchContext {
            storage: self.storage.clone(),
            compiler: self.compiler.clone(),
            mailer: self.mailer.clone(),
            templates: DashMap::new(),
            template_config: self.config.template.clone(),
            compile_policy: self.config.compile_policy(),
            delivery_policy: self.config.delivery_policy(),
            mail_defaults: self.config.mail_defaults(),
            counters: self.counters.clone(),
            stop: self.shutdown_token.child_token(),
        });

        // A default template that can never succeed aborts before any record
        // is touched.
        ctx.template(None).await?;

        let semaphore = Arc::new(Semaphore::new(
            self.config.daemon.max_concurrent_records.max(1),
        ));
        let mut join_set: JoinSet<(RecordId, Result<RecordOutcome>)> = JoinSet::new();
        let mut summary = RunSummary {
            batches: 1,
            ..Default::default()
        };
        let mut fatal: Option<TexpostError> = None;
        let mut seen = HashSet::new();

        let mut records = self.storage.list_pending();
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => break,
                next = records.next() => next,
            };
            let Some(item) = next else {
                break;
            };

            while let Some(joined) = join_set.try_join_next() {
                self.handle_joined(joined, &ctx, &mut summary, &mut fatal);
            }

            let record = match item {
                Ok(record) => record,
                Err(e @ TexpostError::InvalidRecord { .. }) => {
                    self.quarantine(e, &mut summary).await;
                    continue;
                }
                Err(e) if e.is_batch_fatal() => {
                    fatal.get_or_insert(e);
                    ctx.stop.cancel();
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Skipping record that could not be loaded");
                    continue;
                }
            };

            if !seen.insert(record.id().clone()) {
                let e = TexpostError::InvalidRecord {
                    path: record.data().source_file.clone(),
                    reason: format!("duplicate record id '{}' in this batch", record.id()),
                };
                self.quarantine(e, &mut summary).await;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let record_id = record.id().clone();
            let span = tracing::info_span!("record", record_id = %record_id);
            let ctx = ctx.clone();
            ctx.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            join_set.spawn(
                async move {
                    let _permit = permit;
                    let in_flight = ctx.counters.clone();
                    let _guard = scopeguard::guard((), move |_| {
                        in_flight.in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    tracing::info!(state = %record.status(), "Processing record");
                    let outcome = ctx.drive(record).await;
                    (record_id, outcome)
                }
                .instrument(span),
            );
        }
        drop(records);

        while let Some(joined) = join_set.join_next().await {
            self.handle_joined(joined, &ctx, &mut summary, &mut fatal);
        }

        summary.pending = self
            .storage
            .list_pending()
            .filter(|item| futures::future::ready(item.is_ok()))
            .count()
            .await as u64;

        if let Some(e) = fatal {
            tracing::error!(
                error = %e,
                sent = summary.sent,
                failed = summary.failed.len(),
                pending = summary.pending,
                "Batch aborted"
            );
            return Err(e);
        }
        Ok(summary)
    }

    fn handle_joined(
        &self,
        joined: std::result::Result<(RecordId, Result<RecordOutcome>), tokio::task::JoinError>,
        ctx: &BatchContext<S, C, M>,
        summary: &mut RunSummary,
        fatal: &mut Option<TexpostError>,
    ) {
        match joined {
            Ok((_, Ok(RecordOutcome::Sent))) => {
                summary.sent += 1;
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                counter!("texpost_records_total", "status" => "sent").increment(1);
            }
            Ok((_, Ok(RecordOutcome::Failed(failed)))) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                summary.failed.push(failed);
            }
            Ok((record_id, Ok(RecordOutcome::Archived))) => {
                tracing::debug!(record_id = %record_id, "Archived record sent by an earlier run");
            }
            Ok((_, Ok(RecordOutcome::Interrupted | RecordOutcome::Skipped))) => {}
            Ok((record_id, Err(e))) if e.is_batch_fatal() => {
                tracing::error!(
                    record_id = %record_id,
                    error = %e,
                    "Batch-level failure, stopping dispatch"
                );
                ctx.stop.cancel();
                fatal.get_or_insert(e);
            }
            Ok((record_id, Err(e))) => {
                tracing::error!(
                    record_id = %record_id,
                    error = %e,
                    "Record processing error, state kept for next run"
                );
            }
            Err(join_error) => {
                tracing::error!(error = %join_error, "Record task panicked");
            }
        }
    }

    async fn quarantine(&self, error: TexpostError, summary: &mut RunSummary) {
        let TexpostError::InvalidRecord { path, .. } = &error else {
            return;
        };
        let id = path
            .file_stem()
            .map(|s| RecordId::sanitized(&s.to_string_lossy()))
            .unwrap_or_else(|| RecordId::sanitized(""));
        match self.storage.quarantine(path, &error).await {
            Ok(()) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                counter!("texpost_records_total", "status" => "failed").increment(1);
                summary.failed.push(FailedRecord {
                    id: id.to_string(),
                    diagnostic: error.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(
                    input = %path.display(),
                    error = %e,
                    "Failed to quarantine invalid input"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{MockCompileResponse, MockCompiler};
    use crate::config::PathsConfig;
    use crate::domain::record::RetryDecision;
    use crate::mailer::MockMailer;
    use crate::store::FsRecordStore;

    #[test]
    fn test_retry_policy_uses_daemon_backoff() {
        let config = DaemonConfig {
            backoff_ms: 100,
            backoff_factor: 3,
            max_backoff_ms: 500,
            ..Default::default()
        };
        let policy = config.retry_policy(4);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(
            policy.decide(2),
            RetryDecision::Retry {
                backoff: Duration::from_millis(300)
            }
        );
        assert_eq!(
            policy.decide(3),
            RetryDecision::Retry {
                backoff: Duration::from_millis(500)
            }
        );
        assert_eq!(policy.decide(4), RetryDecision::Exhausted);
    }

    #[test]
    fn test_summary_lists_failures() {
        let summary = RunSummary {
            batches: 1,
            sent: 2,
            failed: vec![FailedRecord {
                id: "r3".into(),
                diagnostic: "Missing substitution for placeholder(s): name".into(),
            }],
            pending: 1,
        };
        let text = summary.to_string();
        assert!(text.starts_with("sent: 2, failed: 1, pending: 1"));
        assert!(text.contains("r3: Missing substitution for placeholder(s): name"));
    }

    #[test_log::test(tokio::test)]
    async fn test_toolchain_missing_stops_batch_and_keeps_record_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            paths: PathsConfig::rooted(dir.path()),
            daemon: DaemonConfig {
                status_log_interval_ms: None,
                ..Default::default()
            },
            ..Default::default()
        };
        let storage = Arc::new(FsRecordStore::open(&config.paths).await.unwrap());
        tokio::fs::create_dir_all(dir.path().join("templates")).await.unwrap();
        tokio::fs::write(dir.path().join("templates/template.tex"), "Hi {{name}}")
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("data/r1.json"),
            r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#,
        )
        .await
        .unwrap();

        let compiler = MockCompiler::new();
        compiler.set_fallback(MockCompileResponse::ToolchainMissing);
        let mailer = MockMailer::new();
        let daemon = Daemon::new(
            storage.clone(),
            Arc::new(compiler.clone()),
            Arc::new(mailer.clone()),
            config,
            CancellationToken::new(),
        );

        let result = daemon.run(false).await;

        assert!(matches!(
            result,
            Err(TexpostError::ToolchainUnavailable { .. })
        ));
        assert_eq!(compiler.call_count(), 1);
        assert_eq!(mailer.call_count(), 0);
        let ledger = storage.get_record(&RecordId::from("r1")).await.unwrap();
        assert!(matches!(ledger, Some(AnyRecord::Rendered(_))));
    }
}
