//! State transitions for records using the typestate pattern.
//!
//! Each transition consumes a `Record<State>`, performs at most one external
//! step, persists the resulting state and returns it. The persisted state is
//! always written before the caller can start the next stage, so a crash
//! between stages resumes exactly where the ledger says.
//!
//! ```text
//! Record<Pending> ──render()──> Record<Rendered> ──compile()──> Record<Compiled>
//!       │                          │     ▲                            │
//!       │                          │     └──── deliver() retry ───────┤
//!       │                          └── compile() retry ──> Record<Pending>
//!       │                                                             │
//!       └── render() missing key ──> Record<Failed> <── limits ───────┤
//!                                                                     │
//!                         Record<Archived> <──archive()── Record<Sent> <┘
//! ```
//!
//! # Retry Configuration
//!
//! Backoff and attempt limits are configured per stage via [`RetryPolicy`]:
//!
//! ```rust
//! # use texpost::domain::record::RetryPolicy;
//! let policy = RetryPolicy {
//!     max_attempts: 3,       // third failure is final
//!     backoff_ms: 1000,      // start with 1 second
//!     backoff_factor: 2,     // double each time (1s, 2s, 4s)
//!     max_backoff_ms: 60000, // cap at 60 seconds
//! };
//! assert!(policy.decide(1).is_retry());
//! assert!(!policy.decide(3).is_retry());
//! ```

use std::time::Duration;

use metrics::counter;

use crate::compiler::{CompileJob, Compiler};
use crate::error::{Result, TexpostError};
use crate::mailer::{Mailer, OutgoingMail};
use crate::store::RecordStorage;
use crate::template::{self, Template};

use super::state::{
    Archived, Attempts, Compiled, FailureReason, Failed, MailContent, Pending, Record,
    RecordData, Rendered, Sent, Stage,
};

/// Attempt limit and backoff for one retryable stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed; the failure that reaches this count is final.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry { backoff: Duration },
    /// The attempt limit has been reached.
    Exhausted,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

impl RetryPolicy {
    /// Decide whether to retry, given the number of failed attempts so far
    /// (including the one that just failed).
    ///
    /// Backoff is `backoff_ms * backoff_factor ^ (failed_attempts - 1)`,
    /// capped at `max_backoff_ms`.
    pub fn decide(&self, failed_attempts: u32) -> RetryDecision {
        if failed_attempts >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let exponent = failed_attempts.saturating_sub(1);
        let backoff_ms = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(exponent))
            .min(self.max_backoff_ms);
        RetryDecision::Retry {
            backoff: Duration::from_millis(backoff_ms),
        }
    }
}

fn not_before(backoff: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
        + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Defaults applied when a record carries no mail subject or body of its own.
#[derive(Debug, Clone)]
pub struct MailDefaults {
    pub subject: String,
    pub body: String,
}

/// Outcome of rendering a pending record.
#[derive(Debug)]
pub enum RenderOutcome {
    Rendered(Record<Rendered>),
    Failed(Record<Failed>),
}

/// Outcome of compiling a rendered record.
#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(Record<Compiled>),
    /// Compilation failed with attempts remaining; the record goes back to
    /// pending and will be rendered again.
    Retry(Record<Pending>),
    Failed(Record<Failed>),
}

/// Outcome of delivering a compiled record.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Sent(Record<Sent>),
    /// Transient delivery failure with attempts remaining; the record goes
    /// back to rendered and keeps its artifact.
    Retry(Record<Rendered>),
    Failed(Record<Failed>),
}

impl Record<Pending> {
    /// Create a freshly discovered record.
    pub fn new(data: RecordData) -> Self {
        Record {
            data,
            state: Pending {
                attempts: Attempts::default(),
                discovered_at: chrono::Utc::now(),
                not_before: None,
                last_error: None,
            },
        }
    }

    /// Fill the template and the mail texts, write the source to the
    /// record's working directory and persist `rendered`.
    ///
    /// A missing substitution is permanent: the record is failed without
    /// touching the compiler or the mailer.
    #[tracing::instrument(skip_all, fields(record_id = %self.data.id))]
    pub async fn render<S: RecordStorage + ?Sized>(
        self,
        template: &Template,
        defaults: &MailDefaults,
        storage: &S,
    ) -> Result<RenderOutcome> {
        let mut missing = template.missing_keys(&self.data.values);
        for text in mail_texts(&self.data, defaults) {
            for key in template::missing_keys_in(text, &self.data.values) {
                if !missing.contains(&key) {
                    missing.push(key);
                }
            }
        }
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "Record is missing substitutions");
            let failed = self
                .fail(FailureReason::MissingSubstitution { keys: missing }, storage)
                .await?;
            return Ok(RenderOutcome::Failed(failed));
        }

        let source = template::render(template, &self.data.values)?;
        let mail = render_mail(&self.data, defaults)?;

        let source_path = storage.write_source(&self.data.id, &source.text).await?;

        let record = Record {
            data: self.data,
            state: Rendered {
                attempts: self.state.attempts,
                discovered_at: self.state.discovered_at,
                rendered_at: chrono::Utc::now(),
                source: source_path,
                mail,
                artifact: None,
                not_before: None,
                last_error: self.state.last_error,
            },
        };
        storage.persist(&record).await?;
        tracing::debug!("Record rendered");
        Ok(RenderOutcome::Rendered(record))
    }

    pub async fn fail<S: RecordStorage + ?Sized>(
        self,
        reason: FailureReason,
        storage: &S,
    ) -> Result<Record<Failed>> {
        let stage = match reason {
            FailureReason::InvalidRecord { .. } => Stage::Intake,
            _ => Stage::Render,
        };
        fail_record(self.data, reason, stage, self.state.attempts, storage).await
    }
}

fn mail_texts<'a>(data: &'a RecordData, defaults: &'a MailDefaults) -> Vec<&'a str> {
    let mut texts = vec![
        data.subject.as_deref().unwrap_or(&defaults.subject),
        data.body.as_deref().unwrap_or(&defaults.body),
    ];
    texts.extend(data.body_html.as_deref());
    texts
}

fn render_mail(data: &RecordData, defaults: &MailDefaults) -> Result<MailContent> {
    let subject = template::render_plain(
        data.subject.as_deref().unwrap_or(&defaults.subject),
        &data.values,
    )?;
    let body_text = template::render_plain(
        data.body.as_deref().unwrap_or(&defaults.body),
        &data.values,
    )?;
    let body_html = data
        .body_html
        .as_deref()
        .map(|html| template::render_plain(html, &data.values))
        .transpose()?;
    Ok(MailContent {
        subject,
        body_text,
        body_html,
    })
}

impl Record<Rendered> {
    /// Compile the rendered source in the record's private working directory.
    ///
    /// A record that already owns an artifact (it came back here after a
    /// transient delivery failure) is promoted without running the compiler.
    #[tracing::instrument(
        skip_all,
        fields(record_id = %self.data.id, attempt = self.state.attempts.compile + 1)
    )]
    pub async fn compile<C, S>(
        self,
        compiler: &C,
        policy: &RetryPolicy,
        storage: &S,
    ) -> Result<CompileOutcome>
    where
        C: Compiler + ?Sized,
        S: RecordStorage + ?Sized,
    {
        if let Some(artifact) = self.state.artifact.clone()
            && artifact.is_present().await
        {
            tracing::debug!(artifact = %artifact.path.display(), "Reusing existing artifact");
            let record = self.into_compiled(artifact);
            storage.persist(&record).await?;
            return Ok(CompileOutcome::Compiled(record));
        }

        let job = CompileJob {
            record_id: self.data.id.clone(),
            source: self.state.source.clone(),
            work_dir: storage.work_dir(&self.data.id),
        };

        match compiler.compile(&job).await {
            Ok(artifact) => {
                counter!("texpost_compilations_total", "outcome" => "success").increment(1);
                let record = self.into_compiled(artifact);
                storage.persist(&record).await?;
                tracing::debug!("Record compiled");
                Ok(CompileOutcome::Compiled(record))
            }
            Err(TexpostError::Compilation(diagnostics)) => {
                counter!("texpost_compilations_total", "outcome" => "failure").increment(1);
                let mut attempts = self.state.attempts;
                attempts.compile += 1;

                match policy.decide(attempts.compile) {
                    RetryDecision::Retry { backoff } => {
                        tracing::warn!(
                            attempts = attempts.compile,
                            max_attempts = policy.max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            diagnostics = %diagnostics,
                            "Compilation failed, record queued for retry"
                        );
                        let record = Record {
                            data: self.data,
                            state: Pending {
                                attempts,
                                discovered_at: self.state.discovered_at,
                                not_before: Some(not_before(backoff)),
                                last_error: Some(diagnostics),
                            },
                        };
                        storage.persist(&record).await?;
                        Ok(CompileOutcome::Retry(record))
                    }
                    RetryDecision::Exhausted => {
                        counter!(
                            "texpost_retry_denied_total",
                            "stage" => "compile",
                            "reason" => "max_attempts"
                        )
                        .increment(1);
                        tracing::warn!(
                            attempts = attempts.compile,
                            "Compilation failed, no attempts remaining"
                        );
                        let reason = FailureReason::CompilationFailed {
                            attempts: attempts.compile,
                            diagnostics,
                        };
                        let failed =
                            fail_record(self.data, reason, Stage::Compile, attempts, storage)
                                .await?;
                        Ok(CompileOutcome::Failed(failed))
                    }
                }
            }
            // Toolchain missing and the like are not this record's fault.
            Err(e) => Err(e),
        }
    }

    fn into_compiled(self, artifact: crate::compiler::Artifact) -> Record<Compiled> {
        Record {
            data: self.data,
            state: Compiled {
                attempts: self.state.attempts,
                discovered_at: self.state.discovered_at,
                rendered_at: self.state.rendered_at,
                compiled_at: chrono::Utc::now(),
                source: self.state.source,
                mail: self.state.mail,
                artifact,
            },
        }
    }
}

impl Record<Compiled> {
    /// The message this record sends.
    pub fn outgoing_mail(&self) -> OutgoingMail {
        OutgoingMail {
            record_id: self.data.id.clone(),
            to: self.data.recipients.clone(),
            subject: self.state.mail.subject.clone(),
            body_text: self.state.mail.body_text.clone(),
            body_html: self.state.mail.body_html.clone(),
            attachment: self.state.artifact.path.clone(),
        }
    }

    /// Send the artifact and persist `sent` immediately on success.
    ///
    /// An authentication failure is returned as an error and leaves the
    /// record `compiled`: it is not this record's fault and no attempt is
    /// counted.
    #[tracing::instrument(
        skip_all,
        fields(record_id = %self.data.id, attempt = self.state.attempts.delivery + 1)
    )]
    pub async fn deliver<M, S>(
        self,
        mailer: &M,
        policy: &RetryPolicy,
        storage: &S,
    ) -> Result<DeliveryOutcome>
    where
        M: Mailer + ?Sized,
        S: RecordStorage + ?Sized,
    {
        let mail = self.outgoing_mail();
        storage.stage_email(&mail).await?;

        match mailer.send(&mail).await {
            Ok(receipt) => {
                let record = Record {
                    data: self.data,
                    state: Sent {
                        attempts: self.state.attempts,
                        discovered_at: self.state.discovered_at,
                        compiled_at: self.state.compiled_at,
                        sent_at: receipt.accepted_at,
                        artifact: self.state.artifact,
                        receipt,
                    },
                };
                storage.persist(&record).await?;
                counter!("texpost_deliveries_total", "outcome" => "success").increment(1);
                tracing::info!(recipients = ?record.data.recipients, "Record sent");
                Ok(DeliveryOutcome::Sent(record))
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Mail transport refused credentials");
                Err(TexpostError::Delivery(e))
            }
            Err(e) if e.is_retriable() => {
                counter!("texpost_deliveries_total", "outcome" => "transient").increment(1);
                let mut attempts = self.state.attempts;
                attempts.delivery += 1;

                match policy.decide(attempts.delivery) {
                    RetryDecision::Retry { backoff } => {
                        tracing::warn!(
                            attempts = attempts.delivery,
                            max_attempts = policy.max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Delivery failed, record queued for retry"
                        );
                        let record = Record {
                            data: self.data,
                            state: Rendered {
                                attempts,
                                discovered_at: self.state.discovered_at,
                                rendered_at: self.state.rendered_at,
                                source: self.state.source,
                                mail: self.state.mail,
                                artifact: Some(self.state.artifact),
                                not_before: Some(not_before(backoff)),
                                last_error: Some(e.to_string()),
                            },
                        };
                        storage.persist(&record).await?;
                        Ok(DeliveryOutcome::Retry(record))
                    }
                    RetryDecision::Exhausted => {
                        counter!(
                            "texpost_retry_denied_total",
                            "stage" => "deliver",
                            "reason" => "max_attempts"
                        )
                        .increment(1);
                        let reason = FailureReason::DeliveryRetriesExhausted {
                            attempts: attempts.delivery,
                            error: e.to_string(),
                        };
                        let failed =
                            fail_record(self.data, reason, Stage::Deliver, attempts, storage)
                                .await?;
                        Ok(DeliveryOutcome::Failed(failed))
                    }
                }
            }
            Err(e) => {
                counter!("texpost_deliveries_total", "outcome" => "rejected").increment(1);
                tracing::warn!(error = %e, "Delivery rejected permanently");
                let reason = FailureReason::DeliveryRejected {
                    error: e.to_string(),
                };
                let failed = fail_record(
                    self.data,
                    reason,
                    Stage::Deliver,
                    self.state.attempts,
                    storage,
                )
                .await?;
                Ok(DeliveryOutcome::Failed(failed))
            }
        }
    }
}

impl Record<Sent> {
    /// Move the record and its files into the archive area.
    ///
    /// On error nothing is persisted and the record stays `sent`; the
    /// archive is retried on the next run without sending again.
    pub async fn archive<S: RecordStorage + ?Sized>(
        self,
        storage: &S,
    ) -> std::result::Result<Record<Archived>, (Box<Self>, TexpostError)> {
        let location = match storage.archive_location(&self).await {
            Ok(location) => location,
            Err(e) => return Err((Box::new(self), e)),
        };
        let record = Record {
            data: self.data.clone(),
            state: Archived {
                attempts: self.state.attempts,
                sent_at: self.state.sent_at,
                archived_at: chrono::Utc::now(),
                location,
                receipt: self.state.receipt.clone(),
            },
        };
        match storage.archive(&record).await {
            Ok(()) => Ok(record),
            Err(e) => Err((Box::new(self), e)),
        }
    }
}

async fn fail_record<S: RecordStorage + ?Sized>(
    data: RecordData,
    reason: FailureReason,
    stage: Stage,
    attempts: Attempts,
    storage: &S,
) -> Result<Record<Failed>> {
    let record = Record {
        data,
        state: Failed {
            reason,
            stage,
            failed_at: chrono::Utc::now(),
            attempts,
        },
    };
    storage.fail(&record).await?;
    counter!("texpost_records_total", "status" => "failed").increment(1);
    Ok(record)
}
