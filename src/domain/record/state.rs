//! Core record types.
//!
//! This module defines the type-safe record lifecycle using the typestate pattern.
//! Each record progresses through distinct states, enforced at compile time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compiler::Artifact;
use crate::mailer::DeliveryReceipt;

/// Persisted state name, used for listing and filtering records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Rendered,
    Compiled,
    Sent,
    Archived,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Rendered => "rendered",
            RecordStatus::Compiled => "compiled",
            RecordStatus::Sent => "sent",
            RecordStatus::Archived => "archived",
            RecordStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "rendered" => Ok(RecordStatus::Rendered),
            "compiled" => Ok(RecordStatus::Compiled),
            "sent" => Ok(RecordStatus::Sent),
            "archived" => Ok(RecordStatus::Archived),
            "failed" => Ok(RecordStatus::Failed),
            _ => Err(format!("Invalid record status: {}", s)),
        }
    }
}

/// Marker trait for valid record states.
pub trait RecordState: Send + Sync {}

/// One recipient's document moving through the pipeline.
///
/// The generic parameter `T` is the current state; transitions consume the
/// record and return it in the next state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record<T: RecordState> {
    /// The current state of the record.
    pub state: T,
    /// The input data, fixed once the record is discovered.
    pub data: RecordData,
}

/// Input data for a record, as read from the data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    pub id: RecordId,

    /// Envelope recipients. Never empty.
    pub recipients: Vec<String>,

    /// Mail subject override; may contain placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Plain-text mail body override; may contain placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Optional HTML alternative for the mail body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,

    /// Template file name under the templates directory. `None` uses the
    /// configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Placeholder values.
    pub values: BTreeMap<String, SubstitutionValue>,

    /// Input file in the data directory this record was read from.
    pub source_file: PathBuf,
}

/// A value substituted into a template placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubstitutionValue {
    /// Written verbatim.
    Number(serde_json::Number),
    /// Escaped for the document markup before insertion.
    Text(String),
    /// Inserted unmodified; the producer is responsible for escaping.
    Markup { markup: String },
}

impl From<&str> for SubstitutionValue {
    fn from(s: &str) -> Self {
        SubstitutionValue::Text(s.to_string())
    }
}

impl From<String> for SubstitutionValue {
    fn from(s: String) -> Self {
        SubstitutionValue::Text(s)
    }
}

/// Attempt counters carried through every state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempts {
    /// Failed compilation attempts so far.
    pub compile: u32,
    /// Failed delivery attempts so far.
    pub delivery: u32,
}

/// Subject and bodies of the outgoing mail, fixed at render time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailContent {
    pub subject: String,
    pub body_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
}

/// Pipeline stage at which a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Render,
    Compile,
    Deliver,
}

// ============================================================================
// Record States
// ============================================================================

/// Record is waiting to be rendered.
///
/// Initial state for newly discovered records, and the state a record
/// returns to when a compilation attempt fails with attempts remaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pending {
    pub attempts: Attempts,
    pub discovered_at: DateTime<Utc>,
    /// Earliest time the record may be rendered again (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    /// Diagnostic from the previous failed attempt, if any.
    pub last_error: Option<String>,
}

impl RecordState for Pending {}

/// Template has been filled and written to the record's working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rendered {
    pub attempts: Attempts,
    pub discovered_at: DateTime<Utc>,
    pub rendered_at: DateTime<Utc>,
    /// Rendered source file.
    pub source: PathBuf,
    pub mail: MailContent,
    /// Artifact kept from an earlier compilation when delivery is retried.
    pub artifact: Option<Artifact>,
    /// Earliest time the next stage may run (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    /// Diagnostic from the previous failed delivery attempt, if any.
    pub last_error: Option<String>,
}

impl RecordState for Rendered {}

/// Rendered source compiled into an artifact, ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compiled {
    pub attempts: Attempts,
    pub discovered_at: DateTime<Utc>,
    pub rendered_at: DateTime<Utc>,
    pub compiled_at: DateTime<Utc>,
    pub source: PathBuf,
    pub mail: MailContent,
    pub artifact: Artifact,
}

impl RecordState for Compiled {}

/// Mail transport accepted the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sent {
    pub attempts: Attempts,
    pub discovered_at: DateTime<Utc>,
    pub compiled_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub artifact: Artifact,
    pub receipt: DeliveryReceipt,
}

impl RecordState for Sent {}

/// Record and all its files were moved to the archive area (terminal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archived {
    pub attempts: Attempts,
    pub sent_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    /// Directory holding the archived files.
    pub location: PathBuf,
    pub receipt: DeliveryReceipt,
}

impl RecordState for Archived {}

/// Reason why a record failed permanently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// The input file could not be turned into a record.
    InvalidRecord { error: String },

    /// Template placeholders without a value. Retrying cannot help.
    MissingSubstitution { keys: Vec<String> },

    /// Compilation kept failing until the attempt limit was reached.
    CompilationFailed { attempts: u32, diagnostics: String },

    /// Mail transport rejected the message permanently.
    DeliveryRejected { error: String },

    /// Transient delivery failures until the attempt limit was reached.
    DeliveryRetriesExhausted { attempts: u32, error: String },
}

impl FailureReason {
    /// Returns a human-readable diagnostic for this failure reason.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::InvalidRecord { error } => format!("Invalid record: {}", error),
            FailureReason::MissingSubstitution { keys } => {
                format!("Missing substitution for placeholder(s): {}", keys.join(", "))
            }
            FailureReason::CompilationFailed {
                attempts,
                diagnostics,
            } => format!(
                "Compilation failed after {} attempt(s): {}",
                attempts, diagnostics
            ),
            FailureReason::DeliveryRejected { error } => {
                format!("Delivery rejected: {}", error)
            }
            FailureReason::DeliveryRetriesExhausted { attempts, error } => format!(
                "Delivery failed after {} attempt(s): {}",
                attempts, error
            ),
        }
    }
}

/// Record failed permanently (terminal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failed {
    pub reason: FailureReason,
    pub stage: Stage,
    pub failed_at: DateTime<Utc>,
    pub attempts: Attempts,
}

impl RecordState for Failed {}

/// Identifier of a record, unique within the data directory.
///
/// Derived from the input file name (or an explicit `id` field) and
/// restricted to characters that are safe in file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    const MAX_LEN: usize = 64;

    /// Build an identifier, replacing runs of unsafe characters with `_`.
    pub fn sanitized(raw: &str) -> Self {
        let mut id = String::with_capacity(raw.len());
        let mut last_was_replacement = false;
        for c in raw.trim().chars() {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                id.push(c);
                last_was_replacement = false;
            } else if !last_was_replacement {
                id.push('_');
                last_was_replacement = true;
            }
        }
        let mut id: String = id.chars().take(Self::MAX_LEN).collect();
        if id.is_empty() {
            id.push_str("record");
        }
        RecordId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::sanitized(s)
    }
}

impl std::ops::Deref for RecordId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Unified Record Representation
// ============================================================================

/// Enum that can hold a record in any state.
///
/// This is the persisted form of a record: the state ledger stores exactly
/// one `AnyRecord` per record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", content = "record", rename_all = "lowercase")]
pub enum AnyRecord {
    Pending(Record<Pending>),
    Rendered(Record<Rendered>),
    Compiled(Record<Compiled>),
    Sent(Record<Sent>),
    Archived(Record<Archived>),
    Failed(Record<Failed>),
}

impl AnyRecord {
    /// Get the record ID regardless of state.
    pub fn id(&self) -> &RecordId {
        &self.data().id
    }

    /// Get the record data regardless of state.
    pub fn data(&self) -> &RecordData {
        match self {
            AnyRecord::Pending(r) => &r.data,
            AnyRecord::Rendered(r) => &r.data,
            AnyRecord::Compiled(r) => &r.data,
            AnyRecord::Sent(r) => &r.data,
            AnyRecord::Archived(r) => &r.data,
            AnyRecord::Failed(r) => &r.data,
        }
    }

    /// Get the attempt counters regardless of state.
    pub fn attempts(&self) -> Attempts {
        match self {
            AnyRecord::Pending(r) => r.state.attempts,
            AnyRecord::Rendered(r) => r.state.attempts,
            AnyRecord::Compiled(r) => r.state.attempts,
            AnyRecord::Sent(r) => r.state.attempts,
            AnyRecord::Archived(r) => r.state.attempts,
            AnyRecord::Failed(r) => r.state.attempts,
        }
    }

    pub fn status(&self) -> RecordStatus {
        match self {
            AnyRecord::Pending(_) => RecordStatus::Pending,
            AnyRecord::Rendered(_) => RecordStatus::Rendered,
            AnyRecord::Compiled(_) => RecordStatus::Compiled,
            AnyRecord::Sent(_) => RecordStatus::Sent,
            AnyRecord::Archived(_) => RecordStatus::Archived,
            AnyRecord::Failed(_) => RecordStatus::Failed,
        }
    }

    /// Diagnostic text currently attached to the record, if any.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            AnyRecord::Pending(r) => r.state.last_error.clone(),
            AnyRecord::Rendered(r) => r.state.last_error.clone(),
            AnyRecord::Failed(r) => Some(r.state.reason.to_error_message()),
            AnyRecord::Compiled(_) | AnyRecord::Sent(_) | AnyRecord::Archived(_) => None,
        }
    }

    /// Check if this record is in a terminal state (Archived or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyRecord::Archived(_) | AnyRecord::Failed(_))
    }
}

// Conversion traits for going from typed Record to AnyRecord

impl From<Record<Pending>> for AnyRecord {
    fn from(r: Record<Pending>) -> Self {
        AnyRecord::Pending(r)
    }
}

impl From<Record<Rendered>> for AnyRecord {
    fn from(r: Record<Rendered>) -> Self {
        AnyRecord::Rendered(r)
    }
}

impl From<Record<Compiled>> for AnyRecord {
    fn from(r: Record<Compiled>) -> Self {
        AnyRecord::Compiled(r)
    }
}

impl From<Record<Sent>> for AnyRecord {
    fn from(r: Record<Sent>) -> Self {
        AnyRecord::Sent(r)
    }
}

impl From<Record<Archived>> for AnyRecord {
    fn from(r: Record<Archived>) -> Self {
        AnyRecord::Archived(r)
    }
}

impl From<Record<Failed>> for AnyRecord {
    fn from(r: Record<Failed>) -> Self {
        AnyRecord::Failed(r)
    }
}
