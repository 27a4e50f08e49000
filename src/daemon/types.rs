//! Run record types using the typestate pattern.
//!
//! Every daemon invocation registers one run record. It progresses through
//! distinct states, enforced at compile time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one daemon run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker trait for valid run states.
pub trait RunState: Send + Sync {}

/// One daemon run.
///
/// The generic parameter `T` represents the current state of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord<T: RunState> {
    pub state: T,
    pub data: RunData,
}

/// Immutable run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    pub id: RunId,
    pub hostname: String,
    pub pid: u32,
    pub version: String,
    /// Whether the run keeps polling for new records.
    pub watch: bool,
    /// Configuration at startup, secrets redacted.
    pub config_snapshot: serde_json::Value,
}

// ============================================================================
// Run States
// ============================================================================

/// Registered but not yet processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initializing {
    pub started_at: DateTime<Utc>,
}

impl RunState for Initializing {}

/// Processing records; refreshed by the heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Running {
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub stats: RunStats,
}

impl RunState for Running {}

/// Run has ended (terminal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finished {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_stats: RunStats,
    /// Batch-level error that ended the run, if any.
    pub error: Option<String>,
}

impl RunState for Finished {}

/// Counters tracked for each run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub batches: u64,
    pub records_sent: u64,
    pub records_failed: u64,
    /// Stage attempts that were retried.
    pub retries: u64,
    pub records_in_flight: usize,
}

// ============================================================================
// Unified Run Representation
// ============================================================================

/// Enum that can hold a run record in any state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "run", rename_all = "snake_case")]
pub enum AnyRunRecord {
    Initializing(RunRecord<Initializing>),
    Running(RunRecord<Running>),
    Finished(RunRecord<Finished>),
}

impl AnyRunRecord {
    pub fn id(&self) -> RunId {
        match self {
            AnyRunRecord::Initializing(r) => r.data.id,
            AnyRunRecord::Running(r) => r.data.id,
            AnyRunRecord::Finished(r) => r.data.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyRunRecord::Finished(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            AnyRunRecord::Initializing(_) => "initializing",
            AnyRunRecord::Running(_) => "running",
            AnyRunRecord::Finished(_) => "finished",
        }
    }
}

impl From<RunRecord<Initializing>> for AnyRunRecord {
    fn from(r: RunRecord<Initializing>) -> Self {
        AnyRunRecord::Initializing(r)
    }
}

impl From<RunRecord<Running>> for AnyRunRecord {
    fn from(r: RunRecord<Running>) -> Self {
        AnyRunRecord::Running(r)
    }
}

impl From<RunRecord<Finished>> for AnyRunRecord {
    fn from(r: RunRecord<Finished>) -> Self {
        AnyRunRecord::Finished(r)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Get the current hostname.
pub fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Get a version string (git hash if baked in at build time, else the crate version).
pub fn get_version() -> String {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .unwrap_or("dev")
        .to_string()
}
