//! Error types for the document pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the texpost error type.
pub type Result<T> = std::result::Result<T, TexpostError>;

/// Main error type for the document pipeline.
#[derive(Error, Debug)]
pub enum TexpostError {
    /// The data directory (or one of its siblings) cannot be read or written.
    /// Fatal for the whole batch.
    #[error("Record store unavailable at {path}: {source}")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A template placeholder has no matching value in the record.
    #[error("Missing substitution for placeholder(s): {0}")]
    MissingSubstitution(String),

    /// The template file is missing or structurally unusable.
    #[error("Template '{name}' is invalid: {reason}")]
    TemplateInvalid { name: String, reason: String },

    /// An input file in the data directory could not be turned into a record.
    #[error("Invalid record {path}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },

    /// The compilation toolchain ran but did not produce an artifact.
    #[error("Compilation failed: {0}")]
    Compilation(String),

    /// The compilation toolchain binary could not be started at all.
    #[error("Compilation toolchain '{program}' unavailable: {source}")]
    ToolchainUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Mail transport failure.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error outside of the store's availability checks
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TexpostError {
    /// Returns true if this error must abort the whole batch rather than a
    /// single record.
    pub fn is_batch_fatal(&self) -> bool {
        match self {
            TexpostError::StoreUnavailable { .. }
            | TexpostError::TemplateInvalid { .. }
            | TexpostError::ToolchainUnavailable { .. }
            | TexpostError::Config(_) => true,
            TexpostError::Delivery(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Failure reported by the mail transport.
///
/// The variant decides what the orchestrator does with the record:
/// transient variants are retried, `Rejected` fails the record, and
/// `Authentication` stops the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The server refused our credentials.
    #[error("SMTP authentication failed: {0}")]
    Authentication(String),

    /// Could not reach the server, or the connection dropped mid-session.
    #[error("SMTP connection failed: {0}")]
    Connection(String),

    /// The server did not answer within the configured timeout.
    #[error("SMTP timed out: {0}")]
    Timeout(String),

    /// The server answered with a transient (4xx) reply.
    #[error("SMTP transient failure: {0}")]
    Transient(String),

    /// Invalid address or a permanent (5xx) reply.
    #[error("SMTP rejected message: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Returns true if retrying the same message may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Connection(_) | DeliveryError::Timeout(_) | DeliveryError::Transient(_)
        )
    }

    /// Returns true if the failure is not specific to one record and no
    /// further record can be delivered until it is fixed externally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeliveryError::Authentication(_))
    }
}

/// Helper functions for serializing and deserializing errors to/from JSON.
///
/// Record diagnostics are persisted as text in the state ledger; these keep the
/// source chain of an `anyhow` error intact across restarts.
pub mod error_serialization {
    use anyhow::Error;
    use serde::{Deserialize, Serialize};

    /// Serialized error format that preserves error message and source chain.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SerializedError {
        /// The main error message
        pub message: String,
        /// Chain of source errors, if any
        pub sources: Vec<String>,
    }

    /// Serializes an anyhow::Error to a JSON string.
    pub fn serialize_error(error: &Error) -> String {
        encode(SerializedError {
            message: error.to_string(),
            sources: error.chain().skip(1).map(|e| e.to_string()).collect(),
        })
    }

    /// Serializes any error and its `source()` chain to a JSON string.
    pub fn serialize_chain(error: &(dyn std::error::Error + 'static)) -> String {
        let mut sources = Vec::new();
        let mut current = error.source();
        while let Some(source) = current {
            sources.push(source.to_string());
            current = source.source();
        }
        encode(SerializedError {
            message: error.to_string(),
            sources,
        })
    }

    fn encode(serialized: SerializedError) -> String {
        serde_json::to_string(&serialized).unwrap_or_else(|_| {
            format!(
                r#"{{"message":"{}","sources":[]}}"#,
                serialized.message.replace('"', "\\\"")
            )
        })
    }

    /// Renders a serialized error as human-readable diagnostic text.
    ///
    /// Falls back to the raw string if it is not a serialized error.
    pub fn to_diagnostic(json: &str) -> String {
        match serde_json::from_str::<SerializedError>(json) {
            Ok(serialized) => {
                let mut text = serialized.message;
                if !serialized.sources.is_empty() {
                    text.push_str("\nCaused by:\n");
                    for (i, source) in serialized.sources.iter().enumerate() {
                        text.push_str(&format!("  {}: {}\n", i + 1, source));
                    }
                }
                text
            }
            Err(_) => json.to_string(),
        }
    }

}
