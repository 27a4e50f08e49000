//! Document mail daemon.
//!
//! Each input file in the data directory describes one record: recipients,
//! mail texts and the values for a document template. The daemon renders the
//! template, compiles it to PDF with an external toolchain, mails the PDF as
//! an attachment and archives the result. Every stage transition is persisted
//! so an interrupted run resumes where it stopped, and failed stages are
//! retried with exponential backoff.

pub mod compiler;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod logging;
pub mod mailer;
pub mod signal;
pub mod store;
pub mod template;

// Re-export commonly used types
pub use compiler::{Artifact, CompileJob, Compiler, LatexCompiler, MockCompiler};
pub use config::{Config, ConfigOverrides};
pub use daemon::{Daemon, DaemonConfig, RunSummary};
pub use domain::record::*;
pub use error::{DeliveryError, Result, TexpostError};
pub use mailer::{DeliveryReceipt, Mailer, MockMailer, OutgoingMail, SmtpMailer};
pub use store::{FsRecordStore, RecordStorage, RunStorage};
pub use template::Template;
