//! Document compilation abstraction.
//!
//! This module defines the `Compiler` trait so the daemon can drive the
//! external LaTeX toolchain in production and a deterministic mock in tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CompilerConfig;
use crate::domain::record::RecordId;
use crate::error::{Result, TexpostError};

/// Upper bound on diagnostic text kept from a failed compilation.
pub const MAX_DIAGNOSTIC_CHARS: usize = 2000;

/// A compiled document owned by one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl Artifact {
    /// Check that the file still exists and is non-empty.
    pub async fn is_present(&self) -> bool {
        matches!(tokio::fs::metadata(&self.path).await, Ok(meta) if meta.len() > 0)
    }
}

/// One compilation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub record_id: RecordId,
    /// Rendered source file, inside `work_dir`.
    pub source: PathBuf,
    /// Private working directory of the record. Output lands here.
    pub work_dir: PathBuf,
}

impl CompileJob {
    /// Path the toolchain writes the PDF to.
    pub fn output_path(&self) -> PathBuf {
        let stem = self
            .source
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| self.record_id.as_str().into());
        self.work_dir.join(stem).with_extension("pdf")
    }

    /// The same job with both paths made absolute against the current
    /// directory. The toolchain runs inside `work_dir`, so relative paths
    /// would be resolved twice.
    pub fn absolute(&self) -> std::io::Result<CompileJob> {
        Ok(CompileJob {
            record_id: self.record_id.clone(),
            source: std::path::absolute(&self.source)?,
            work_dir: std::path::absolute(&self.work_dir)?,
        })
    }
}

/// Trait for turning rendered source into an artifact.
///
/// Implementations must only write inside `job.work_dir`.
///
/// # Errors
/// - `Compilation` when the toolchain ran but produced no usable artifact.
///   Retryable up to the configured limit.
/// - `ToolchainUnavailable` when the toolchain cannot be started at all.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, job: &CompileJob) -> Result<Artifact>;
}

// ============================================================================
// Production Implementation using an external process
// ============================================================================

/// Runs a LaTeX engine (pdflatex by default) as a child process.
#[derive(Debug, Clone)]
pub struct LatexCompiler {
    program: String,
    /// Arguments; `{work_dir}` and `{source}` are replaced per job.
    args: Vec<String>,
    timeout: Duration,
}

impl LatexCompiler {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &CompilerConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn expand_args(&self, job: &CompileJob) -> Vec<String> {
        let work_dir = job.work_dir.to_string_lossy();
        let source = job.source.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{work_dir}", &work_dir)
                    .replace("{source}", &source)
            })
            .collect()
    }
}

#[async_trait]
impl Compiler for LatexCompiler {
    #[tracing::instrument(skip_all, fields(record_id = %job.record_id, program = %self.program))]
    async fn compile(&self, job: &CompileJob) -> Result<Artifact> {
        let job = &job.absolute()?;
        let args = self.expand_args(job);
        tracing::debug!(?args, "Spawning compiler");

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .current_dir(&job.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TexpostError::ToolchainUnavailable {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(TexpostError::Compilation(format!(
                    "failed to wait for {}: {}",
                    self.program, e
                )));
            }
            Err(_) => {
                return Err(TexpostError::Compilation(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(stderr = %stderr.trim(), "Compiler stderr");
        }

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "terminated by signal".to_string());
            return Err(TexpostError::Compilation(truncate_diagnostics(&format!(
                "{} failed with {}\n{}",
                self.program,
                status,
                extract_diagnostics(&stdout, &stderr)
            ))));
        }

        let path = job.output_path();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => Ok(Artifact {
                path,
                size_bytes: meta.len(),
            }),
            _ => Err(TexpostError::Compilation(format!(
                "{} exited successfully but produced no output at {}",
                self.program,
                path.display()
            ))),
        }
    }
}

/// Pull the error lines (`! ...` plus the line reference after them) out of a
/// LaTeX log, or fall back to the tail of the captured output.
fn extract_diagnostics(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().collect();
    let mut picked = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with('!') {
            picked.extend(lines.iter().skip(i).take(3).copied());
        }
    }
    let mut text = if picked.is_empty() {
        let tail_start = lines.len().saturating_sub(20);
        lines[tail_start..].join("\n")
    } else {
        picked.join("\n")
    };
    if !stderr.trim().is_empty() {
        text.push('\n');
        text.push_str(stderr.trim());
    }
    text
}

fn truncate_diagnostics(text: &str) -> String {
    if text.chars().count() <= MAX_DIAGNOSTIC_CHARS {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MAX_DIAGNOSTIC_CHARS).collect();
    truncated.push_str("\n[truncated]");
    truncated
}

/// Check that a program can be found on `PATH` (or exists, if it is a path).
pub fn toolchain_on_path(program: &str) -> bool {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Outcome a [`MockCompiler`] returns for one call.
#[derive(Debug, Clone)]
pub enum MockCompileResponse {
    /// Write these bytes as the PDF and succeed.
    Pdf(Vec<u8>),
    /// Fail with a compilation diagnostic.
    Fail(String),
    /// Behave as if the toolchain binary is missing.
    ToolchainMissing,
}

/// Record of a call made to the mock compiler.
#[derive(Debug, Clone)]
pub struct MockCompileCall {
    pub record_id: RecordId,
    pub source: PathBuf,
    pub work_dir: PathBuf,
    /// Source text as it was on disk when the compiler was called.
    pub source_text: String,
}

/// Mock compiler for testing.
///
/// Responses are queued per record id and returned in FIFO order; when none
/// is queued the fallback response is used.
#[derive(Clone)]
pub struct MockCompiler {
    responses: Arc<Mutex<HashMap<RecordId, VecDeque<MockCompileResponse>>>>,
    fallback: Arc<Mutex<Option<MockCompileResponse>>>,
    calls: Arc<Mutex<Vec<MockCompileCall>>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockCompiler {
    /// Create a mock with no fallback: unqueued calls fail.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            fallback: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a mock that produces a small PDF for every call.
    pub fn succeeding() -> Self {
        let mock = Self::new();
        mock.set_fallback(MockCompileResponse::Pdf(b"%PDF-1.4\n%mock\n".to_vec()));
        mock
    }

    pub fn set_fallback(&self, response: MockCompileResponse) {
        *self.fallback.lock() = Some(response);
    }

    /// Queue a response for a specific record.
    pub fn add_response(&self, record_id: &str, response: MockCompileResponse) {
        self.responses
            .lock()
            .entry(RecordId::from(record_id))
            .or_default()
            .push_back(response);
    }

    pub fn get_calls(&self) -> Vec<MockCompileCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Compiler for MockCompiler {
    async fn compile(&self, job: &CompileJob) -> Result<Artifact> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let source_text = tokio::fs::read_to_string(&job.source)
            .await
            .unwrap_or_default();
        self.calls.lock().push(MockCompileCall {
            record_id: job.record_id.clone(),
            source: job.source.clone(),
            work_dir: job.work_dir.clone(),
            source_text,
        });

        let response = self
            .responses
            .lock()
            .get_mut(&job.record_id)
            .and_then(|queue| queue.pop_front())
            .or_else(|| self.fallback.lock().clone());

        match response {
            Some(MockCompileResponse::Pdf(bytes)) => {
                let path = job.output_path();
                tokio::fs::create_dir_all(&job.work_dir).await?;
                tokio::fs::write(&path, &bytes).await?;
                Ok(Artifact {
                    path,
                    size_bytes: bytes.len() as u64,
                })
            }
            Some(MockCompileResponse::Fail(diagnostics)) => {
                Err(TexpostError::Compilation(diagnostics))
            }
            Some(MockCompileResponse::ToolchainMissing) => {
                Err(TexpostError::ToolchainUnavailable {
                    program: "mock".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                })
            }
            None => Err(TexpostError::Other(anyhow::anyhow!(
                "No mock response configured for record {}",
                job.record_id
            ))),
        }
    }
}
