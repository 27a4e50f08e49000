use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use texpost::compiler::MockCompileResponse;
use texpost::config::PathsConfig;
use texpost::daemon::{AnyRunRecord, DaemonConfig};
use texpost::domain::input::parse_record;
use texpost::{
    AnyRecord, Artifact, CompileJob, CompileOutcome, Compiler, Config, Daemon, DeliveryError,
    DeliveryOutcome, FsRecordStore, MockCompiler, MockMailer, Pending, Record, RecordId,
    RecordStorage, RenderOutcome, RunStorage, TexpostError,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Harness {
    dir: tempfile::TempDir,
    storage: Arc<FsRecordStore>,
    compiler: MockCompiler,
    mailer: MockMailer,
    config: Config,
}

impl Harness {
    async fn new(template: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = Config {
            paths: PathsConfig::rooted(dir.path()),
            daemon: DaemonConfig {
                max_concurrent_records: 2,
                backoff_ms: 1,
                backoff_factor: 2,
                max_backoff_ms: 5,
                heartbeat_interval_ms: 60_000,
                status_log_interval_ms: None, // Disable status logging in tests
                ..Default::default()
            },
            ..Default::default()
        };
        let storage = Arc::new(
            FsRecordStore::open(&config.paths)
                .await
                .expect("Failed to open store"),
        );
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates/template.tex"), template).unwrap();

        Self {
            dir,
            storage,
            compiler: MockCompiler::succeeding(),
            mailer: MockMailer::new(),
            config,
        }
    }

    fn write_input(&self, name: &str, body: &str) {
        std::fs::write(self.dir.path().join("data").join(name), body).unwrap();
    }

    fn path(&self, relative: &str) -> std::path::PathBuf {
        self.dir.path().join(relative)
    }

    fn daemon(&self) -> Daemon<FsRecordStore, MockCompiler, MockMailer> {
        self.daemon_with(CancellationToken::new())
    }

    fn daemon_with(
        &self,
        shutdown: CancellationToken,
    ) -> Daemon<FsRecordStore, MockCompiler, MockMailer> {
        Daemon::new(
            self.storage.clone(),
            Arc::new(self.compiler.clone()),
            Arc::new(self.mailer.clone()),
            self.config.clone(),
            shutdown,
        )
    }

    async fn ledger(&self, id: &str) -> Option<AnyRecord> {
        self.storage.get_record(&RecordId::from(id)).await.unwrap()
    }
}

fn read_state(location: &Path) -> AnyRecord {
    let raw = std::fs::read_to_string(location.join("state.json")).expect("state.json missing");
    serde_json::from_str(&raw).expect("state.json is not a record")
}

const GREETING: &str = "\\documentclass{letter}\\begin{document}Hello {{name}}\\end{document}";

#[test_log::test(tokio::test)]
async fn test_record_is_rendered_compiled_sent_and_archived() {
    let h = Harness::new(GREETING).await;
    h.write_input(
        "r1.json",
        r#"{"id": "r1", "to": "a@example.com", "values": {"name": "Ana"}}"#,
    );

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 1);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.pending, 0);

    let compile_calls = h.compiler.get_calls();
    assert_eq!(compile_calls.len(), 1);
    assert!(compile_calls[0].source_text.contains("Hello Ana"));

    let sends = h.mailer.get_calls();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].mail.to, vec!["a@example.com".to_string()]);
    assert!(sends[0].attachment_bytes.unwrap_or(0) > 0);
    assert_eq!(sends[0].mail.subject, h.config.smtp.subject);

    let location = h.path("archive/r1");
    match read_state(&location) {
        AnyRecord::Archived(r) => {
            assert_eq!(r.state.attempts.compile, 0);
            assert_eq!(r.state.attempts.delivery, 0);
            assert_eq!(r.state.receipt.code, "250");
        }
        other => panic!("Expected archived record, got {}", other.status()),
    }
    assert!(location.join("r1.json").exists());
    assert!(location.join("email.json").exists());
    assert!(!h.path("data/r1.json").exists());
    assert!(h.ledger("r1").await.is_none());
    assert_eq!(h.compiler.in_flight_count(), 0);
    assert_eq!(h.mailer.in_flight_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_missing_value_fails_without_compiling_or_sending() {
    let h = Harness::new("Dear {{name}}, {{missing_field}}").await;
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].id, "r1");
    assert!(summary.failed[0].diagnostic.contains("missing_field"));
    assert_eq!(h.compiler.call_count(), 0);
    assert_eq!(h.mailer.call_count(), 0);

    let location = h.path("failed/r1");
    assert!(matches!(read_state(&location), AnyRecord::Failed(_)));
    let diagnostics = std::fs::read_to_string(location.join("diagnostics.txt")).unwrap();
    assert!(diagnostics.contains("missing_field"));
    assert!(location.join("r1.json").exists());
}

#[test_log::test(tokio::test)]
async fn test_compilation_succeeds_on_last_allowed_attempt() {
    let h = Harness::new(GREETING).await;
    assert_eq!(h.config.compiler.max_attempts, 3);
    h.compiler
        .add_response("r1", MockCompileResponse::Fail("! Undefined control sequence.".into()));
    h.compiler
        .add_response("r1", MockCompileResponse::Fail("! Missing $ inserted.".into()));
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 1);
    assert!(summary.failed.is_empty());
    assert_eq!(h.compiler.call_count(), 3);
    assert_eq!(h.mailer.call_count(), 1);
    match read_state(&h.path("archive/r1")) {
        AnyRecord::Archived(r) => assert_eq!(r.state.attempts.compile, 2),
        other => panic!("Expected archived record, got {}", other.status()),
    }
}

#[test_log::test(tokio::test)]
async fn test_compilation_fails_at_limit_with_last_diagnostic() {
    let h = Harness::new(GREETING).await;
    for diagnostic in ["! first", "! second", "! third"] {
        h.compiler
            .add_response("r1", MockCompileResponse::Fail(diagnostic.into()));
    }
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].diagnostic.contains("! third"));
    assert!(!summary.failed[0].diagnostic.contains("! second"));
    assert_eq!(h.compiler.call_count(), 3);
    assert_eq!(h.mailer.call_count(), 0);

    let diagnostics = std::fs::read_to_string(h.path("failed/r1/diagnostics.txt")).unwrap();
    assert!(diagnostics.contains("! third"));
}

#[test_log::test(tokio::test)]
async fn test_authentication_failure_aborts_and_resumes_from_compiled() {
    let h = Harness::new(GREETING).await;
    h.mailer.add_response(
        "r1",
        Err(DeliveryError::Authentication("535 5.7.8 bad credentials".into())),
    );
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let result = h.daemon().run(false).await;
    assert!(matches!(
        result,
        Err(TexpostError::Delivery(DeliveryError::Authentication(_)))
    ));
    assert!(matches!(h.ledger("r1").await, Some(AnyRecord::Compiled(_))));
    assert!(h.path("data/r1.json").exists());

    let runs = h.storage.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    match &runs[0] {
        AnyRunRecord::Finished(run) => {
            assert!(run.state.error.as_deref().unwrap_or("").contains("authentication"));
        }
        other => panic!("Expected finished run, got {}", other.status()),
    }

    // Credentials fixed: the next run sends without rendering or compiling again.
    let summary = h.daemon().run(false).await.expect("second run failed");
    assert_eq!(summary.sent, 1);
    assert_eq!(h.compiler.call_count(), 1);
    assert_eq!(h.mailer.call_count(), 2);
    assert!(h.path("archive/r1/state.json").exists());
}

#[test_log::test(tokio::test)]
async fn test_sent_record_is_archived_without_second_send() {
    let h = Harness::new(GREETING).await;
    let input = h.path("data/r1.json");
    let raw = r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#;
    std::fs::write(&input, raw).unwrap();

    // Drive the record to `sent` by hand, as an interrupted run would leave it.
    let storage = h.storage.as_ref();
    let template = storage.load_template("template.tex", &[]).await.unwrap();
    let pending = Record::<Pending>::new(parse_record(&input, raw).unwrap());
    let rendered = match pending
        .render(&template, &h.config.mail_defaults(), storage)
        .await
        .unwrap()
    {
        RenderOutcome::Rendered(r) => r,
        RenderOutcome::Failed(f) => panic!("render failed: {:?}", f.state.reason),
    };
    let compiled = match rendered
        .compile(&h.compiler, &h.config.compile_policy(), storage)
        .await
        .unwrap()
    {
        CompileOutcome::Compiled(r) => r,
        _ => panic!("Expected compiled record"),
    };
    match compiled
        .deliver(&h.mailer, &h.config.delivery_policy(), storage)
        .await
        .unwrap()
    {
        DeliveryOutcome::Sent(_) => {}
        _ => panic!("Expected sent record"),
    }
    assert!(matches!(h.ledger("r1").await, Some(AnyRecord::Sent(_))));

    let summary = h.daemon().run(false).await.expect("run failed");

    // The send happened before this run, so it is not counted again.
    assert_eq!(summary.sent, 0);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.pending, 0);
    assert_eq!(h.compiler.call_count(), 1);
    assert_eq!(h.mailer.call_count(), 1);
    assert!(matches!(
        read_state(&h.path("archive/r1")),
        AnyRecord::Archived(_)
    ));
    match &h.storage.list_runs().await.unwrap()[0] {
        AnyRunRecord::Finished(run) => assert_eq!(run.state.final_stats.records_sent, 0),
        other => panic!("Expected finished run, got {}", other.status()),
    }
}

#[test_log::test(tokio::test)]
async fn test_transient_delivery_failure_reuses_artifact() {
    let h = Harness::new(GREETING).await;
    h.mailer
        .add_response("r1", Err(DeliveryError::Transient("421 try later".into())));
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 1);
    assert_eq!(h.compiler.call_count(), 1);
    assert_eq!(h.mailer.call_count(), 2);
    match read_state(&h.path("archive/r1")) {
        AnyRecord::Archived(r) => assert_eq!(r.state.attempts.delivery, 1),
        other => panic!("Expected archived record, got {}", other.status()),
    }
}

#[test_log::test(tokio::test)]
async fn test_rejected_delivery_fails_record() {
    let h = Harness::new(GREETING).await;
    h.mailer.add_response(
        "r1",
        Err(DeliveryError::Rejected("550 mailbox unavailable".into())),
    );
    h.write_input("r1.json", r#"{"to": "nobody@example.com", "values": {"name": "Ana"}}"#);

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].diagnostic.contains("550"));
    assert_eq!(h.mailer.call_count(), 1);
    assert!(h.path("failed/r1/pdfs").exists());
}

#[test_log::test(tokio::test)]
async fn test_mail_request_input_fills_letter_template() {
    let h = Harness::new("{{FIRST_PARAGRAPH}}|{{SECOND_PARAGRAPH}}|{{BODY}}").await;
    h.write_input(
        "inbox-42.json",
        r#"{
            "subject": "Invoice 42",
            "from": [["Ana", "ana@example.com"]],
            "cc": [["Bo", "bo@example.com"], ["Ana again", "ana@example.com"]],
            "text": "Dear team,\n\nPlease find 100% of it.\n\nRegards"
        }"#,
    );

    let summary = h.daemon().run(false).await.expect("run failed");
    assert_eq!(summary.sent, 1);

    let source = &h.compiler.get_calls()[0].source_text;
    assert!(source.starts_with("Dear team,|"));
    assert!(source.contains("100\\%"));
    assert!(source.ends_with("|Regards"));

    let sends = h.mailer.get_calls();
    assert_eq!(
        sends[0].mail.to,
        vec!["ana@example.com".to_string(), "bo@example.com".to_string()]
    );
    assert_eq!(sends[0].mail.subject, "PDF: Invoice 42");
    assert!(h.path("archive/inbox-42/state.json").exists());
}

#[test_log::test(tokio::test)]
async fn test_invalid_input_is_quarantined_and_others_proceed() {
    let h = Harness::new(GREETING).await;
    h.write_input("bad.json", "{ this is not json");
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);
    h.write_input("r2.json", r#"{"to": "b@example.com", "values": {"name": "Bo"}}"#);

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].id, "bad");
    assert!(h.path("failed/bad/bad.json").exists());
    assert!(h.path("archive/r1/state.json").exists());
    assert!(h.path("archive/r2/state.json").exists());
}

#[test_log::test(tokio::test)]
async fn test_many_records_respect_concurrency_limit() {
    let h = Harness::new(GREETING).await;
    for i in 0..6 {
        h.write_input(
            &format!("r{i}.json"),
            &format!(r#"{{"to": "user{i}@example.com", "values": {{"name": "N{i}"}}}}"#),
        );
    }

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 6);
    assert_eq!(h.mailer.call_count(), 6);
    assert_eq!(h.compiler.in_flight_count(), 0);
    let remaining: Vec<AnyRecord> = h.storage.list_pending().try_collect().await.unwrap();
    assert!(remaining.is_empty());

    let runs = h.storage.list_runs().await.unwrap();
    match &runs[0] {
        AnyRunRecord::Finished(run) => {
            assert_eq!(run.state.final_stats.records_sent, 6);
            assert_eq!(run.state.final_stats.records_in_flight, 0);
            assert!(run.state.error.is_none());
        }
        other => panic!("Expected finished run, got {}", other.status()),
    }
}

#[test_log::test(tokio::test)]
async fn test_shutdown_before_dispatch_leaves_records_pending() {
    let h = Harness::new(GREETING).await;
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let summary = h.daemon_with(shutdown).run(true).await.expect("run failed");

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.pending, 1);
    assert_eq!(h.compiler.call_count(), 0);
    assert!(h.path("data/r1.json").exists());
}

#[test_log::test(tokio::test)]
async fn test_missing_default_template_aborts_before_processing() {
    let h = Harness::new(GREETING).await;
    std::fs::remove_file(h.path("templates/template.tex")).unwrap();
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let result = h.daemon().run(false).await;

    assert!(matches!(result, Err(TexpostError::TemplateInvalid { .. })));
    assert_eq!(h.compiler.call_count(), 0);
    assert!(h.ledger("r1").await.is_none());
}

#[test_log::test(tokio::test)]
async fn test_delivery_fails_after_transient_limit() {
    let h = Harness::new(GREETING).await;
    assert_eq!(h.config.smtp.max_attempts, 3);
    for _ in 0..3 {
        h.mailer.add_response(
            "r1",
            Err(DeliveryError::Connection("connection reset".into())),
        );
    }
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let summary = h.daemon().run(false).await.expect("run failed");

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed.len(), 1);
    assert!(
        summary.failed[0]
            .diagnostic
            .starts_with("Delivery failed after 3 attempt(s)")
    );
    assert!(summary.failed[0].diagnostic.contains("connection reset"));
    assert_eq!(h.compiler.call_count(), 1);
    assert_eq!(h.mailer.call_count(), 3);

    let location = h.path("failed/r1");
    match read_state(&location) {
        AnyRecord::Failed(r) => assert_eq!(r.state.attempts.delivery, 3),
        other => panic!("Expected failed record, got {}", other.status()),
    }
    assert!(location.join("pdfs/r1.pdf").exists());
}

/// Compiler that signals when a compile starts and waits to be released.
#[derive(Clone)]
struct GatedCompiler {
    inner: MockCompiler,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Compiler for GatedCompiler {
    async fn compile(&self, job: &CompileJob) -> texpost::Result<Artifact> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.compile(job).await
    }
}

#[test_log::test(tokio::test)]
async fn test_shutdown_during_compile_finishes_stage_and_stops() {
    let h = Harness::new(GREETING).await;
    h.write_input("r1.json", r#"{"to": "a@example.com", "values": {"name": "Ana"}}"#);

    let gated = GatedCompiler {
        inner: h.compiler.clone(),
        started: Arc::new(Notify::new()),
        release: Arc::new(Notify::new()),
    };
    let shutdown = CancellationToken::new();
    let daemon = Daemon::new(
        h.storage.clone(),
        Arc::new(gated.clone()),
        Arc::new(h.mailer.clone()),
        h.config.clone(),
        shutdown.clone(),
    );
    let run = tokio::spawn(async move { daemon.run(false).await });

    gated.started.notified().await;
    shutdown.cancel();
    gated.release.notify_one();

    let summary = run.await.unwrap().expect("run failed");

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.pending, 1);
    assert_eq!(h.compiler.call_count(), 1);
    assert_eq!(h.mailer.call_count(), 0);
    assert!(matches!(h.ledger("r1").await, Some(AnyRecord::Compiled(_))));

    // The next run resumes at delivery.
    let summary = h.daemon().run(false).await.expect("second run failed");
    assert_eq!(summary.sent, 1);
    assert_eq!(h.compiler.call_count(), 1);
    assert_eq!(h.mailer.call_count(), 1);
}
