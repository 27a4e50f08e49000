use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use texpost::compiler::toolchain_on_path;
use texpost::error::error_serialization::to_diagnostic;
use texpost::logging::{self, LogFormat};
use texpost::{
    Config, ConfigOverrides, Daemon, FsRecordStore, LatexCompiler, RecordStorage, RunStorage,
    SmtpMailer,
};

#[derive(Parser)]
#[command(
    name = "texpost",
    version,
    about = "Render documents from templates, compile them to PDF and mail them"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Path to a TOML configuration file
    #[arg(long, env = "TEXPOST_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: EnvOverrides,
}

/// Settings that override the configuration file.
#[derive(Args)]
struct EnvOverrides {
    /// Root directory holding data/, templates/, pdfs/, emails/ and archive/
    #[arg(long, env = "TEXPOST_ROOT", global = true)]
    root: Option<PathBuf>,

    #[arg(long, env = "PDF_DIR", global = true)]
    pdf_dir: Option<PathBuf>,

    /// Default template file name
    #[arg(long, env = "LATEX_TEMPLATE_FILE", global = true)]
    template_file: Option<String>,

    #[arg(long, env = "SMTP_SERVER", global = true)]
    smtp_server: Option<String>,

    #[arg(long, env = "SMTP_PORT", global = true)]
    smtp_port: Option<u16>,

    #[arg(long, env = "SMTP_SENDER_EMAIL", global = true)]
    smtp_sender: Option<String>,

    #[arg(long, env = "SMTP_SENDER_PASSWORD", hide_env_values = true, global = true)]
    smtp_password: Option<String>,

    #[arg(long, env = "EMAIL_BODY_TEXT", global = true)]
    email_body: Option<String>,
}

impl From<EnvOverrides> for ConfigOverrides {
    fn from(o: EnvOverrides) -> Self {
        ConfigOverrides {
            root: o.root,
            pdf_dir: o.pdf_dir,
            template_file: o.template_file,
            smtp_server: o.smtp_server,
            smtp_port: o.smtp_port,
            smtp_sender: o.smtp_sender,
            smtp_password: o.smtp_password,
            email_body: o.email_body,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Process all pending records
    Run {
        /// Keep polling the data directory until a shutdown signal
        #[arg(long)]
        watch: bool,
    },
    /// List records in the data directory with their state
    Status,
    /// Validate configuration, default template and toolchain
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_overrides(cli.overrides.into());

    match cli.command {
        Commands::Run { watch } => run(config, watch).await,
        Commands::Status => status(config).await,
        Commands::Check => check(config).await,
    }
}

async fn run(config: Config, watch: bool) -> anyhow::Result<()> {
    config.validate()?;
    if !toolchain_on_path(&config.compiler.program) {
        bail!(
            "compiler '{}' was not found on PATH",
            config.compiler.program
        );
    }

    let storage = Arc::new(FsRecordStore::open(&config.paths).await?);
    let compiler = Arc::new(LatexCompiler::from_config(&config.compiler));
    let mailer = Arc::new(SmtpMailer::from_config(&config.smtp)?);

    let shutdown = CancellationToken::new();
    texpost::signal::cancel_on_signal(shutdown.clone());

    let daemon = Daemon::new(storage, compiler, mailer, config, shutdown);
    let summary = daemon.run(watch).await.context("run aborted")?;
    println!("{summary}");
    Ok(())
}

async fn status(config: Config) -> anyhow::Result<()> {
    let storage = FsRecordStore::open(&config.paths).await?;

    let mut records = storage.list_pending();
    let mut count = 0usize;
    while let Some(item) = records.next().await {
        match item {
            Ok(record) => {
                count += 1;
                match record.diagnostic() {
                    Some(diagnostic) => {
                        println!("{:<32} {:<10} {}", record.id(), record.status(), diagnostic)
                    }
                    None => println!("{:<32} {}", record.id(), record.status()),
                }
            }
            Err(e) => println!("{:<32} {}", "<invalid>", e),
        }
    }
    drop(records);
    if count == 0 {
        println!("No pending records in {}", storage.data_dir().display());
    }

    let runs = storage.list_runs().await?;
    if let Some(latest) = runs.iter().max_by_key(|run| match run {
        texpost::daemon::AnyRunRecord::Initializing(r) => r.state.started_at,
        texpost::daemon::AnyRunRecord::Running(r) => r.state.started_at,
        texpost::daemon::AnyRunRecord::Finished(r) => r.state.started_at,
    }) {
        println!("Last run {}: {}", latest.id(), latest.status());
        if let texpost::daemon::AnyRunRecord::Finished(run) = latest
            && let Some(error) = &run.state.error
        {
            println!("  {}", to_diagnostic(error).trim_end());
        }
    }
    Ok(())
}

async fn check(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    println!("configuration: ok");

    let storage = FsRecordStore::open(&config.paths).await?;
    storage
        .load_template(
            &config.template.default_name,
            &config.template.required_placeholders,
        )
        .await
        .context("default template")?;
    println!("template {}: ok", config.template.default_name);

    if !toolchain_on_path(&config.compiler.program) {
        bail!(
            "compiler '{}' was not found on PATH",
            config.compiler.program
        );
    }
    println!("compiler {}: ok", config.compiler.program);
    Ok(())
}
