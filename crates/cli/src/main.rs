//! loanrec: loan application record engine.
//!
//! `serve` answers JSON requests, one per stdin line, with one JSON response
//! per stdout line. Logs go to stderr.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use loanrec_core::TransitionPolicy;
use loanrec_engine::{EngineConfig, RecordEngine, RecordService};

#[derive(Parser)]
#[command(name = "loanrec")]
#[command(about = "Loan application record engine")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "LOANREC_CONFIG", default_value = "loanrec.toml")]
    config: PathBuf,

    /// SQLite database path (overrides config file; `:memory:` allowed)
    #[arg(long, env = "LOANREC_DB")]
    db: Option<String>,

    /// Program manifest file (overrides config file)
    #[arg(long, env = "LOANREC_MANIFESTS")]
    manifests: Option<PathBuf>,

    /// Auto-save debounce window in milliseconds (overrides config file)
    #[arg(long, env = "LOANREC_AUTOSAVE_MS")]
    autosave_ms: Option<u64>,

    /// Enforce the full status graph on status changes
    #[arg(long, env = "LOANREC_STRICT")]
    strict: bool,

    /// Log output format
    #[arg(long, env = "LOANREC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON-lines requests on stdin/stdout
    Serve,
    /// List the loaded loan program manifests
    Programs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let mut config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.storage.path = db;
    }
    if let Some(manifests) = cli.manifests {
        config.manifests.path = Some(manifests);
    }
    if let Some(ms) = cli.autosave_ms {
        config.autosave.delay_ms = ms;
    }
    if cli.strict {
        config.lifecycle.policy = TransitionPolicy::Strict;
    }

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Programs => programs(&config),
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("loanrec=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

async fn serve(config: &EngineConfig) -> anyhow::Result<()> {
    let engine = RecordEngine::open(config).context("opening record engine")?;
    let service = RecordService::new(engine.clone());
    info!(
        storage = %config.storage.path,
        autosave_ms = config.autosave.delay_ms,
        "serving requests on stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut handled = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = service.handle_json(&line).await;
        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        handled += 1;
    }
    debug!(handled, "input closed");

    engine
        .shutdown()
        .await
        .context("flushing pending edits at shutdown")?;
    info!(handled, "shut down cleanly");
    Ok(())
}

fn programs(config: &EngineConfig) -> anyhow::Result<()> {
    let registry = config.manifest_registry()?;
    for manifest in registry.programs() {
        let tracked: Vec<&str> = manifest
            .tracked_sections
            .iter()
            .map(|section| section.as_str())
            .collect();
        let line = serde_json::json!({
            "name": manifest.name,
            "category": manifest.category,
            "trackedSections": tracked,
            "fields": manifest.fields.len(),
        });
        println!("{line}");
    }
    Ok(())
}
