//! # relay
//!
//! Command-line front end for the relay engine. Runs agent pipelines
//! against configured backends and inspects the resulting session
//! archive, usage ledger, and knowledge store.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use relay_backend::{BackendDirectory, EchoBackend};
use relay_core::{RelayConfig, SessionEvent, SessionStatus};
use relay_engine::Orchestrator;
use relay_store::{Database, KnowledgeRepo, SessionRepo, UsageLedger};
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// Budget-enforced multi-agent session relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Run budget-enforced agent pipelines and inspect their traces")]
struct Cli {
    /// Path to the JSON config. Built-in defaults apply when the file is absent.
    #[arg(long, default_value = "relay.json")]
    config: PathBuf,

    /// Path to the SQLite database.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Emit JSON log lines instead of human-readable ones.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one session through the configured pipeline.
    Run {
        /// User input that seeds the session context.
        #[arg(long)]
        input: String,

        /// Start from this role instead of the pipeline's first entry.
        #[arg(long)]
        role: Option<String>,
    },

    /// List archived sessions, newest first.
    Sessions {
        /// Filter by status: running, completed, failed or aborted.
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Per-backend totals from the usage ledger.
    Ledger {
        /// Restrict to records from the last N seconds.
        #[arg(long)]
        window: Option<u64>,
    },

    /// List knowledge topics.
    Topics,

    /// Show the latest revision of a knowledge topic.
    Knowledge {
        topic: String,

        /// Print the full revision history instead.
        #[arg(long)]
        history: bool,
    },
}

impl Cli {
    fn default_db_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".relay").join("relay.db")
    }
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    if path.exists() {
        RelayConfig::load(path).with_context(|| format!("load config from {}", path.display()))
    } else {
        tracing::info!(path = %path.display(), "no config file, using built-in defaults");
        Ok(RelayConfig::default())
    }
}

/// Every configured backend gets an echo transport. Real service transports
/// plug in here once one exists for the backend's class.
fn build_directory(config: &RelayConfig) -> BackendDirectory {
    let mut directory = BackendDirectory::new();
    for spec in &config.backends {
        directory.register(spec.clone(), Arc::new(EchoBackend::new(&spec.id)));
    }
    directory
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json_output: args.json_logs,
        ..TelemetryConfig::default()
    });

    let config = load_config(&args.config)?;
    let db_path = args.db.clone().unwrap_or_else(Cli::default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("open database at {}", db_path.display()))?;

    match args.command {
        Command::Run { input, role } => run(config, db, input, role).await,
        Command::Sessions { status, limit } => list_sessions(db, status.as_deref(), limit),
        Command::Ledger { window } => print_ledger(db, window),
        Command::Topics => print_topics(db),
        Command::Knowledge { topic, history } => print_knowledge(db, &topic, history),
    }
}

async fn run(
    config: RelayConfig,
    db: Database,
    input: String,
    role: Option<String>,
) -> Result<()> {
    let directory = build_directory(&config);
    let orchestrator = Arc::new(Orchestrator::new(config, db, directory)?);

    // Subscribe before spawning so the stream sees the session from its
    // first event.
    let mut events = BroadcastStream::new(orchestrator.subscribe());
    let session_id = orchestrator.start_session(input, role);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(session_id = %session_id, "interrupt received, aborting session");
                let _ = orchestrator.abort(&session_id);
            }
            item = events.next() => match item {
                Some(Ok(event)) => {
                    if event.session_id() != &session_id {
                        continue;
                    }
                    println!("{}", render_event(&event));
                    if matches!(event, SessionEvent::SessionFinished { .. }) {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                None => break,
            }
        }
    }

    let report = orchestrator.report(&session_id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn render_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::SessionStarted {
            session_id,
            first_role,
        } => format!("{session_id} started with role '{first_role}'"),
        SessionEvent::StepStarted { role, step, .. } => format!("step {step}: {role}"),
        SessionEvent::BackendSelected { backend_id, .. } => format!("  backend {backend_id}"),
        SessionEvent::CallRecorded {
            backend_id,
            outcome,
            units,
            ..
        } => format!("  {backend_id}: {outcome}, {units} units"),
        SessionEvent::ContextMerged { role, keys, .. } => {
            format!("  merged [{}] from {role}", keys.join(", "))
        }
        SessionEvent::KnowledgeFlushed {
            topic, revision, ..
        } => format!("knowledge '{topic}' flushed at revision {revision}"),
        SessionEvent::SessionFinished {
            status, failure, ..
        } => match failure {
            Some(failure) => format!("session {status}: {failure}"),
            None => format!("session {status}"),
        },
    }
}

fn list_sessions(db: Database, status: Option<&str>, limit: u32) -> Result<()> {
    let filter = status
        .map(|raw| raw.parse::<SessionStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let records = SessionRepo::new(db).list(filter.as_ref(), limit, 0)?;
    if records.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for record in records {
        let failure = record
            .failure
            .as_ref()
            .map(|cause| format!("  ({cause})"))
            .unwrap_or_default();
        println!(
            "{}  {:<9}  {}  {}{}",
            record.id,
            record.status.to_string(),
            record.created_at,
            record.first_role,
            failure
        );
    }
    Ok(())
}

fn print_ledger(db: Database, window: Option<u64>) -> Result<()> {
    let since_ms = match window {
        Some(seconds) => Utc::now().timestamp_millis() - (seconds as i64) * 1000,
        None => 0,
    };
    let summaries = UsageLedger::new(db).summaries(since_ms)?;
    if summaries.is_empty() {
        println!("no usage recorded");
        return Ok(());
    }
    println!(
        "{:<20} {:>8} {:>10} {:>10}",
        "backend", "calls", "failures", "units"
    );
    for summary in summaries {
        println!(
            "{:<20} {:>8} {:>10} {:>10}",
            summary.backend_id, summary.calls, summary.failures, summary.units
        );
    }
    Ok(())
}

fn print_topics(db: Database) -> Result<()> {
    let topics = KnowledgeRepo::new(db).topics()?;
    if topics.is_empty() {
        println!("no topics");
        return Ok(());
    }
    for topic in topics {
        println!("{topic}");
    }
    Ok(())
}

fn print_knowledge(db: Database, topic: &str, history: bool) -> Result<()> {
    let repo = KnowledgeRepo::new(db);
    if history {
        for entry in repo.history(topic)? {
            println!(
                "revision {} ({} at {})",
                entry.revision, entry.session_id, entry.created_at
            );
            println!("{}", serde_json::to_string_pretty(&entry.payload)?);
        }
    } else {
        let entry = repo
            .fetch(topic)
            .with_context(|| format!("topic '{topic}'"))?;
        println!("{}", serde_json::to_string_pretty(&entry.payload)?);
    }
    Ok(())
}
