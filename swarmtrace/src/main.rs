//! swarmtrace - follow a swarm chat session from the terminal
//!
//! Commands:
//! - `follow`: poll a running session, stream agent text and timeline events
//! - `parse`: rebuild the activity timeline from a saved transcript
//! - `status`: show configuration, stored sessions and backend health
//! - `clear`: drop the saved resume state of a session
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/swarmtrace/state.db (~/.local/share/swarmtrace/state.db)
//! - Config: $XDG_CONFIG_HOME/swarmtrace/config.toml (~/.config/swarmtrace/config.toml)
//! - Logs: $XDG_STATE_HOME/swarmtrace/ (~/.local/state/swarmtrace/)

mod render;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use swarmtrace_core::stream::TimelineChange;
use swarmtrace_core::{
    follow, BackendClient, Chunk, Config, Database, FollowOptions, MessageSink, PollConfig,
    PollOutcome, SessionStore, StoreChange, StreamSession,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "swarmtrace")]
#[command(about = "Follow a swarm chat session and reconstruct its activity timeline")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow a running session until it ends or Ctrl-C
    Follow {
        /// Session id on the backend
        session: String,

        /// Start from this stream offset instead of the saved cursor
        #[arg(long)]
        offset: Option<u64>,

        /// Print the final state as JSON instead of streaming text
        #[arg(long)]
        json: bool,

        /// Do not post finished messages back to the backend
        #[arg(long)]
        no_persist: bool,
    },

    /// Build the activity timeline from a transcript file
    Parse {
        /// Transcript to read
        file: PathBuf,

        /// Agent the text is attributed to
        #[arg(short, long, default_value = "Agent")]
        agent: String,

        /// Print the timeline as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show configuration, stored sessions and backend health
    Status,

    /// Drop the saved resume state of a session
    Clear {
        /// Session id
        session: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Logs go to the state dir; stdout carries the chat text
    let mut logging = config.logging.clone();
    if args.verbose {
        logging.level = "debug".to_string();
    }
    let _log_guard =
        swarmtrace_core::logging::init(&logging).context("failed to initialize logging")?;

    tracing::info!(verbose = args.verbose, "swarmtrace starting up");

    match args.command {
        Command::Follow {
            session,
            offset,
            json,
            no_persist,
        } => cmd_follow(&config, session, offset, json, no_persist, args.verbose),
        Command::Parse { file, agent, json } => cmd_parse(&config, &file, &agent, json),
        Command::Status => cmd_status(&config),
        Command::Clear { session } => cmd_clear(&session),
    }
}

fn open_database() -> Result<Database> {
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(db)
}

// ============================================
// follow
// ============================================

fn cmd_follow(
    config: &Config,
    session_id: String,
    offset: Option<u64>,
    json_output: bool,
    no_persist: bool,
    verbose: bool,
) -> Result<()> {
    let db = open_database()?;
    let client =
        BackendClient::new(config.backend.clone()).context("failed to create backend client")?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("failed to set Ctrl-C handler")?;

    let options = FollowOptions {
        offset,
        poll: PollConfig::from(&config.backend),
        stream: config.stream.clone(),
        ..FollowOptions::new(session_id.clone())
    };

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("invalid spinner template")?,
    );
    pb.set_message(format!("following {}", session_id));
    pb.enable_steady_tick(Duration::from_millis(120));

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let sink: Option<&dyn MessageSink> = if no_persist { None } else { Some(&client) };

    let mut current_agent: Option<String> = None;
    let result = runtime.block_on(follow(
        client.clone(),
        sink,
        &db,
        options,
        cancel,
        |store: &SessionStore, changes: &[StoreChange]| {
            if json_output {
                return;
            }
            pb.suspend(|| print_changes(store, changes, &mut current_agent, verbose));
        },
    ));
    pb.finish_and_clear();

    let (summary, session) = result.context("follow failed")?;
    tracing::info!(
        outcome = %summary.outcome,
        offset = summary.offset,
        messages = summary.messages,
        "Follow finished"
    );

    if json_output {
        let store = session.store();
        let output = json!({
            "session_id": store.session_id(),
            "outcome": summary.outcome.as_str(),
            "offset": summary.offset,
            "status": summary.status.map(|s| s.as_str()),
            "chunks": summary.chunks,
            "persisted": summary.persisted,
            "agents": store.agents(),
            "messages": store.messages(),
            "timeline": store.timeline().iter().collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        render::print_summary(&summary);
    }

    match &summary.outcome {
        PollOutcome::Failed(reason) => anyhow::bail!("follow failed: {}", reason),
        PollOutcome::RemoteError | PollOutcome::Stalled => {
            anyhow::bail!("session ended: {}", summary.outcome)
        }
        _ => Ok(()),
    }
}

/// Stream deltas and new timeline rows as they arrive.
fn print_changes(
    store: &SessionStore,
    changes: &[StoreChange],
    current_agent: &mut Option<String>,
    verbose: bool,
) {
    let mut stdout = std::io::stdout().lock();
    for change in changes {
        match change {
            StoreChange::MessageAppended { id, delta } => {
                let agent = store
                    .message(id)
                    .and_then(|m| m.agent())
                    .unwrap_or("assistant");
                if current_agent.as_deref() != Some(agent) {
                    let _ = writeln!(stdout, "\n── {} ──", agent);
                    *current_agent = Some(agent.to_string());
                }
                let _ = write!(stdout, "{}", delta);
            }
            StoreChange::MessageFinalized { id } => {
                if let Some(error) = store.message(id).and_then(|m| m.metadata.error.as_deref()) {
                    let _ = writeln!(stdout, "\n[error] {}", error);
                }
            }
            StoreChange::Timeline(TimelineChange::Added(event_id)) => {
                if let Some(event) = store.timeline().get(event_id) {
                    let _ = writeln!(stdout);
                    for line in render::timeline_lines(event) {
                        let _ = writeln!(stdout, "  {}", line);
                    }
                    *current_agent = None;
                }
            }
            StoreChange::AgentStatus { agent, status } if verbose => {
                let _ = writeln!(stdout, "\n[{}: {}]", agent, status.as_str());
                *current_agent = None;
            }
            _ => {}
        }
    }
    let _ = stdout.flush();
}

// ============================================
// parse
// ============================================

fn cmd_parse(config: &Config, file: &Path, agent: &str, json_output: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut session = StreamSession::new("parse", &config.stream);
    session.ingest(vec![Chunk::text(agent, text)]);
    session.finish_all(Utc::now());

    let timeline = session.store().timeline();
    tracing::info!(file = %file.display(), events = timeline.len(), "Parsed transcript");

    if json_output {
        let events: Vec<_> = timeline.iter().collect();
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    println!("Timeline for {} ({} events)", file.display(), timeline.len());
    println!();
    for event in timeline.iter() {
        for line in render::timeline_lines(event) {
            println!("  {}", line);
        }
    }

    Ok(())
}

// ============================================
// status
// ============================================

fn cmd_status(config: &Config) -> Result<()> {
    println!("swarmtrace Configuration");
    println!("========================");
    println!();

    let backend = &config.backend;
    println!("Backend URL:     {}", backend.base_url);
    println!(
        "API Key:         {}",
        if backend.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Poll Interval:   {}ms", backend.poll_interval_ms);
    println!("Inactivity:      {}s", backend.inactivity_timeout_secs);
    println!("Timeline Cap:    {}", config.stream.timeline_cap);
    println!();
    println!("Config:          {}", Config::config_path().display());
    println!("Database:        {}", Config::database_path().display());
    println!("Logs:            {}", Config::state_dir().display());

    println!();
    match BackendClient::new(backend.clone()) {
        Ok(client) => {
            let runtime =
                tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            let healthy = runtime.block_on(client.health_check())?;
            println!(
                "Backend:         {}",
                if healthy { "reachable" } else { "unreachable" }
            );
        }
        Err(e) => println!("Backend:         invalid configuration ({})", e),
    }

    let db_path = Config::database_path();
    if !db_path.exists() {
        println!();
        println!("Saved Sessions:  0");
        return Ok(());
    }

    let db = open_database()?;
    let sessions = db.list_sessions()?;
    println!();
    println!("Saved Sessions:  {}", sessions.len());
    for record in sessions {
        println!(
            "  - {}  offset {}  {}  {} agent(s)  updated {}",
            record.id,
            record.cursor,
            record.status.map(|s| s.as_str()).unwrap_or("unknown"),
            record.agent_count,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

// ============================================
// clear
// ============================================

fn cmd_clear(session_id: &str) -> Result<()> {
    let db = open_database()?;
    if db.delete_session(session_id)? {
        println!("Cleared saved state for {}", session_id);
    } else {
        println!("No saved state for {}", session_id);
    }
    Ok(())
}
