use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chatsync::bridge;
use chatsync::config::{self, ConfigFile, ResolvedConfig};
use chatsync::conversation::{ApiHistory, ApiMessage};
use chatsync::diagnostics::{self, DiagnosticSink, JsonlSink, LogSink};
use chatsync::render::{self, TranscriptPrinter};
use chatsync::state::ReconciliationState;
use clap::{CommandFactory, Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "chatsync",
    about = "Mirror a coding-assistant host's conversation as a flicker-free transcript",
    long_about = None,
)]
struct Args {
    #[command(subcommand)]
    command: Option<Cmd>,

    /// Config file (default: ~/.config/chatsync/config.toml)
    #[arg(long, global = true, env = "CHATSYNC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "chatsync=trace" (RUST_LOG wins)
    #[arg(long, global = true, env = "CHATSYNC_LOG", value_name = "FILTER")]
    log_level: Option<String>,

    /// Write a default config file and exit
    #[arg(long)]
    init: bool,

    /// Generate shell completions and print to stdout (bash, zsh, fish, elvish)
    #[arg(long, value_name = "SHELL")]
    completions: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Read host events from stdin and print transcript changes as they settle
    Follow,
    /// Feed a JSONL event log through the engine and print the final transcript
    Replay {
        file: PathBuf,
        /// Print the merged messages as JSON instead of text
        #[arg(long)]
        json: bool,
        /// Cut each message to one line of this many columns
        #[arg(long, value_name = "COLS")]
        width: Option<usize>,
    },
    /// Spawn the host process and follow its stdout
    Attach {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Validate every user turn of a JSON API history and print the repaired history
    RepairHistory { file: PathBuf },
    /// List recorded diagnostics
    Diagnostics {
        /// Delete the diagnostics file instead
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(config::config_path);

    // ── --init ────────────────────────────────────────────────────────────────
    if args.init {
        let path = ConfigFile::write_default_if_missing(&config_path)?;
        println!("Config written to: {}", path.display());
        return Ok(());
    }

    // ── --completions ─────────────────────────────────────────────────────────
    if let Some(shell_name) = &args.completions {
        return generate_completions(shell_name);
    }

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let file = ConfigFile::load(&config_path)?;
    let resolved = ResolvedConfig::resolve(&file, args.log_level.as_deref());
    init_logging(&resolved);
    let sink = diagnostic_sink(&resolved);

    match command {
        Cmd::Follow => {
            let events = bridge::spawn_reader(BufReader::new(tokio::io::stdin()), sink);
            follow(events, &resolved).await;
            Ok(())
        }
        Cmd::Replay { file, json, width } => replay(&file, json, width, &resolved, sink).await,
        Cmd::Attach { command } => attach(&command, &resolved, sink).await,
        Cmd::RepairHistory { file } => repair_history(&file, sink.as_ref()),
        Cmd::Diagnostics { clear } => show_diagnostics(&resolved, clear),
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// stdout carries the transcript, so logs go to stderr or the configured file.
fn init_logging(resolved: &ResolvedConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&resolved.log_level));

    let log_file = resolved.log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("  log file {} unavailable: {e}", path.display()))
            .ok()
    });

    let _ = match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
}

fn diagnostic_sink(resolved: &ResolvedConfig) -> Arc<dyn DiagnosticSink> {
    match &resolved.diagnostics_path {
        Some(path) => Arc::new(JsonlSink::new(path)),
        None => Arc::new(LogSink),
    }
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn follow(
    events: tokio::sync::mpsc::UnboundedReceiver<chatsync::HostEvent>,
    resolved: &ResolvedConfig,
) -> ReconciliationState {
    let mut state = ReconciliationState::new(resolved.reconcile);
    let mut printer = TranscriptPrinter::new();
    let applied = bridge::drive(events, &mut state, |state| {
        for block in printer.update(state.messages()) {
            println!("{block}");
        }
    })
    .await;
    info!(events = applied, messages = state.messages().len(), "host channel drained");
    state
}

async fn replay(
    path: &Path,
    json: bool,
    width: Option<usize>,
    resolved: &ResolvedConfig,
    sink: Arc<dyn DiagnosticSink>,
) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open event log {}", path.display()))?;
    let events = bridge::event_stream(BufReader::new(file), sink);
    let mut events = std::pin::pin!(events);

    let mut state = ReconciliationState::new(resolved.reconcile);
    let mut applied = 0usize;
    while let Some(event) = events.next().await {
        state.apply_event(event);
        applied += 1;
    }
    info!(events = applied, messages = state.messages().len(), "replay finished");

    if json {
        println!("{}", serde_json::to_string_pretty(state.messages())?);
    } else if let Some(width) = width {
        println!("{}", render::render_transcript(state.messages(), width));
    } else {
        for message in state.messages() {
            println!("{}", render::render_message(message));
        }
    }
    Ok(())
}

async fn attach(command: &[String], resolved: &ResolvedConfig, sink: Arc<dyn DiagnosticSink>) -> Result<()> {
    let bridge::HostProcess { mut child, events } = bridge::spawn_host(command, sink)?;
    let mut state = follow(events, resolved).await;
    state.dispose_all_commands();

    let status = child.wait().await.context("Failed to wait for host process")?;
    if !status.success() {
        warn!(%status, "host process exited with failure");
        bail!("host process exited with {status}");
    }
    Ok(())
}

fn repair_history(path: &Path, sink: &dyn DiagnosticSink) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let turns: Vec<ApiMessage> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of API messages", path.display()))?;
    let history = ApiHistory::repair(turns, sink);
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

fn show_diagnostics(resolved: &ResolvedConfig, clear: bool) -> Result<()> {
    let Some(path) = &resolved.diagnostics_path else {
        println!("  diagnostics are disabled in config");
        return Ok(());
    };
    if clear {
        diagnostics::clear_all(path)?;
        println!("  cleared {}", path.display());
        return Ok(());
    }

    let events = diagnostics::load_all(path);
    if events.is_empty() {
        println!("  no diagnostics recorded ({})", path.display());
        return Ok(());
    }
    for event in &events {
        let when = chrono::DateTime::from_timestamp(event.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| event.timestamp.to_string());
        println!("  {when}  {:<22} {}", event.kind.as_str(), event.message);
        if !event.details.is_null() {
            println!("      {}", event.details);
        }
    }
    Ok(())
}

// ── Shell completions ─────────────────────────────────────────────────────────

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{Shell, generate};

    let shell: Shell = match shell_name.to_lowercase().as_str() {
        "bash"    => Shell::Bash,
        "zsh"     => Shell::Zsh,
        "fish"    => Shell::Fish,
        "elvish"  => Shell::Elvish,
        _ => bail!("Unknown shell: {shell_name} (supported: bash, zsh, fish, elvish)"),
    };

    let mut cmd = Args::command();
    generate(shell, &mut cmd, "chatsync", &mut std::io::stdout());
    Ok(())
}
