use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::reconcile::ReconcileOptions;

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    /// Mark partial asks as complete once a later non-command message exists
    pub complete_orphaned_partials: bool,
    /// Collapse unanswered command_output asks to the newest one
    pub dedupe_command_output: bool,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        let defaults = ReconcileOptions::default();
        Self {
            complete_orphaned_partials: defaults.complete_orphaned_partials,
            dedupe_command_output: defaults.dedupe_command_output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSection {
    pub enabled: bool,
    /// JSONL file; defaults to `$XDG_DATA_HOME/chatsync/diagnostics.jsonl`
    pub path: Option<String>,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self { enabled: true, path: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// EnvFilter directive, e.g. "warn" or "chatsync=debug"
    pub level: String,
    /// Log to this file instead of stderr
    pub file: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

// ── Config file ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub reconcile: ReconcileSection,
    pub diagnostics: DiagnosticsSection,
    pub logging: LoggingSection,
}

impl ConfigFile {
    /// Load from disk, or return defaults if the file doesn't exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    /// Write a starter config file to disk (only if it doesn't exist).
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path.to_path_buf())
    }
}

// ── Resolved runtime config (after merging file + CLI overrides) ──────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub reconcile: ReconcileOptions,
    /// None when diagnostics are disabled
    pub diagnostics_path: Option<PathBuf>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Merge the config file with CLI overrides.
    /// Priority: CLI args > env vars (handled by clap) > config file > built-in defaults
    pub fn resolve(file: &ConfigFile, log_level_override: Option<&str>) -> Self {
        let diagnostics_path = file.diagnostics.enabled.then(|| {
            file.diagnostics
                .path
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(crate::diagnostics::default_path)
        });
        Self {
            reconcile: ReconcileOptions {
                complete_orphaned_partials: file.reconcile.complete_orphaned_partials,
                dedupe_command_output: file.reconcile.dedupe_command_output,
            },
            diagnostics_path,
            log_level: log_level_override
                .map(str::to_string)
                .unwrap_or_else(|| file.logging.level.clone()),
            log_file: file.logging.file.as_deref().map(expand_home),
        }
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

pub fn config_path() -> PathBuf {
    dirs_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatsync")
        .join("config.toml")
}

fn dirs_config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

/// `~/x` → `$HOME/x`; anything else is taken as-is.
fn expand_home(raw: &str) -> PathBuf {
    match (raw.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(raw),
    }
}

// ── Default config template written by --init ─────────────────────────────────

const DEFAULT_CONFIG_TOML: &str = r#"# chatsync configuration
# Run `chatsync --init` to regenerate this file.

# ── Reconciliation ────────────────────────────────────────────────────────────
[reconcile]
# A partial ask followed by any later non-command message is treated as
# answered and marked complete.
complete_orphaned_partials = true
# Keep only the newest unanswered command_output ask from each snapshot.
dedupe_command_output = true

# ── Diagnostics ───────────────────────────────────────────────────────────────
# Tool pairing repairs and malformed host lines are recorded here.
# `chatsync diagnostics` lists them.
[diagnostics]
enabled = true
# path = "~/.local/share/chatsync/diagnostics.jsonl"

# ── Logging ───────────────────────────────────────────────────────────────────
# RUST_LOG, CHATSYNC_LOG and --log-level take precedence over `level`.
[logging]
level = "warn"
# file = "/tmp/chatsync.log"
"#;
