//! Events from the extension host, parsed once at the channel boundary.
//!
//! One JSON object per line: `{"type": "state", "state": {...}}`,
//! `{"type": "messageUpdated", "chatMessage": {...}}` or
//! `{"type": "commandExecutionStatus", "executionId": ..., "status": ...}`.
//! Anything else parses to [`HostEvent::Unknown`] and is ignored downstream.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::ChatMessage;

// ── HostEvent ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEvent {
    /// Full snapshot; authoritative for which messages exist
    State { state: StateSnapshot },
    /// Single-message delta, usually a streaming partial
    MessageUpdated {
        #[serde(rename = "chatMessage")]
        chat_message: ChatMessage,
    },
    /// Shell command lifecycle, drives the synthetic command_output ask
    CommandExecutionStatus(CommandExecutionStatus),
    #[serde(other)]
    Unknown,
}

impl HostEvent {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::State { .. } => "state",
            Self::MessageUpdated { .. } => "messageUpdated",
            Self::CommandExecutionStatus(_) => "commandExecutionStatus",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(default)]
    pub chat_messages: Vec<ChatMessage>,
    /// Everything else in the host's state (mode, task, settings…)
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// ── Command execution status ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Started,
    Output,
    Exited,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecutionStatus {
    pub execution_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse one line from the host channel.
pub fn parse_event(line: &str) -> Result<HostEvent> {
    serde_json::from_str(line).with_context(|| format!("malformed host event: {}", preview(line)))
}

fn preview(line: &str) -> String {
    const MAX_CHARS: usize = 120;
    if line.chars().count() <= MAX_CHARS {
        return line.to_string();
    }
    let head: String = line.chars().take(MAX_CHARS).collect();
    format!("{head}…")
}
