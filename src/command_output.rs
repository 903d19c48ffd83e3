//! Synthetic `command_output` asks for long-running shell commands.
//!
//! The host does not reliably model a running command as an ask/answer pair,
//! so the CLI keeps its own: `started` creates a partial ask straight away (so
//! the user can abort before any output exists), `output` rewrites it in
//! place, `exited`/`timeout` completes it. Per execution id:
//!
//!   started → output* → {exited | timeout}
//!
//! This module never touches the message store. It only produces candidate
//! messages; the state writes them with `reconcile::replace_synthetic`, which
//! skips the length-based rules and runs the usual post-passes.
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::event::{CommandExecutionStatus, CommandStatus};
use crate::message::{COMMAND_OUTPUT, ChatMessage, CommandOutputPayload};

// ── Pending output ────────────────────────────────────────────────────────────

/// One in-flight (or just finished) shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutputUpdate {
    pub execution_id: String,
    pub output: String,
    pub command: String,
    pub completed: bool,
}

// ── Manager ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CommandOutputs {
    /// In start order; the last entry is the most recent command
    pending: Vec<PendingOutputUpdate>,
    /// execution_id → ts of the synthetic ask
    synthetic: HashMap<String, i64>,
}

impl CommandOutputs {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.synthetic.is_empty()
    }

    pub fn pending(&self, execution_id: &str) -> Option<&PendingOutputUpdate> {
        self.pending.iter().find(|p| p.execution_id == execution_id)
    }

    pub fn synthetic_ts(&self, execution_id: &str) -> Option<i64> {
        self.synthetic.get(execution_id).copied()
    }

    /// `(execution_id, ts)` of every tracked synthetic ask, ordered by ts.
    pub fn synthetic_asks(&self) -> Vec<(&str, i64)> {
        let mut asks: Vec<(&str, i64)> =
            self.synthetic.iter().map(|(id, ts)| (id.as_str(), *ts)).collect();
        asks.sort_by_key(|(_, ts)| *ts);
        asks
    }

    pub fn is_synthetic(&self, ts: i64) -> bool {
        self.synthetic.values().any(|t| *t == ts)
    }

    /// Synthetic ask whose command has not finished yet.
    pub fn is_running(&self, ts: i64) -> bool {
        self.synthetic.iter().any(|(id, t)| {
            *t == ts && self.pending(id).is_some_and(|p| !p.completed)
        })
    }

    /// Entry whose fields override a deduplicated remote command_output ask:
    /// the most recent still-running command, else the most recent one.
    pub fn override_source(&self) -> Option<&PendingOutputUpdate> {
        self.pending
            .iter()
            .rev()
            .find(|p| !p.completed)
            .or_else(|| self.pending.last())
    }

    /// Drop all state for one command. Returns the ts of its synthetic ask.
    pub fn forget(&mut self, execution_id: &str) -> Option<i64> {
        self.pending.retain(|p| p.execution_id != execution_id);
        self.synthetic.remove(execution_id)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.synthetic.clear();
    }

    /// Fold one status event into the pending table and return the candidate
    /// synthetic ask to reconcile, if any.
    ///
    /// `messages` is the current store (used to find the ask being rewritten),
    /// `new_ts` the ts to give a freshly started command's ask.
    pub fn on_status(
        &mut self,
        status: &CommandExecutionStatus,
        messages: &[ChatMessage],
        new_ts: i64,
    ) -> Option<ChatMessage> {
        let id = status.execution_id.as_str();
        match status.status {
            CommandStatus::Started => {
                if self.synthetic.contains_key(id) {
                    debug!(execution_id = id, "duplicate command start ignored");
                    return None;
                }
                let command = status.command.clone().unwrap_or_default();
                self.pending.push(PendingOutputUpdate {
                    execution_id: id.to_string(),
                    output: String::new(),
                    command: command.clone(),
                    completed: false,
                });
                self.synthetic.insert(id.to_string(), new_ts);
                debug!(execution_id = id, ts = new_ts, %command, "synthetic command ask created");

                let payload = CommandOutputPayload {
                    execution_id: Some(id.to_string()),
                    command,
                    output: String::new(),
                    exit_code: None,
                };
                Some(ChatMessage::ask(new_ts, COMMAND_OUTPUT, payload.to_text()).with_partial(true))
            }
            CommandStatus::Output | CommandStatus::Exited | CommandStatus::Timeout => {
                let Some(entry) = self.pending.iter_mut().find(|p| p.execution_id == id) else {
                    warn!(execution_id = id, status = ?status.status, "command update for unknown execution dropped");
                    return None;
                };
                if let Some(output) = &status.output {
                    entry.output = output.clone();
                }
                if let Some(command) = &status.command {
                    entry.command = command.clone();
                }
                let terminal = status.status.is_terminal();
                if terminal {
                    entry.completed = true;
                }
                let entry = entry.clone();

                let Some(existing) = self
                    .synthetic
                    .get(id)
                    .and_then(|ts| messages.iter().find(|m| m.ts == *ts))
                else {
                    warn!(execution_id = id, status = ?status.status, "no synthetic ask for command update; dropped");
                    return None;
                };

                let mut payload = existing.command_payload().unwrap_or_default();
                payload.execution_id = Some(entry.execution_id);
                payload.command = entry.command;
                payload.output = entry.output;
                if terminal {
                    payload.exit_code = status.exit_code.or(payload.exit_code);
                }

                let mut candidate = existing.clone();
                candidate.text = payload.to_text();
                candidate.partial = !terminal;
                candidate.is_answered = false;
                Some(candidate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, status: CommandStatus) -> CommandExecutionStatus {
        CommandExecutionStatus {
            execution_id: id.to_string(),
            status,
            command: None,
            output: None,
            exit_code: None,
        }
    }

    #[test]
    fn test_started_creates_partial_ask() {
        let mut commands = CommandOutputs::default();
        let started = CommandExecutionStatus {
            command: Some("npm test".to_string()),
            ..status("e1", CommandStatus::Started)
        };
        let ask = commands.on_status(&started, &[], 500).unwrap();
        assert_eq!(ask.ts, 500);
        assert!(ask.is_command_output_ask());
        assert!(ask.partial);
        let payload = ask.command_payload().unwrap();
        assert_eq!(payload.command, "npm test");
        assert_eq!(payload.output, "");
        assert_eq!(payload.execution_id.as_deref(), Some("e1"));
        assert_eq!(commands.synthetic_ts("e1"), Some(500));
        assert!(commands.is_running(500));
    }

    #[test]
    fn test_output_rewrites_existing_ask() {
        let mut commands = CommandOutputs::default();
        let ask = commands.on_status(&status("e1", CommandStatus::Started), &[], 10).unwrap();
        let update = CommandExecutionStatus {
            output: Some("ok".to_string()),
            ..status("e1", CommandStatus::Output)
        };
        let rewritten = commands.on_status(&update, &[ask], 99).unwrap();
        assert_eq!(rewritten.ts, 10);
        assert!(rewritten.partial);
        assert_eq!(rewritten.command_payload().unwrap().output, "ok");
        assert_eq!(commands.pending("e1").unwrap().output, "ok");
    }

    #[test]
    fn test_exit_completes_and_embeds_code() {
        let mut commands = CommandOutputs::default();
        let ask = commands.on_status(&status("e1", CommandStatus::Started), &[], 10).unwrap();
        let exited = CommandExecutionStatus {
            exit_code: Some(1),
            ..status("e1", CommandStatus::Exited)
        };
        let done = commands.on_status(&exited, &[ask], 99).unwrap();
        assert!(!done.partial);
        assert!(!done.is_answered);
        assert_eq!(done.command_payload().unwrap().exit_code, Some(1));
        assert!(commands.pending("e1").unwrap().completed);
        assert!(!commands.is_running(10));
    }

    #[test]
    fn test_update_without_ask_is_dropped() {
        let mut commands = CommandOutputs::default();
        assert!(commands.on_status(&status("ghost", CommandStatus::Output), &[], 1).is_none());

        // Tracked, but the ask has vanished from the store
        commands.on_status(&status("e1", CommandStatus::Started), &[], 10).unwrap();
        assert!(commands.on_status(&status("e1", CommandStatus::Timeout), &[], 11).is_none());
        // The pending table still records completion
        assert!(commands.pending("e1").unwrap().completed);
    }

    #[test]
    fn test_duplicate_start_ignored() {
        let mut commands = CommandOutputs::default();
        commands.on_status(&status("e1", CommandStatus::Started), &[], 10).unwrap();
        assert!(commands.on_status(&status("e1", CommandStatus::Started), &[], 20).is_none());
        assert_eq!(commands.synthetic_ts("e1"), Some(10));
    }

    #[test]
    fn test_override_source_prefers_running() {
        let mut commands = CommandOutputs::default();
        assert!(commands.override_source().is_none());
        commands.on_status(&status("a", CommandStatus::Started), &[], 1);
        commands.on_status(&status("b", CommandStatus::Started), &[], 2);
        let b_ask = ChatMessage::ask(2, COMMAND_OUTPUT, "{}").with_partial(true);
        commands.on_status(&status("b", CommandStatus::Exited), &[b_ask], 3);
        assert_eq!(commands.override_source().unwrap().execution_id, "a");

        commands.forget("a");
        // Nothing running: fall back to the most recent
        assert_eq!(commands.override_source().unwrap().execution_id, "b");
    }

    #[test]
    fn test_forget_returns_ts() {
        let mut commands = CommandOutputs::default();
        commands.on_status(&status("e1", CommandStatus::Started), &[], 42);
        assert!(commands.is_synthetic(42));
        assert_eq!(commands.forget("e1"), Some(42));
        assert!(commands.is_empty());
        assert_eq!(commands.forget("e1"), None);
    }
}
