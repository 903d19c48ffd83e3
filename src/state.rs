//! The one owned unit of mutable conversation state.
//!
//! Message store, version index and streaming set live together here and are
//! only written through [`ReconciliationState::apply_event`] (or explicit
//! command disposal). The index is always rebuilt from the committed store,
//! so the three can't drift apart.
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::command_output::CommandOutputs;
use crate::event::{CommandExecutionStatus, HostEvent};
use crate::message::ChatMessage;
use crate::reconcile::{self, ReconcileOptions, Reconciled};
use crate::version::{Version, VersionIndex};

#[derive(Debug, Clone, Default)]
pub struct ReconciliationState {
    messages: Vec<ChatMessage>,
    index: VersionIndex,
    commands: CommandOutputs,
    options: ReconcileOptions,
    /// Non-message fields of the last snapshot
    host_state: Map<String, Value>,
}

impl ReconciliationState {
    pub fn new(options: ReconcileOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Merged transcript, sorted by ts. The only thing renderers read.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn version(&self, ts: i64) -> Option<Version> {
        self.index.version(ts)
    }

    pub fn is_streaming(&self, ts: i64) -> bool {
        self.index.is_streaming(ts)
    }

    pub fn versions(&self) -> &VersionIndex {
        &self.index
    }

    pub fn commands(&self) -> &CommandOutputs {
        &self.commands
    }

    pub fn host_state(&self) -> &Map<String, Value> {
        &self.host_state
    }

    pub fn options(&self) -> ReconcileOptions {
        self.options
    }

    /// Apply one host event. Returns true when the transcript changed.
    pub fn apply_event(&mut self, event: HostEvent) -> bool {
        self.apply_event_at(event, Utc::now().timestamp_millis())
    }

    /// [`apply_event`](Self::apply_event) with an explicit clock, in epoch
    /// milliseconds, used to stamp newly created synthetic asks.
    pub fn apply_event_at(&mut self, event: HostEvent, now_ms: i64) -> bool {
        match event {
            HostEvent::State { state } => {
                self.host_state = state.other;
                let out = reconcile::reconcile(
                    &self.messages,
                    &state.chat_messages,
                    &self.index,
                    &self.commands,
                    self.options,
                );
                self.commit(out)
            }
            HostEvent::MessageUpdated { chat_message } => {
                let out = reconcile::merge_delta(
                    &self.messages,
                    &chat_message,
                    &self.index,
                    &self.commands,
                    self.options,
                );
                self.commit(out)
            }
            HostEvent::CommandExecutionStatus(status) => self.apply_command_status(&status, now_ms),
            HostEvent::Unknown => false,
        }
    }

    fn apply_command_status(&mut self, status: &CommandExecutionStatus, now_ms: i64) -> bool {
        let new_ts = self.next_synthetic_ts(now_ms);
        let Some(candidate) = self.commands.on_status(status, &self.messages, new_ts) else {
            return false;
        };
        let out = reconcile::replace_synthetic(&self.messages, &candidate, &self.commands, self.options);
        self.commit(out)
    }

    /// Synthetic asks sort after everything already on screen, even when the
    /// host's clock runs ahead of ours.
    fn next_synthetic_ts(&self, now_ms: i64) -> i64 {
        let last = self.messages.last().map_or(i64::MIN, |m| m.ts);
        now_ms.max(last.saturating_add(1))
    }

    /// Remove a command's synthetic ask (user answered or aborted it).
    /// Returns true when the transcript changed.
    pub fn dispose_command(&mut self, execution_id: &str) -> bool {
        let Some(ts) = self.commands.forget(execution_id) else {
            return false;
        };
        info!(execution_id, ts, "synthetic command ask disposed");
        let before = self.messages.len();
        self.messages.retain(|m| m.ts != ts);
        self.index = VersionIndex::from_messages(&self.messages);
        self.messages.len() != before
    }

    /// Drop every synthetic ask, e.g. when the host starts a new task.
    pub fn dispose_all_commands(&mut self) -> bool {
        let ids: Vec<String> = self
            .commands
            .synthetic_asks()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        let mut changed = false;
        for id in ids {
            changed |= self.dispose_command(&id);
        }
        self.commands.clear();
        changed
    }

    fn commit(&mut self, out: Reconciled) -> bool {
        for execution_id in &out.superseded {
            debug!(execution_id = execution_id.as_str(), "synthetic ask superseded by host ask");
            self.commands.forget(execution_id);
        }
        if out.messages == self.messages {
            return false;
        }
        self.messages = out.messages;
        self.index = VersionIndex::from_messages(&self.messages);
        true
    }
}
