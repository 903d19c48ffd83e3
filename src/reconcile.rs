//! Snapshot/delta reconciliation.
//!
//! Snapshots (`state`) and deltas (`messageUpdated`) for the same message can
//! arrive in either order, and some messages are mid-stream when a snapshot
//! lands. Per message, keyed by `ts`, the incoming version wins unless:
//!
//!   1. the current version is complete and the incoming one is a partial
//!      that is not strictly longer (a stale partial re-arriving after its
//!      completion), or
//!   2. the message is streaming and the incoming version is shorter than
//!      what we already have, unless it is a completion of at least the
//!      same length.
//!
//! Snapshots are authoritative for which messages exist; deltas only ever
//! touch the message they carry. After the per-message pass come the
//! post-passes: command_output dedup, synthetic ask re-append, orphaned
//! partial completion, and the final sort by `ts`.
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::command_output::{CommandOutputs, PendingOutputUpdate};
use crate::message::ChatMessage;
use crate::version::{VersionIndex, version_of};

// ── Options ───────────────────────────────────────────────────────────────────

/// Toggles for the heuristic post-passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Mark partial asks complete once an unrelated message follows them
    pub complete_orphaned_partials: bool,
    /// Keep only the newest unanswered command_output ask from a snapshot
    pub dedupe_command_output: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            complete_orphaned_partials: true,
            dedupe_command_output: true,
        }
    }
}

// ── Per-message decision ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// First sighting of this ts
    Inserted,
    /// Default path: incoming replaces current
    Accepted,
    /// Longer partial after completion: a new streaming session
    AcceptedNewStream,
    /// Streaming message completed
    AcceptedCompletion,
    /// Streaming message, incoming strictly longer
    AcceptedLonger,
    /// Streaming message, same length but different content
    AcceptedChanged,
    /// Streaming message, incoming shorter: keep what we have
    KeptCurrent,
    /// Stale partial arriving after completion
    RejectedStalePartial,
}

impl Decision {
    pub fn accepted_incoming(self) -> bool {
        !matches!(self, Self::KeptCurrent | Self::RejectedStalePartial)
    }
}

/// Decide between the current and incoming versions of one message.
pub fn merge_message(
    current: Option<&ChatMessage>,
    incoming: &ChatMessage,
    index: &VersionIndex,
) -> (ChatMessage, Decision) {
    let Some(current) = current else {
        return (incoming.clone(), Decision::Inserted);
    };
    let current_version = index.version(current.ts).unwrap_or_else(|| version_of(current));
    let incoming_version = version_of(incoming);

    // 1. Completion over stale partial
    if !current.partial && incoming.partial {
        if incoming_version <= current_version {
            return (current.clone(), Decision::RejectedStalePartial);
        }
        return (incoming.clone(), Decision::AcceptedNewStream);
    }

    // 2. Active streaming protection
    if current.partial && index.is_streaming(current.ts) {
        if !incoming.partial && incoming_version >= current_version {
            return (incoming.clone(), Decision::AcceptedCompletion);
        }
        if incoming_version > current_version {
            return (incoming.clone(), Decision::AcceptedLonger);
        }
        if incoming_version == current_version && current.content_changed(incoming) {
            return (incoming.clone(), Decision::AcceptedChanged);
        }
        return (current.clone(), Decision::KeptCurrent);
    }

    // 3. Default
    (incoming.clone(), Decision::Accepted)
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// New store contents, sorted by ts
    pub messages: Vec<ChatMessage>,
    /// Execution ids whose synthetic ask was replaced by a remote ask
    pub superseded: Vec<String>,
}

/// Merge a full snapshot into the current transcript.
pub fn reconcile(
    current: &[ChatMessage],
    incoming: &[ChatMessage],
    index: &VersionIndex,
    commands: &CommandOutputs,
    options: ReconcileOptions,
) -> Reconciled {
    let current_by_ts: HashMap<i64, &ChatMessage> = current.iter().map(|m| (m.ts, m)).collect();

    // A ts listed twice in one snapshot: the later entry wins
    let mut incoming_by_ts: HashMap<i64, &ChatMessage> = HashMap::with_capacity(incoming.len());
    for message in incoming {
        incoming_by_ts.insert(message.ts, message);
    }

    let duplicates = if options.dedupe_command_output {
        stale_command_output_asks(incoming_by_ts.values().copied())
    } else {
        HashSet::new()
    };
    let kept_command_ask = if options.dedupe_command_output {
        newest_command_output_ask(incoming_by_ts.values().copied())
    } else {
        None
    };

    let superseded = superseded_synthetic_asks(incoming_by_ts.values().copied(), commands);

    let mut merged: Vec<ChatMessage> = Vec::with_capacity(incoming_by_ts.len() + 1);
    for (ts, message) in &incoming_by_ts {
        if duplicates.contains(ts) {
            debug!(ts, "stale command_output ask discarded");
            continue;
        }
        let (mut message, decision) = merge_message(current_by_ts.get(ts).copied(), message, index);
        if decision != Decision::Accepted && decision != Decision::Inserted {
            debug!(ts, ?decision, "snapshot merge");
        }
        if Some(*ts) == kept_command_ask {
            if let Some(pending) = override_for(&message, commands, &superseded) {
                apply_pending_override(&mut message, pending);
            }
        }
        merged.push(message);
    }

    // Synthetic asks have no remote origin; a snapshot can't delete them.
    for (execution_id, ts) in commands.synthetic_asks() {
        if incoming_by_ts.contains_key(&ts) || superseded.iter().any(|id| id == execution_id) {
            continue;
        }
        if let Some(message) = current_by_ts.get(&ts) {
            merged.push((*message).clone());
        }
    }

    finish(merged, commands, options, superseded)
}

/// Merge one delta into the current transcript. Unlike a snapshot, a delta
/// says nothing about the existence of other messages.
pub fn merge_delta(
    current: &[ChatMessage],
    incoming: &ChatMessage,
    index: &VersionIndex,
    commands: &CommandOutputs,
    options: ReconcileOptions,
) -> Reconciled {
    let mut messages = current.to_vec();
    let position = messages.iter().position(|m| m.ts == incoming.ts);
    let (merged, decision) = merge_message(position.map(|i| &messages[i]), incoming, index);
    if !decision.accepted_incoming() {
        debug!(ts = incoming.ts, ?decision, "delta rejected");
    }
    match position {
        Some(i) => messages[i] = merged,
        None => messages.push(merged),
    }

    let superseded = superseded_synthetic_asks(std::iter::once(incoming), commands);
    if !superseded.is_empty() {
        let dropped: HashSet<i64> = superseded
            .iter()
            .filter_map(|id| commands.synthetic_ts(id))
            .collect();
        messages.retain(|m| !dropped.contains(&m.ts));
    }

    finish(messages, commands, options, superseded)
}

/// Write a synthetic ask produced by the command manager. The manager is the
/// only author of these asks, so the candidate replaces the stored version
/// outright: a shrinking progress line or a short final output must still land.
pub fn replace_synthetic(
    current: &[ChatMessage],
    candidate: &ChatMessage,
    commands: &CommandOutputs,
    options: ReconcileOptions,
) -> Reconciled {
    let mut messages = current.to_vec();
    match messages.iter_mut().find(|m| m.ts == candidate.ts) {
        Some(slot) => *slot = candidate.clone(),
        None => messages.push(candidate.clone()),
    }
    finish(messages, commands, options, Vec::new())
}

fn finish(
    mut messages: Vec<ChatMessage>,
    commands: &CommandOutputs,
    options: ReconcileOptions,
    superseded: Vec<String>,
) -> Reconciled {
    messages.sort_by_key(|m| m.ts);
    if options.complete_orphaned_partials {
        let running: HashSet<i64> = messages
            .iter()
            .filter(|m| commands.is_running(m.ts))
            .map(|m| m.ts)
            .collect();
        let completed = complete_orphaned_partials(&mut messages, &running);
        if completed > 0 {
            debug!(completed, "orphaned partial asks completed");
        }
    }
    Reconciled { messages, superseded }
}

// ── Post-passes ───────────────────────────────────────────────────────────────

fn is_open_command_ask(message: &ChatMessage) -> bool {
    message.is_command_output_ask() && !message.is_answered
}

fn newest_command_output_ask<'a>(incoming: impl Iterator<Item = &'a ChatMessage>) -> Option<i64> {
    incoming.filter(|m| is_open_command_ask(m)).map(|m| m.ts).max()
}

/// The host re-emits unanswered command_output asks (often with empty
/// bodies). Every one but the newest is stale.
pub fn stale_command_output_asks<'a>(
    incoming: impl Iterator<Item = &'a ChatMessage> + Clone,
) -> HashSet<i64> {
    let Some(newest) = newest_command_output_ask(incoming.clone()) else {
        return HashSet::new();
    };
    incoming
        .filter(|m| is_open_command_ask(m) && m.ts != newest)
        .map(|m| m.ts)
        .collect()
}

/// Pending entry to fold into the kept command_output ask. An ask that names
/// its execution uses that entry, unless it supersedes our synthetic ask, in
/// which case the remote content is final.
fn override_for<'a>(
    message: &ChatMessage,
    commands: &'a CommandOutputs,
    superseded: &[String],
) -> Option<&'a PendingOutputUpdate> {
    match message.execution_id() {
        Some(id) if superseded.contains(&id) => None,
        Some(id) => commands.pending(&id),
        None => commands.override_source(),
    }
}

/// Rewrite a remote command_output ask with the locally tracked command state.
pub fn apply_pending_override(message: &mut ChatMessage, pending: &PendingOutputUpdate) {
    let mut payload = message.command_payload().unwrap_or_default();
    payload.output = pending.output.clone();
    payload.command = pending.command.clone();
    message.text = payload.to_text();
    message.partial = !pending.completed;
    message.is_answered = false;
}

/// Execution ids whose synthetic ask is replaced by a remote command_output
/// ask carrying the same execution id under a different ts.
fn superseded_synthetic_asks<'a>(
    incoming: impl Iterator<Item = &'a ChatMessage>,
    commands: &CommandOutputs,
) -> Vec<String> {
    let mut superseded = Vec::new();
    for message in incoming {
        let Some(execution_id) = message.execution_id() else { continue };
        match commands.synthetic_ts(&execution_id) {
            Some(ts) if ts != message.ts => {
                if !superseded.contains(&execution_id) {
                    superseded.push(execution_id);
                }
            }
            _ => {}
        }
    }
    superseded
}

/// Force-complete partial asks that have a later message which is not a
/// command_output ask. The host sometimes appends a new message without ever
/// flipping the previous ask's `partial` flag; left alone it would wedge the
/// UI. `exempt` lists asks whose lifecycle we own (running synthetic asks).
/// A running command's ask stays partial until its `exited`/`timeout` status
/// arrives, even when the host has appended messages after it.
///
/// Expects `messages` sorted by ts. Returns how many asks were completed.
pub fn complete_orphaned_partials(messages: &mut [ChatMessage], exempt: &HashSet<i64>) -> usize {
    let mut completed = 0;
    let mut followed = false;
    for message in messages.iter_mut().rev() {
        if followed && message.partial && message.is_ask() && !exempt.contains(&message.ts) {
            message.partial = false;
            completed += 1;
        }
        if !message.is_command_output_ask() {
            followed = true;
        }
    }
    completed
}
