//! Tool pairing: every tool_use in an assistant turn needs exactly one
//! tool_result in the user turn that follows it, or the upstream API rejects
//! the whole conversation.
//!
//! [`validate`] never fails. Broken pairings are repaired in two passes:
//!
//! 1. results whose id is a real, not-yet-claimed tool_use id keep it
//! 2. the rest are remapped by position (n-th tool_result → n-th tool_use),
//!    dropped if that id is taken or doesn't exist
//!
//! Claiming exact ids before remapping means a correctly-labelled result is
//! never moved onto another tool_use. A single left-to-right walk would give
//! a different answer for misordered results: with uses `[a, b]` and results
//! `[x, a]` it remaps `x → a` and then `a → b`, whereas here `a` keeps its
//! own result and `b` gets a placeholder. Either way each tool_use ends up
//! with exactly one result. With two results `[c1, c2]` for the single use
//! `c2`, the block already labelled `c2` is the one kept.
//!
//! Any tool_use still without a result gets an "interrupted" placeholder,
//! prepended so results precede trailing text. Problems are reported to the
//! diagnostic sink; the sink has no say in the result.
use std::collections::HashSet;

use serde_json::{Value, json};
use tracing::debug;

use crate::conversation::{ApiMessage, ContentBlock, MessageContent, Role};
use crate::diagnostics::{DiagnosticEvent, DiagnosticKind, DiagnosticSink};

pub const INTERRUPTED_PLACEHOLDER: &str = "Tool execution was interrupted before completion.";

/// Repair `user_turn` against the assistant turn that precedes it in
/// `history` (the last message, if it is an assistant turn).
pub fn validate(user_turn: ApiMessage, history: &[ApiMessage], sink: &dyn DiagnosticSink) -> ApiMessage {
    let Some(assistant) = history.last().filter(|m| m.role == Role::Assistant) else {
        return user_turn;
    };
    let tool_use_ids: Vec<String> = assistant
        .content
        .tool_use_ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    if tool_use_ids.is_empty() || is_paired(&user_turn.content, &tool_use_ids) {
        return user_turn;
    }

    let original_ids: Vec<String> = user_turn
        .content
        .tool_result_ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    let Repair { blocks, remapped, dropped, missing } = repair(user_turn.content.into_blocks(), &tool_use_ids);

    if !remapped.is_empty() || !dropped.is_empty() {
        sink.report(&DiagnosticEvent::new(
            DiagnosticKind::ToolResultMismatch,
            format!(
                "tool_result ids did not match tool_use ids ({} remapped, {} dropped)",
                remapped.len(),
                dropped.len()
            ),
            json!({
                "toolUseIds": tool_use_ids,
                "toolResultIds": original_ids,
                "remapped": remapped.iter().map(|(from, to)| json!({"from": from, "to": to})).collect::<Vec<_>>(),
                "dropped": dropped,
                "toolUseCount": tool_use_ids.len(),
                "toolResultCount": original_ids.len(),
            }),
        ));
    }
    if !missing.is_empty() {
        sink.report(&DiagnosticEvent::new(
            DiagnosticKind::MissingToolResults,
            format!("{} tool_use id(s) had no tool_result; placeholders added", missing.len()),
            json!({
                "missingIds": missing,
                "toolUseIds": tool_use_ids,
                "toolUseCount": tool_use_ids.len(),
            }),
        ));
    }
    debug!(
        remapped = remapped.len(),
        dropped = dropped.len(),
        placeholders = missing.len(),
        "user turn repaired"
    );

    ApiMessage { role: user_turn.role, content: MessageContent::Blocks(blocks) }
}

/// Results cover every tool_use id exactly once and nothing else.
fn is_paired(content: &MessageContent, tool_use_ids: &[String]) -> bool {
    let results = content.tool_result_ids();
    if results.len() != tool_use_ids.len() {
        return false;
    }
    let mut claimed: HashSet<&str> = HashSet::new();
    results
        .iter()
        .all(|id| tool_use_ids.iter().any(|u| u.as_str() == *id) && claimed.insert(*id))
}

struct Repair {
    blocks: Vec<ContentBlock>,
    remapped: Vec<(String, String)>,
    dropped: Vec<String>,
    missing: Vec<String>,
}

fn repair(blocks: Vec<ContentBlock>, tool_use_ids: &[String]) -> Repair {
    // Pass 1: exact ids, first occurrence wins
    let mut claimed: HashSet<&str> = HashSet::new();
    let exact: Vec<bool> = blocks
        .iter()
        .map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => {
                tool_use_ids.iter().any(|u| u == tool_use_id) && claimed.insert(tool_use_id.as_str())
            }
            _ => false,
        })
        .collect();
    let mut claimed: HashSet<String> = claimed.into_iter().map(str::to_string).collect();

    // Pass 2: positional remap of everything else
    let mut remapped = Vec::new();
    let mut dropped = Vec::new();
    let mut kept = Vec::with_capacity(blocks.len());
    let mut position = 0usize;
    for (block, is_exact) in blocks.into_iter().zip(exact) {
        let ContentBlock::ToolResult { tool_use_id, content, is_error } = block else {
            kept.push(block);
            continue;
        };
        let ordinal = position;
        position += 1;
        if is_exact {
            kept.push(ContentBlock::ToolResult { tool_use_id, content, is_error });
            continue;
        }
        match tool_use_ids.get(ordinal) {
            Some(target) if !claimed.contains(target) => {
                claimed.insert(target.clone());
                remapped.push((tool_use_id, target.clone()));
                kept.push(ContentBlock::ToolResult { tool_use_id: target.clone(), content, is_error });
            }
            _ => dropped.push(tool_use_id),
        }
    }

    let missing: Vec<String> = tool_use_ids
        .iter()
        .filter(|id| !claimed.contains(*id))
        .cloned()
        .collect();
    let mut blocks: Vec<ContentBlock> = missing
        .iter()
        .map(|id| ContentBlock::tool_result(id.clone(), Value::String(INTERRUPTED_PLACEHOLDER.to_string())))
        .collect();
    blocks.extend(kept);

    Repair { blocks, remapped, dropped, missing }
}
