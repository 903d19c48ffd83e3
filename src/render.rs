//! Plain-text projection of the merged transcript for the CLI.

use std::collections::HashMap;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::message::{COMMAND_OUTPUT, ChatMessage, MessageKind};

// ── Glyphs ────────────────────────────────────────────────────────────────────

pub fn glyph(message: &ChatMessage) -> &'static str {
    match (message.kind, message.subtype.as_str()) {
        (MessageKind::Ask, COMMAND_OUTPUT | "command") => "❯",
        (MessageKind::Ask, "followup") => "?",
        (MessageKind::Ask, "tool") => "⚙",
        (MessageKind::Ask, _) => "▸",
        (MessageKind::Say, "completion_result") => "✓",
        (MessageKind::Say, "error") => "✗",
        (MessageKind::Say, "reasoning") => "…",
        (MessageKind::Say, "text") => "●",
        (MessageKind::Say, _) => "○",
    }
}

/// Display text. command_output asks show the command, its output and exit
/// code; everything else shows `text` as-is.
pub fn body(message: &ChatMessage) -> String {
    if message.subtype != COMMAND_OUTPUT {
        return message.text.clone();
    }
    let Some(payload) = message.command_payload() else {
        return message.text.clone();
    };
    let mut out = format!("$ {}", payload.command);
    if !payload.output.is_empty() {
        out.push('\n');
        out.push_str(payload.output.trim_end());
    }
    if let Some(code) = payload.exit_code {
        out.push_str(&format!("\n[exit {code}]"));
    }
    out
}

/// Glyph and body, continuation lines indented under the glyph.
pub fn render_message(message: &ChatMessage) -> String {
    let body = body(message);
    let mut lines = body.lines();
    let first = lines.next().unwrap_or("");
    let mut out = format!("{} {first}", glyph(message));
    for line in lines {
        out.push_str("\n  ");
        out.push_str(line);
    }
    if message.partial {
        out.push_str(" ▍");
    }
    out
}

/// One terminal row: glyph plus the first body line, cut to `width` columns.
pub fn render_line(message: &ChatMessage, width: usize) -> String {
    let body = body(message);
    let first = body.lines().next().unwrap_or("");
    truncate_to_width(&format!("{} {first}", glyph(message)), width)
}

pub fn render_transcript(messages: &[ChatMessage], width: usize) -> String {
    messages
        .iter()
        .map(|m| render_line(m, width))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_to_width(s: &str, width: usize) -> String {
    if s.width() <= width {
        return s.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let budget = width - 1;
    let mut used = 0;
    let mut out = String::new();
    for ch in s.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push('…');
    out
}

// ── Follow mode ───────────────────────────────────────────────────────────────

/// Tracks what has been printed so `follow` only emits settled messages that
/// are new or changed since the last call.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    printed: HashMap<i64, String>,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, messages: &[ChatMessage]) -> Vec<String> {
        let mut out = Vec::new();
        for message in messages.iter().filter(|m| !m.partial) {
            let rendered = render_message(message);
            if self.printed.get(&message.ts) == Some(&rendered) {
                continue;
            }
            self.printed.insert(message.ts, rendered.clone());
            out.push(rendered);
        }
        out
    }
}
