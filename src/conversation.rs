//! API conversation history: the turns persisted and sent upstream.
//!
//! Every user turn goes through the tool-pairing validator on the way in, so
//! the stored history always satisfies "each tool_use has exactly one
//! tool_result in the next user turn".
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnostics::DiagnosticSink;
use crate::tool_pairing;

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ApiMessage {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Block view; plain text has no blocks.
    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// Owned blocks; plain text becomes a single text block (empty text none).
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) if text.is_empty() => Vec::new(),
            MessageContent::Text(text) => vec![ContentBlock::Text { text }],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// tool_use ids in block order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// tool_result ids in block order, duplicates included.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Blocks(blocks)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// String or block array, passed through untouched
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        source: Value,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        ContentBlock::ToolUse { id: id.into(), name: name.into(), input }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<Value>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: None,
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }
}

// ── History ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiHistory {
    messages: Vec<ApiMessage>,
}

impl ApiHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from raw turns, validating every user turn against
    /// what precedes it.
    pub fn repair(turns: Vec<ApiMessage>, sink: &dyn DiagnosticSink) -> Self {
        let mut history = Self::new();
        for turn in turns {
            match turn.role {
                Role::User => history.push_user_turn(turn, sink),
                Role::Assistant => history.push_assistant(turn),
            }
        }
        history
    }

    pub fn messages(&self) -> &[ApiMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<ApiMessage> {
        self.messages
    }

    pub fn push_assistant(&mut self, turn: ApiMessage) {
        self.messages.push(ApiMessage { role: Role::Assistant, ..turn });
    }

    /// Validate `turn` against the preceding assistant turn, then store it.
    pub fn push_user_turn(&mut self, turn: ApiMessage, sink: &dyn DiagnosticSink) {
        let repaired = tool_pairing::validate(turn, &self.messages, sink);
        self.messages.push(ApiMessage { role: Role::User, ..repaired });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::RecordingSink;
    use serde_json::json;

    #[test]
    fn test_block_wire_shapes() {
        let blocks: Vec<ContentBlock> = serde_json::from_value(json!([
            {"type": "text", "text": "running"},
            {"type": "tool_use", "id": "tool-1", "name": "bash", "input": {"cmd": "ls"}},
            {"type": "tool_result", "tool_use_id": "tool-1", "content": "a.rs"},
        ]))
        .unwrap();
        assert_eq!(blocks[1], ContentBlock::tool_use("tool-1", "bash", json!({"cmd": "ls"})));
        assert_eq!(blocks[2], ContentBlock::tool_result("tool-1", "a.rs"));

        let back = serde_json::to_value(&blocks[2]).unwrap();
        assert_eq!(back, json!({"type": "tool_result", "tool_use_id": "tool-1", "content": "a.rs"}));
    }

    #[test]
    fn test_content_untagged() {
        let text: ApiMessage = serde_json::from_value(json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(text.content, MessageContent::Text("hi".to_string()));
        assert!(text.content.blocks().is_empty());

        let blocks: ApiMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": [{"type": "tool_use", "id": "a", "name": "x", "input": {}},
                        {"type": "tool_use", "id": "b", "name": "y", "input": {}}]
        }))
        .unwrap();
        assert_eq!(blocks.role, Role::Assistant);
        assert_eq!(blocks.content.tool_use_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_into_blocks() {
        assert!(MessageContent::from("").into_blocks().is_empty());
        assert_eq!(MessageContent::from("x").into_blocks(), vec![ContentBlock::text("x")]);
    }

    #[test]
    fn test_push_user_turn_repairs() {
        let sink = RecordingSink::default();
        let mut history = ApiHistory::new();
        history.push_user_turn(ApiMessage::user("list files"), &sink);
        history.push_assistant(ApiMessage::assistant(vec![
            ContentBlock::tool_use("tool-1", "bash", json!({})),
        ]));
        history.push_user_turn(
            ApiMessage::user(vec![ContentBlock::tool_result("bogus", "a.rs")]),
            &sink,
        );

        assert_eq!(history.len(), 3);
        assert_eq!(history.messages()[2].content.tool_result_ids(), vec!["tool-1"]);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_repair_whole_history() {
        let sink = RecordingSink::default();
        let turns = vec![
            ApiMessage::user("go"),
            ApiMessage::assistant(vec![
                ContentBlock::tool_use("a", "read", json!({})),
                ContentBlock::tool_use("b", "read", json!({})),
            ]),
            ApiMessage::user(vec![ContentBlock::tool_result("a", "ok")]),
            ApiMessage::assistant("done"),
        ];
        let history = ApiHistory::repair(turns, &sink);
        let repaired = &history.messages()[2];
        assert_eq!(repaired.content.tool_result_ids(), vec!["b", "a"]);
        assert_eq!(history.messages()[3], ApiMessage::assistant("done"));

        let json = serde_json::to_value(&history).unwrap();
        assert!(json.is_array());
    }
}
