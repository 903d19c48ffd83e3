//! Chat transcript messages as the extension host emits them.
//!
//! The host speaks a loose JSON shape (`type` + an optional `ask`/`say` tag,
//! optional `text`/`partial`/`isAnswered`, plus whatever else it feels like
//! attaching). We parse it once at the boundary into [`ChatMessage`] and keep
//! every unknown field in `metadata` so a message round-trips unchanged.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Subtype tag of the ask that represents a running shell command.
pub const COMMAND_OUTPUT: &str = "command_output";

// ── ChatMessage ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Needs a user decision before the host continues
    Ask,
    /// Narrative / informational
    Say,
}

/// One transcript entry. `ts` is the identity key: two messages with the same
/// `ts` are two versions of the same message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub struct ChatMessage {
    pub ts: i64,
    pub kind: MessageKind,
    /// The `ask` or `say` tag, e.g. "followup", "text", "command_output"
    pub subtype: String,
    pub text: String,
    /// Still being streamed; `false` marks completion
    pub partial: bool,
    pub is_answered: bool,
    /// Fields we don't interpret, preserved verbatim
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    pub fn ask(ts: i64, subtype: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(ts, MessageKind::Ask, subtype, text)
    }

    pub fn say(ts: i64, subtype: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(ts, MessageKind::Say, subtype, text)
    }

    fn new(ts: i64, kind: MessageKind, subtype: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            ts,
            kind,
            subtype: subtype.into(),
            text: text.into(),
            partial: false,
            is_answered: false,
            metadata: Map::new(),
        }
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_answered(mut self, is_answered: bool) -> Self {
        self.is_answered = is_answered;
        self
    }

    pub fn is_ask(&self) -> bool {
        self.kind == MessageKind::Ask
    }

    pub fn is_command_output_ask(&self) -> bool {
        self.is_ask() && self.subtype == COMMAND_OUTPUT
    }

    /// Structured payload of a `command_output` ask. `None` when the text is
    /// not JSON (the host sometimes sends raw output); callers fall through
    /// to their non-matching path.
    pub fn command_payload(&self) -> Option<CommandOutputPayload> {
        if !self.is_command_output_ask() {
            return None;
        }
        serde_json::from_str(&self.text).ok()
    }

    pub fn execution_id(&self) -> Option<String> {
        self.command_payload().and_then(|p| p.execution_id)
    }

    /// True when any field the reconciler arbitrates on differs.
    /// Used to accept equal-length updates that still carry new content.
    pub fn content_changed(&self, other: &ChatMessage) -> bool {
        self.kind != other.kind
            || self.subtype != other.subtype
            || self.text != other.text
            || self.partial != other.partial
            || self.is_answered != other.is_answered
    }
}

// ── Command output payload ────────────────────────────────────────────────────

/// JSON body carried in the `text` of a `command_output` ask.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutputPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl CommandOutputPayload {
    pub fn to_text(&self) -> String {
        // Plain strings and ints only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Wire shape ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    ts: i64,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    say: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_answered: Option<bool>,
    #[serde(flatten)]
    metadata: Map<String, Value>,
}

impl From<WireMessage> for ChatMessage {
    fn from(wire: WireMessage) -> Self {
        let subtype = match wire.kind {
            MessageKind::Ask => wire.ask,
            MessageKind::Say => wire.say,
        };
        Self {
            ts: wire.ts,
            kind: wire.kind,
            subtype: subtype.unwrap_or_default(),
            text: wire.text.unwrap_or_default(),
            partial: wire.partial.unwrap_or(false),
            is_answered: wire.is_answered.unwrap_or(false),
            metadata: wire.metadata,
        }
    }
}

impl From<ChatMessage> for WireMessage {
    fn from(msg: ChatMessage) -> Self {
        let (ask, say) = match msg.kind {
            MessageKind::Ask => (Some(msg.subtype), None),
            MessageKind::Say => (None, Some(msg.subtype)),
        };
        Self {
            ts: msg.ts,
            kind: msg.kind,
            ask,
            say,
            text: (!msg.text.is_empty()).then_some(msg.text),
            partial: msg.partial.then_some(true),
            is_answered: msg.is_answered.then_some(true),
            metadata: msg.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_ask() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "ts": 1000,
            "type": "ask",
            "ask": "followup",
            "text": "Which file?",
            "partial": true,
        }))
        .unwrap();
        assert_eq!(msg.ts, 1000);
        assert_eq!(msg.kind, MessageKind::Ask);
        assert_eq!(msg.subtype, "followup");
        assert_eq!(msg.text, "Which file?");
        assert!(msg.partial);
        assert!(!msg.is_answered);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let msg: ChatMessage = serde_json::from_value(json!({"ts": 5, "type": "say"})).unwrap();
        assert_eq!(msg.subtype, "");
        assert_eq!(msg.text, "");
        assert!(!msg.partial);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let raw = json!({
            "ts": 7,
            "type": "say",
            "say": "api_req_started",
            "text": "{}",
            "conversationHistoryIndex": 3,
            "images": ["a.png"],
        });
        let msg: ChatMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(msg.metadata.get("conversationHistoryIndex"), Some(&json!(3)));
        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_tag_follows_kind() {
        // An `ask` tag on a say message is ignored
        let msg: ChatMessage =
            serde_json::from_value(json!({"ts": 1, "type": "say", "ask": "tool", "say": "text"}))
                .unwrap();
        assert_eq!(msg.subtype, "text");
    }

    #[test]
    fn test_command_payload_parses() {
        let payload = CommandOutputPayload {
            execution_id: Some("e1".to_string()),
            command: "npm test".to_string(),
            output: "ok".to_string(),
            exit_code: None,
        };
        let msg = ChatMessage::ask(1, COMMAND_OUTPUT, payload.to_text());
        assert_eq!(msg.command_payload(), Some(payload));
        assert_eq!(msg.execution_id().as_deref(), Some("e1"));
    }

    #[test]
    fn test_command_payload_malformed_is_none() {
        let msg = ChatMessage::ask(1, COMMAND_OUTPUT, "raw terminal output");
        assert_eq!(msg.command_payload(), None);
        assert_eq!(msg.execution_id(), None);

        // Only command_output asks carry a payload
        let say = ChatMessage::say(2, "text", r#"{"executionId":"e1"}"#);
        assert_eq!(say.execution_id(), None);
    }

    #[test]
    fn test_content_changed() {
        let a = ChatMessage::ask(1, "tool", "abc");
        assert!(!a.content_changed(&a.clone()));
        assert!(a.content_changed(&ChatMessage::ask(1, "tool", "abd")));
        assert!(a.content_changed(&a.clone().with_answered(true)));
        assert!(a.content_changed(&a.clone().with_partial(true)));
    }
}
