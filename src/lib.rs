//! Conversation-state reconciliation for a CLI front-end that mirrors a
//! remote assistant host.
//!
//! The host sends full `state` snapshots and per-message `messageUpdated`
//! deltas with no ordering guarantee while some messages are still streaming.
//! [`ReconciliationState`] folds them into one flicker-free transcript.
//! [`ApiHistory`] keeps the upstream conversation valid by repairing
//! tool_use/tool_result pairing on every user turn.
pub mod bridge;
pub mod command_output;
pub mod config;
pub mod conversation;
pub mod diagnostics;
pub mod event;
pub mod message;
pub mod reconcile;
pub mod render;
pub mod state;
pub mod tool_pairing;
pub mod version;

pub use conversation::{ApiHistory, ApiMessage, ContentBlock, MessageContent, Role};
pub use diagnostics::{DiagnosticEvent, DiagnosticKind, DiagnosticSink};
pub use event::{CommandExecutionStatus, CommandStatus, HostEvent, parse_event};
pub use message::{ChatMessage, MessageKind};
pub use reconcile::ReconcileOptions;
pub use state::ReconciliationState;
