//! Host channel plumbing.
//!
//!   reader task:  tokio::spawn, parses newline-delimited JSON → HostEvent,
//!                 sends over an UnboundedSender
//!   caller:       `drive` drains the receiver into one ReconciliationState
//!
//! Every event is applied on the caller's task, one at a time, so the state
//! needs no locking. The reader may be stdin, a replay file, or a spawned
//! host process's stdout.
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures_util::{Stream, StreamExt, stream};
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticEvent, DiagnosticKind, DiagnosticSink};
use crate::event::{HostEvent, parse_event};
use crate::state::ReconciliationState;

// ── Parsing stream ────────────────────────────────────────────────────────────

/// Lines from `reader` as host events. Blank lines are skipped; malformed
/// ones are reported to `sink` and skipped. Ends at EOF or on a read error.
pub fn event_stream<R>(reader: R, sink: Arc<dyn DiagnosticSink>) -> impl Stream<Item = HostEvent>
where
    R: AsyncBufRead + Unpin,
{
    stream::unfold((reader.lines(), sink), |(mut lines, sink)| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_event(&line) {
                        Ok(event) => return Some((event, (lines, sink))),
                        Err(e) => sink.report(&DiagnosticEvent::new(
                            DiagnosticKind::MalformedHostEvent,
                            format!("{e:#}"),
                            json!({ "bytes": line.len() }),
                        )),
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "host channel read failed");
                    return None;
                }
            }
        }
    })
}

/// Parse `reader` on a background task. The receiver closes at EOF.
pub fn spawn_reader<R>(reader: R, sink: Arc<dyn DiagnosticSink>) -> mpsc::UnboundedReceiver<HostEvent>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let events = event_stream(reader, sink);
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            if tx.send(event).is_err() {
                break;
            }
        }
        debug!("host channel closed");
    });
    rx
}

// ── Reducer loop ──────────────────────────────────────────────────────────────

/// Apply every event from `events` to `state` until the channel closes.
/// `on_change` runs after each event that changed the transcript.
/// Returns the number of events applied.
pub async fn drive<F>(
    mut events: mpsc::UnboundedReceiver<HostEvent>,
    state: &mut ReconciliationState,
    mut on_change: F,
) -> usize
where
    F: FnMut(&ReconciliationState),
{
    let mut applied = 0;
    while let Some(event) = events.recv().await {
        applied += 1;
        let label = event.label();
        if state.apply_event(event) {
            debug!(event = label, messages = state.messages().len(), "transcript changed");
            on_change(state);
        }
    }
    applied
}

// ── Host process ──────────────────────────────────────────────────────────────

pub struct HostProcess {
    pub child: Child,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
}

/// Spawn the host and read its stdout as the event channel. The host's
/// stderr passes through to ours; it is killed if dropped.
pub fn spawn_host(command: &[String], sink: Arc<dyn DiagnosticSink>) -> Result<HostProcess> {
    let Some((program, args)) = command.split_first() else {
        bail!("Empty host command");
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn host process: {command:?}"))?;
    info!(program = %program, pid = ?child.id(), "host process started");

    let stdout = child.stdout.take().context("host stdout was not captured")?;
    let events = spawn_reader(BufReader::new(stdout), sink);
    Ok(HostProcess { child, events })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{NoopSink, RecordingSink};

    const LOG: &str = concat!(
        r#"{"type":"messageUpdated","chatMessage":{"ts":1000,"type":"say","say":"text","text":"AB","partial":true}}"#,
        "\n\n",
        r#"{"type":"messageUpdated","chatMessage":{"ts":1000,"type":"say","say":"text","text":"ABC","partial":true}}"#,
        "\n",
        r#"{"type":"state","state":{"chatMessages":[{"ts":1000,"type":"say","say":"text","text":"A"}]}}"#,
        "\n",
    );

    #[tokio::test]
    async fn test_event_stream_parses_lines() {
        let events: Vec<HostEvent> = event_stream(LOG.as_bytes(), Arc::new(NoopSink)).collect().await;
        let labels: Vec<&str> = events.iter().map(HostEvent::label).collect();
        assert_eq!(labels, vec!["messageUpdated", "messageUpdated", "state"]);
    }

    #[tokio::test]
    async fn test_malformed_lines_reported_and_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let input = "{oops\n{\"type\":\"theme\"}\n";
        let events: Vec<HostEvent> = event_stream(input.as_bytes(), sink.clone()).collect().await;
        assert_eq!(events, vec![HostEvent::Unknown]);

        let reported = sink.events();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind, DiagnosticKind::MalformedHostEvent);
        assert!(reported[0].message.contains("{oops"));
    }

    #[tokio::test]
    async fn test_drive_reconciles_in_arrival_order() {
        let rx = spawn_reader(LOG.as_bytes(), Arc::new(NoopSink));
        let mut state = ReconciliationState::default();
        let mut changes = 0;
        let applied = drive(rx, &mut state, |_| changes += 1).await;

        assert_eq!(applied, 3);
        // Stale snapshot changes nothing
        assert_eq!(changes, 2);
        assert_eq!(state.messages()[0].text, "ABC");
        assert!(state.messages()[0].partial);
    }

    #[tokio::test]
    async fn test_empty_host_command_rejected() {
        assert!(spawn_host(&[], Arc::new(NoopSink)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_host_reads_stdout() {
        let script = r#"printf '%s\n' '{"type":"messageUpdated","chatMessage":{"ts":5,"type":"say","say":"text","text":"hi"}}'"#;
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let HostProcess { mut child, events } = spawn_host(&command, Arc::new(NoopSink)).unwrap();

        let mut state = ReconciliationState::default();
        drive(events, &mut state, |_| {}).await;
        assert!(child.wait().await.unwrap().success());
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].text, "hi");
    }
}
