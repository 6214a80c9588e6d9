//! Event payloads crossing the IPC boundary, and the sink they flow through.

use serde::{Deserialize, Serialize};

/// A chunk of raw session output.
///
/// Chunks are not aligned to lines or to complete multi-byte characters;
/// consumers that need valid UTF-8 must carry partial sequences across
/// chunk boundaries themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEvent {
    pub session_id: String,
    pub bytes: Vec<u8>,
}

/// Emitted exactly once per session, after its last data event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitEvent {
    pub session_id: String,
    pub exit_code: i32,
    pub signal: Option<i32>,
}

/// Edge-triggered output activity: `active` flips to `true` on the first
/// output after a quiet period and back to `false` once the session has
/// been silent past the quiet threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub session_id: String,
    pub active: bool,
}

/// Process-wide outlet for session events.
///
/// The registry calls these from per-session background threads, so
/// implementations must tolerate concurrent emission. Implemented by the
/// host's event bridge or by `spool-events`' `EventBus`.
pub trait EventSink: Send + Sync + 'static {
    fn emit_data(&self, event: DataEvent);
    fn emit_exit(&self, event: ExitEvent);
    fn emit_activity(&self, event: ActivityEvent);
}
