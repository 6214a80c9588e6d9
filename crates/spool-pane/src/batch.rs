//! Output batching between the session event stream and the rendering
//! surface.
//!
//! A build tool scrolling thousands of lines can produce far more data
//! events than the surface can absorb as individual writes. The batcher
//! accumulates chunks and hands the flush pump one concatenated write per
//! tick. Byte order is preserved exactly, and a multi-byte character split
//! across chunk boundaries is held back until its remaining bytes arrive
//! rather than emitted broken.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// When batching applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// Coalesce at all times.
    Always,
    /// Coalesce only while the pane is not the visible/focused one, or
    /// the window itself is hidden.
    #[default]
    Auto,
}

/// Scrollback targets handed to the surface as visibility changes.
pub const VISIBLE_SCROLLBACK_LINES: usize = 10_000;
pub const HIDDEN_SCROLLBACK_LINES: usize = 1_000;

/// Running I/O counters. Observational only; nothing reads these to make
/// decisions.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IoTelemetry {
    pub output_events: u64,
    pub output_bytes: u64,
    pub flush_count: u64,
    pub flushed_bytes: u64,
    pub avg_flush_cost_us: u64,
    pub input_events: u64,
    pub input_to_first_output_ms: Option<u64>,
    pub max_queued_bytes: u64,
}

#[derive(Debug, Default)]
struct TelemetryRecorder {
    enabled: bool,
    counters: IoTelemetry,
    flush_cost_total_us: u64,
    awaiting_output_since: Option<Instant>,
}

impl TelemetryRecorder {
    fn record_output(&mut self, len: usize) {
        if !self.enabled {
            return;
        }
        self.counters.output_events += 1;
        self.counters.output_bytes += len as u64;
        if let Some(since) = self.awaiting_output_since.take() {
            self.counters.input_to_first_output_ms = Some(since.elapsed().as_millis() as u64);
        }
    }

    fn record_queued(&mut self, queued: usize) {
        if self.enabled {
            self.counters.max_queued_bytes = self.counters.max_queued_bytes.max(queued as u64);
        }
    }

    fn record_flush(&mut self, len: usize, cost: Duration) {
        if !self.enabled {
            return;
        }
        self.counters.flush_count += 1;
        self.counters.flushed_bytes += len as u64;
        self.flush_cost_total_us += cost.as_micros() as u64;
        self.counters.avg_flush_cost_us = self.flush_cost_total_us / self.counters.flush_count;
    }

    fn record_input(&mut self) {
        if !self.enabled {
            return;
        }
        self.counters.input_events += 1;
        if self.awaiting_output_since.is_none() {
            self.awaiting_output_since = Some(Instant::now());
        }
    }
}

/// Accumulates session output per pane and decides when it goes through
/// immediately versus waiting for the flush pump.
#[derive(Debug)]
pub struct OutputBatcher {
    mode: BatchMode,
    pane_visible: bool,
    window_visible: bool,
    pending: Vec<u8>,
    telemetry: TelemetryRecorder,
}

impl OutputBatcher {
    pub fn new(mode: BatchMode, telemetry: bool) -> Self {
        Self {
            mode,
            pane_visible: true,
            window_visible: true,
            pending: Vec::new(),
            telemetry: TelemetryRecorder {
                enabled: telemetry,
                ..TelemetryRecorder::default()
            },
        }
    }

    /// Whether output is currently being coalesced instead of written
    /// through per event.
    pub fn batching(&self) -> bool {
        match self.mode {
            BatchMode::Always => true,
            BatchMode::Auto => !self.pane_visible || !self.window_visible,
        }
    }

    pub fn set_pane_visible(&mut self, visible: bool) {
        self.pane_visible = visible;
    }

    pub fn set_window_visible(&mut self, visible: bool) {
        self.window_visible = visible;
    }

    /// Ingest a data chunk. Returns text to write through right now when
    /// batching is off; while batching, the flush pump picks it up via
    /// [`OutputBatcher::drain`].
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.telemetry.record_output(bytes.len());
        self.pending.extend_from_slice(bytes);
        self.telemetry.record_queued(self.pending.len());
        if self.batching() {
            None
        } else {
            self.take_decoded()
        }
    }

    /// Flush whatever is decodable. A partial multi-byte tail stays queued
    /// for the next call.
    pub fn drain(&mut self) -> Option<String> {
        self.take_decoded()
    }

    pub fn record_input(&mut self) {
        self.telemetry.record_input();
    }

    pub fn telemetry(&self) -> IoTelemetry {
        self.telemetry.counters.clone()
    }

    fn take_decoded(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let started = Instant::now();
        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // Everything up to valid_up_to has just been validated.
                    text.push_str(unsafe { std::str::from_utf8_unchecked(valid) });
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete tail: a character still mid-flight.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        if text.is_empty() {
            return None;
        }
        self.telemetry.record_flush(text.len(), started.elapsed());
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_when_not_batching() {
        let mut batcher = OutputBatcher::new(BatchMode::Auto, false);
        assert_eq!(batcher.push(b"hello").as_deref(), Some("hello"));
    }

    #[test]
    fn auto_mode_batches_while_pane_hidden() {
        let mut batcher = OutputBatcher::new(BatchMode::Auto, false);
        batcher.set_pane_visible(false);
        assert!(batcher.batching());

        assert_eq!(batcher.push(b"one "), None);
        assert_eq!(batcher.push(b"two"), None);
        assert_eq!(batcher.drain().as_deref(), Some("one two"));
        assert_eq!(batcher.drain(), None);
    }

    #[test]
    fn auto_mode_batches_while_window_hidden() {
        let mut batcher = OutputBatcher::new(BatchMode::Auto, false);
        batcher.set_window_visible(false);
        assert!(batcher.batching());
        batcher.set_window_visible(true);
        assert!(!batcher.batching());
    }

    #[test]
    fn always_mode_batches_even_when_visible() {
        let mut batcher = OutputBatcher::new(BatchMode::Always, false);
        assert_eq!(batcher.push(b"x"), None);
        assert_eq!(batcher.drain().as_deref(), Some("x"));
    }

    #[test]
    fn flushes_concatenate_to_the_exact_byte_sequence() {
        let mut batcher = OutputBatcher::new(BatchMode::Always, false);
        let input = "léger ☃ São Paulo 終了\n";
        let bytes = input.as_bytes();

        let mut flushed = String::new();
        // Feed one byte at a time: every multi-byte character gets split.
        for (i, b) in bytes.iter().enumerate() {
            batcher.push(&[*b]);
            if i % 3 == 0 {
                if let Some(text) = batcher.drain() {
                    flushed.push_str(&text);
                }
            }
        }
        if let Some(text) = batcher.drain() {
            flushed.push_str(&text);
        }

        assert_eq!(flushed, input);
    }

    #[test]
    fn split_multibyte_char_is_held_over() {
        let mut batcher = OutputBatcher::new(BatchMode::Always, false);
        let snowman = "☃".as_bytes(); // 3 bytes

        batcher.push(&snowman[..1]);
        assert_eq!(batcher.drain(), None);
        batcher.push(&snowman[1..]);
        assert_eq!(batcher.drain().as_deref(), Some("☃"));
    }

    #[test]
    fn invalid_bytes_become_replacement_chars() {
        let mut batcher = OutputBatcher::new(BatchMode::Always, false);
        batcher.push(&[b'a', 0xFF, b'b']);
        assert_eq!(batcher.drain().as_deref(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn telemetry_counts_events_and_flushes() {
        let mut batcher = OutputBatcher::new(BatchMode::Always, true);
        batcher.record_input();
        batcher.push(b"abcd");
        batcher.push(b"ef");
        let _ = batcher.drain();

        let telemetry = batcher.telemetry();
        assert_eq!(telemetry.output_events, 2);
        assert_eq!(telemetry.output_bytes, 6);
        assert_eq!(telemetry.flush_count, 1);
        assert_eq!(telemetry.flushed_bytes, 6);
        assert_eq!(telemetry.input_events, 1);
        assert!(telemetry.input_to_first_output_ms.is_some());
        assert_eq!(telemetry.max_queued_bytes, 6);
    }

    #[test]
    fn telemetry_disabled_counts_nothing() {
        let mut batcher = OutputBatcher::new(BatchMode::Always, false);
        batcher.push(b"abcd");
        let _ = batcher.drain();
        let telemetry = batcher.telemetry();
        assert_eq!(telemetry.output_events, 0);
        assert_eq!(telemetry.flush_count, 0);
    }

    #[test]
    fn batch_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&BatchMode::Auto).unwrap(), "\"auto\"");
        let mode: BatchMode = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(mode, BatchMode::Always);
    }
}
