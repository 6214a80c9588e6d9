//! Per-pane controller: wires one visible pane to one PTY session.
//!
//! The controller subscribes to the pane's session events, performs the
//! initial size fit before the process is spawned, routes keystrokes
//! through the interception table, scans early output for a failed
//! startup command, and batches output into the rendering surface. Its
//! teardown is the only place the UI side deliberately kills a
//! still-running session.
//!
//! Timer work (resize debounce, escape escalation, the flush pump) runs on
//! the tokio runtime the pane was mounted from; the event callbacks
//! themselves arrive on the registry's emitter threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use spool_events::{EventRouter, Subscription};
use spool_pty::{DataEvent, ExitEvent, SessionRegistry, SessionSpawn, SpawnError};

use crate::batch::{
    BatchMode, IoTelemetry, OutputBatcher, HIDDEN_SCROLLBACK_LINES, VISIBLE_SCROLLBACK_LINES,
};
use crate::fit::{fit_decision, DEFAULT_COLS, DEFAULT_ROWS, RESIZE_DEBOUNCE};
use crate::keymap::{
    self, AssistantKind, Key, KeyAction, Modifiers, PaneTarget, ESCAPE_ESCALATION_DELAY,
};
use crate::retry::StartupRetry;
use crate::strip::strip_control_sequences;

/// Delay before typing a corrected startup command, letting the failed CLI
/// finish printing and hand the prompt back to the shell.
const RETRY_TYPE_DELAY: Duration = Duration::from_millis(300);
const FLUSH_INTERVAL: Duration = Duration::from_millis(16);

/// The rendering surface a pane writes into. Rendering itself (glyphs,
/// scrollback storage) lives outside this crate.
pub trait RenderSurface: Send + Sync + 'static {
    /// Write a chunk of terminal output. Always valid UTF-8; never splits
    /// a multi-byte character.
    fn write_chunk(&self, text: &str);
    /// Adjust the retained scrollback target.
    fn set_scrollback_lines(&self, lines: usize);
    /// Enable or defer expensive secondary processing such as link
    /// detection.
    fn set_link_detection(&self, enabled: bool);
    /// The session ended; the surface keeps the last output on screen and
    /// appends a notice.
    fn show_exit_notice(&self, exit_code: i32);
}

/// The assistant-session tracker the host supplies. Decides whether a pane
/// talks to an assistant CLI (Escape/newline handling) and whether that
/// assistant is mid-generation (escalation).
pub trait AssistantTracker: Send + Sync + 'static {
    fn assistant_kind(&self, session_id: &str) -> Option<AssistantKind>;
    fn is_generating(&self, session_id: &str) -> bool;
}

/// Pane-relevant settings from the host's settings store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneSettings {
    pub batching: BatchMode,
    pub telemetry: bool,
}

/// Everything the pane needs to create its session.
#[derive(Debug, Clone, Default)]
pub struct PaneSpawn {
    pub session_id: String,
    pub cwd: String,
    /// Empty resolves to the user's default shell.
    pub shell: String,
    /// Measured surface size; 0x0 falls back to 80x24 so the process
    /// never starts with nonsense dimensions.
    pub cols: u16,
    pub rows: u16,
    pub startup_command: Option<String>,
}

struct PaneState {
    batcher: OutputBatcher,
    retry: StartupRetry,
}

struct PaneShared {
    session_id: String,
    registry: Arc<SessionRegistry>,
    surface: Arc<dyn RenderSurface>,
    tracker: Arc<dyn AssistantTracker>,
    state: Mutex<PaneState>,
    exited: AtomicBool,
    fit_generation: AtomicU64,
    runtime: Handle,
}

impl PaneShared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PaneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_data(&self, event: &DataEvent) {
        let (flushed, corrected) = {
            let mut state = self.lock_state();
            let flushed = state.batcher.push(&event.bytes);
            let corrected = if state.retry.armed() {
                let stripped = strip_control_sequences(&event.bytes);
                state.retry.observe(&stripped)
            } else {
                None
            };
            (flushed, corrected)
        };

        if let Some(text) = flushed {
            self.surface.write_chunk(&text);
        }
        if let Some(command) = corrected {
            self.type_corrected_command(command);
        }
    }

    fn on_exit(&self, event: &ExitEvent) {
        self.exited.store(true, Ordering::SeqCst);
        let flushed = {
            let mut state = self.lock_state();
            state.retry.disarm();
            state.batcher.drain()
        };
        if let Some(text) = flushed {
            self.surface.write_chunk(&text);
        }
        self.surface.show_exit_notice(event.exit_code);
    }

    /// Type the rewritten startup command after the failing CLI has had a
    /// moment to exit back to the shell prompt.
    fn type_corrected_command(&self, command: String) {
        log::debug!(
            "session {}: startup command failed, retrying as `{command}`",
            self.session_id
        );
        let registry = Arc::clone(&self.registry);
        let session_id = self.session_id.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(RETRY_TYPE_DELAY).await;
            let keystrokes = format!("{command}\n");
            if !registry.write(&session_id, keystrokes.as_bytes()) {
                log::debug!("session {session_id}: gone before the corrected command was typed");
            }
        });
    }

    fn arm_escalation(&self) {
        let registry = Arc::clone(&self.registry);
        let tracker = Arc::clone(&self.tracker);
        let session_id = self.session_id.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(ESCAPE_ESCALATION_DELAY).await;
            if tracker.is_generating(&session_id) {
                log::debug!("session {session_id}: escape ignored while generating, interrupting");
                registry.signal_foreground(&session_id);
            }
        });
    }
}

/// One mounted pane. Dropping it without [`PaneController::unmount`]
/// cancels the subscriptions but leaves the session running; unmount is
/// the deliberate teardown path.
pub struct PaneController {
    shared: Arc<PaneShared>,
    subscriptions: Vec<Subscription>,
    flush_stop: mpsc::Sender<()>,
}

impl PaneController {
    /// Mount a pane: subscribe to its session's events, fit the initial
    /// size, create the session, and start the flush pump.
    ///
    /// Must be called from within a tokio runtime; the controller captures
    /// the handle for its timer work.
    pub fn mount(
        registry: Arc<SessionRegistry>,
        router: &Arc<EventRouter>,
        surface: Arc<dyn RenderSurface>,
        tracker: Arc<dyn AssistantTracker>,
        settings: PaneSettings,
        spawn: PaneSpawn,
    ) -> Result<Self, SpawnError> {
        // Fit before creation so the process starts at the measured size
        // instead of a guess. An unmeasurable surface gets the default.
        let (cols, rows) =
            fit_decision(true, spawn.cols, spawn.rows).unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));

        let shared = Arc::new(PaneShared {
            session_id: spawn.session_id.clone(),
            registry: Arc::clone(&registry),
            surface,
            tracker,
            state: Mutex::new(PaneState {
                batcher: OutputBatcher::new(settings.batching, settings.telemetry),
                retry: StartupRetry::new(spawn.startup_command.as_deref()),
            }),
            exited: AtomicBool::new(false),
            fit_generation: AtomicU64::new(0),
            runtime: Handle::current(),
        });

        // Subscriptions first: output from a fast-starting process must
        // have somewhere to land.
        let data_shared = Arc::clone(&shared);
        let data_sub = router.subscribe_data(&spawn.session_id, move |event| {
            data_shared.on_data(event);
        });
        let exit_shared = Arc::clone(&shared);
        let exit_sub = router.subscribe_exit(&spawn.session_id, move |event| {
            exit_shared.on_exit(event);
        });

        let (flush_stop, flush_rx) = mpsc::channel::<()>(1);
        start_flush_pump(Arc::clone(&shared), flush_rx);

        registry.create(SessionSpawn {
            id: spawn.session_id,
            cwd: spawn.cwd,
            shell: spawn.shell,
            cols,
            rows,
            startup_command: spawn.startup_command,
        })?;

        Ok(Self {
            shared,
            subscriptions: vec![data_sub, exit_sub],
            flush_stop,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Whether the pane observed its session's exit event.
    pub fn exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    /// Offer a key press to the interception table. Returns true when the
    /// key was consumed and the surface's default must be suppressed.
    pub fn handle_key(&self, key: Key, mods: Modifiers) -> bool {
        let target = match self.shared.tracker.assistant_kind(&self.shared.session_id) {
            Some(kind) => PaneTarget::Assistant(kind),
            None => PaneTarget::Shell,
        };
        match keymap::intercept(key, mods, target) {
            KeyAction::Pass => false,
            KeyAction::Forward(bytes) => {
                self.write_input(bytes);
                true
            }
            KeyAction::ForwardAndEscalate(bytes) => {
                self.write_input(bytes);
                self.shared.arm_escalation();
                true
            }
        }
    }

    /// Route ordinary typed input to the session. Returns false once the
    /// pane has exited or the session is gone.
    pub fn write_input(&self, bytes: &[u8]) -> bool {
        if self.exited() {
            return false;
        }
        self.shared.lock_state().batcher.record_input();
        self.shared.registry.write(&self.shared.session_id, bytes)
    }

    /// Feed an observed size change (container resize, visibility change,
    /// active-pane switch). Debounced; untrusted sizes are dropped.
    pub fn observe_resize(&self, visible: bool, cols: u16, rows: u16) {
        let Some((cols, rows)) = fit_decision(visible, cols, rows) else {
            return;
        };
        // Each observation starts a fresh debounce window; only the latest
        // one survives to push its size.
        let generation = self.shared.fit_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(async move {
            tokio::time::sleep(RESIZE_DEBOUNCE).await;
            if shared.fit_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if shared.exited.load(Ordering::SeqCst) {
                return;
            }
            shared.registry.resize(&shared.session_id, cols, rows);
        });
    }

    /// The pane became (in)visible: flip batching and relax or restore
    /// the surface's secondary work.
    pub fn set_pane_visible(&self, visible: bool) {
        self.shared.lock_state().batcher.set_pane_visible(visible);
        if visible {
            self.shared
                .surface
                .set_scrollback_lines(VISIBLE_SCROLLBACK_LINES);
            self.shared.surface.set_link_detection(true);
        } else {
            self.shared
                .surface
                .set_scrollback_lines(HIDDEN_SCROLLBACK_LINES);
            self.shared.surface.set_link_detection(false);
        }
    }

    /// The application window was hidden or shown.
    pub fn set_window_visible(&self, visible: bool) {
        self.shared.lock_state().batcher.set_window_visible(visible);
    }

    pub fn telemetry(&self) -> IoTelemetry {
        self.shared.lock_state().batcher.telemetry()
    }

    /// Tear the pane down. The one place the UI side kills a session that
    /// is still running; a session whose exit was already observed is left
    /// alone (it is gone from the registry anyway).
    pub fn unmount(self) {
        for subscription in &self.subscriptions {
            subscription.cancel();
        }
        let _ = self.flush_stop.try_send(());
        if !self.shared.exited.load(Ordering::SeqCst) {
            self.shared.registry.kill(&self.shared.session_id);
        }
    }
}

/// Drain the batcher on a fixed cadence: while batching, this is the only
/// path to the surface (one concatenated write per tick instead of one per
/// data event); otherwise it just sweeps up held-over partial characters.
fn start_flush_pump(shared: Arc<PaneShared>, mut stop_rx: mpsc::Receiver<()>) {
    let runtime = shared.runtime.clone();
    runtime.spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.recv() => return,
            }

            let flushed = shared.lock_state().batcher.drain();
            if let Some(text) = flushed {
                shared.surface.write_chunk(&text);
            }
        }
    });
}
