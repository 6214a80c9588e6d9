//! Session registry: owns every live PTY session and its I/O threads.
//!
//! Locking comes in two granularities that are never nested across I/O:
//! the outer map lock is held only for insert/remove/lookup, and each
//! session has its own mutex around writer/master/child. The PTY reader is
//! owned by the session's reader thread directly, never behind a lock, so
//! blocking reads cannot stall writes, resizes, or registry bookkeeping.
//! Every lock acquisition recovers from poisoning by taking the lock's
//! last contents; a panic elsewhere must not turn into a permanent outage
//! for unrelated sessions.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc::{RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use portable_pty::{Child, MasterPty, PtySize};

use crate::events::{ActivityEvent, DataEvent, EventSink, ExitEvent};
use crate::pty::{self, SpawnError};

const READ_BUFFER_SIZE: usize = 32 * 1024;
const DATA_CHANNEL_CAPACITY: usize = 256;
const STARTUP_COMMAND_DELAY: Duration = Duration::from_millis(300);
/// A session with no output for this long is considered quiet.
const QUIET_THRESHOLD: Duration = Duration::from_millis(1000);
/// Emits spaced closer than this are a fast stream worth coalescing.
const FAST_EMIT_THRESHOLD: Duration = Duration::from_millis(8);
const COALESCE_YIELD: Duration = Duration::from_millis(2);

/// Parameters for [`SessionRegistry::create`].
#[derive(Debug, Clone, Default)]
pub struct SessionSpawn {
    /// Caller-supplied id, unique per pane.
    pub id: String,
    pub cwd: String,
    /// Empty resolves to the user's default shell.
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Typed into the shell as keystrokes after a short delay, never passed
    /// as an argument, so a failing CLI leaves the shell alive for recovery.
    pub startup_command: Option<String>,
}

struct Session {
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<Mutex<Session>>>>>;

#[derive(Clone, Copy)]
enum ActivityPulse {
    Output,
    Quiet,
    Closed,
}

/// Pure transition for the per-session activity tracker: returns the next
/// active flag and the event to emit, if the edge changed.
fn next_activity_state(
    session_id: &str,
    active: bool,
    pulse: ActivityPulse,
) -> (bool, Option<ActivityEvent>) {
    match (active, pulse) {
        (false, ActivityPulse::Output) => (
            true,
            Some(ActivityEvent {
                session_id: session_id.to_string(),
                active: true,
            }),
        ),
        (true, ActivityPulse::Quiet) | (true, ActivityPulse::Closed) => (
            false,
            Some(ActivityEvent {
                session_id: session_id.to_string(),
                active: false,
            }),
        ),
        _ => (active, None),
    }
}

/// Push a chunk to the emitter. Falls back to a blocking send when the
/// channel is full: under sustained load the reader slows down rather than
/// dropping output.
fn send_chunk(tx: &SyncSender<Vec<u8>>, chunk: Vec<u8>) -> bool {
    match tx.try_send(chunk) {
        Ok(()) => true,
        Err(TrySendError::Full(chunk)) => tx.send(chunk).is_ok(),
        Err(TrySendError::Disconnected(_)) => false,
    }
}

#[cfg(unix)]
fn interrupt_foreground(session: &Session) -> bool {
    let pgid = session
        .master
        .process_group_leader()
        .or_else(|| session.child.process_id().map(|pid| pid as libc::pid_t));
    match pgid {
        Some(pid) if pid > 0 => unsafe { libc::kill(-pid, libc::SIGINT) == 0 },
        _ => false,
    }
}

#[cfg(windows)]
fn interrupt_foreground(_session: &Session) -> bool {
    // ConPTY has no process groups; the 0x03 byte written via `write` is
    // the interrupt channel on this platform.
    true
}

/// Owns the map from session id to live PTY handle. The only place
/// sessions are created or destroyed.
pub struct SessionRegistry {
    sessions: SessionMap,
    sink: Arc<dyn EventSink>,
}

impl SessionRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Clone a session handle out of the map. Holds the map lock only for
    /// the lookup.
    fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    fn remove(sessions: &SessionMap, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Spawn a session and register its I/O threads.
    ///
    /// On success the session is in the map and its reader is running; the
    /// startup command, if any, is typed into the shell ~300ms later. Spawn
    /// failures are the only error this registry ever returns.
    pub fn create(&self, spawn: SessionSpawn) -> Result<(), SpawnError> {
        let SessionSpawn {
            id,
            cwd,
            shell,
            cols,
            rows,
            startup_command,
        } = spawn;

        let pty = pty::open(&shell, &cwd, cols, rows)?;
        let reader = pty.reader;

        let session = Arc::new(Mutex::new(Session {
            writer: pty.writer,
            master: pty.master,
            child: pty.child,
        }));

        // Register before the threads start so events can never outrun the
        // map entry.
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::clone(&session));

        // Per-session output pipeline:
        //   reader  — drains the PTY as fast as possible, no sleeps
        //   emitter — coalesces whatever queued up and emits at a
        //             controlled rate, then owns end-of-life cleanup
        // The bounded channel between them means a stalled emitter slows
        // the reader instead of growing an unbounded queue.
        let (data_tx, data_rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(DATA_CHANNEL_CAPACITY);
        let (activity_tx, activity_rx) = std::sync::mpsc::channel::<()>();

        self.spawn_activity_thread(&id, activity_rx);
        spawn_reader_thread(&id, reader, data_tx);
        self.spawn_emitter_thread(&id, data_rx, activity_tx, Arc::clone(&session));

        if let Some(command) = startup_command {
            let session = Arc::clone(&session);
            let sid = id.clone();
            std::thread::Builder::new()
                .name(format!("pty-startup-{id}"))
                .spawn(move || {
                    std::thread::sleep(STARTUP_COMMAND_DELAY);
                    let mut sess = session.lock().unwrap_or_else(|e| e.into_inner());
                    let keystrokes = format!("{command}\n");
                    let delivered = sess
                        .writer
                        .write_all(keystrokes.as_bytes())
                        .and_then(|()| sess.writer.flush());
                    if delivered.is_err() {
                        log::debug!("session {sid}: shell closed before startup command was typed");
                    }
                })
                .expect("failed to spawn startup-command thread");
        }

        Ok(())
    }

    fn spawn_activity_thread(&self, id: &str, activity_rx: std::sync::mpsc::Receiver<()>) {
        let sink = Arc::clone(&self.sink);
        let sid = id.to_string();
        std::thread::Builder::new()
            .name(format!("pty-activity-{id}"))
            .spawn(move || {
                let mut active = false;
                loop {
                    let pulse = match activity_rx.recv_timeout(QUIET_THRESHOLD) {
                        Ok(()) => ActivityPulse::Output,
                        Err(RecvTimeoutError::Timeout) => ActivityPulse::Quiet,
                        Err(RecvTimeoutError::Disconnected) => ActivityPulse::Closed,
                    };

                    let (next_active, event) = next_activity_state(&sid, active, pulse);
                    if let Some(event) = event {
                        sink.emit_activity(event);
                    }
                    active = next_active;

                    if matches!(pulse, ActivityPulse::Closed) {
                        break;
                    }
                }
            })
            .expect("failed to spawn activity thread");
    }

    fn spawn_emitter_thread(
        &self,
        id: &str,
        data_rx: std::sync::mpsc::Receiver<Vec<u8>>,
        activity_tx: std::sync::mpsc::Sender<()>,
        session: Arc<Mutex<Session>>,
    ) {
        let sink = Arc::clone(&self.sink);
        let sessions = Arc::clone(&self.sessions);
        let sid = id.to_string();

        std::thread::Builder::new()
            .name(format!("pty-emit-{id}"))
            .spawn(move || {
                let mut batch: Vec<u8> = Vec::new();
                let mut last_emit = Instant::now();

                loop {
                    // Block until the reader pushes data or closes the channel.
                    match data_rx.recv() {
                        Ok(chunk) => batch.extend_from_slice(&chunk),
                        Err(_) => break,
                    }

                    // Drain everything already queued.
                    while let Ok(chunk) = data_rx.try_recv() {
                        batch.extend_from_slice(&chunk);
                    }

                    // A fast stream gets a brief yield so more accumulates
                    // into one event.
                    if last_emit.elapsed() < FAST_EMIT_THRESHOLD {
                        std::thread::sleep(COALESCE_YIELD);
                        while let Ok(chunk) = data_rx.try_recv() {
                            batch.extend_from_slice(&chunk);
                        }
                    }

                    if !batch.is_empty() {
                        let _ = activity_tx.send(());
                        sink.emit_data(DataEvent {
                            session_id: sid.clone(),
                            bytes: std::mem::take(&mut batch),
                        });
                        last_emit = Instant::now();
                    }
                }

                // Reader hit EOF. Flush the stragglers.
                while let Ok(chunk) = data_rx.try_recv() {
                    batch.extend_from_slice(&chunk);
                }
                if !batch.is_empty() {
                    let _ = activity_tx.send(());
                    sink.emit_data(DataEvent {
                        session_id: sid.clone(),
                        bytes: batch,
                    });
                }

                // Remove the entry before emitting exit: a caller reacting
                // to exit must already see write/resize report undelivered.
                Self::remove(&sessions, &sid);

                let exit_code = session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .child
                    .wait()
                    .map(|status| status.exit_code() as i32)
                    .unwrap_or(-1);

                sink.emit_exit(ExitEvent {
                    session_id: sid,
                    exit_code,
                    signal: None,
                });
                // Dropping activity_tx here ends the activity thread.
            })
            .expect("failed to spawn emitter thread");
    }

    /// Write keystrokes to a session. Flushes immediately so single-byte
    /// control sequences are never coalesced or delayed.
    ///
    /// Returns false when the session is gone or the PTY rejects the write;
    /// a user closing a pane races natural exit by design, so this is not
    /// an error.
    pub fn write(&self, session_id: &str, bytes: &[u8]) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let mut sess = session.lock().unwrap_or_else(|e| e.into_inner());
        let result = sess
            .writer
            .write_all(bytes)
            .and_then(|()| sess.writer.flush());
        if let Err(e) = &result {
            log::debug!("session {session_id}: write after PTY closed: {e}");
        }
        result.is_ok()
    }

    /// Resize the session's PTY. Non-positive dimensions are ignored: a
    /// hidden surface can report 0x0 and that must never reach the process.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        if cols == 0 || rows == 0 {
            return true;
        }
        let sess = session.lock().unwrap_or_else(|e| e.into_inner());
        sess.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .is_ok()
    }

    /// Deliver SIGINT to the session's foreground process group,
    /// independent of writing the interrupt byte to the PTY.
    pub fn signal_foreground(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let sess = session.lock().unwrap_or_else(|e| e.into_inner());
        interrupt_foreground(&sess)
    }

    /// Kill a session's process. Idempotent: a session that already exited
    /// (or never existed) is a no-op.
    ///
    /// The map entry is NOT removed here. Process death surfaces on the
    /// reader as EOF, and the emitter thread then removes the entry and
    /// emits the one exit event, the same path a natural exit takes.
    pub fn kill(&self, session_id: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let mut sess = session.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = sess.child.kill() {
            log::debug!("session {session_id}: kill on exited child: {e}");
        }
    }
}

fn spawn_reader_thread(id: &str, mut reader: Box<dyn Read + Send>, data_tx: SyncSender<Vec<u8>>) {
    std::thread::Builder::new()
        .name(format!("pty-read-{id}"))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !send_chunk(&data_tx, buf[..n].to_vec()) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("failed to spawn reader thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Debug)]
    enum SinkEvent {
        Data(DataEvent),
        Exit(ExitEvent),
        Activity(ActivityEvent),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SinkEvent>>,
    }

    impl RecordingSink {
        fn data_text(&self) -> String {
            let events = self.events.lock().unwrap();
            let bytes: Vec<u8> = events
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::Data(d) => Some(d.bytes.clone()),
                    _ => None,
                })
                .flatten()
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }

        fn exit_events(&self) -> Vec<ExitEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::Exit(x) => Some(x.clone()),
                    _ => None,
                })
                .collect()
        }

        fn exit_follows_all_data(&self) -> bool {
            let events = self.events.lock().unwrap();
            let last_data = events
                .iter()
                .rposition(|e| matches!(e, SinkEvent::Data(_)));
            let first_exit = events.iter().position(|e| matches!(e, SinkEvent::Exit(_)));
            match (last_data, first_exit) {
                (Some(d), Some(x)) => d < x,
                (None, Some(_)) => true,
                _ => false,
            }
        }
    }

    impl EventSink for RecordingSink {
        fn emit_data(&self, event: DataEvent) {
            self.events.lock().unwrap().push(SinkEvent::Data(event));
        }
        fn emit_exit(&self, event: ExitEvent) {
            self.events.lock().unwrap().push(SinkEvent::Exit(event));
        }
        fn emit_activity(&self, event: ActivityEvent) {
            self.events.lock().unwrap().push(SinkEvent::Activity(event));
        }
    }

    fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        pred()
    }

    fn sh_spawn(id: &str) -> SessionSpawn {
        SessionSpawn {
            id: id.to_string(),
            cwd: std::env::temp_dir().to_string_lossy().into_owned(),
            shell: "/bin/sh".to_string(),
            cols: 80,
            rows: 24,
            startup_command: None,
        }
    }

    #[test]
    fn write_to_missing_session_is_undelivered() {
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new(sink);
        assert!(!registry.write("ghost", b"x"));
        assert!(!registry.resize("ghost", 80, 24));
        assert!(!registry.signal_foreground("ghost"));
    }

    #[test]
    fn kill_is_idempotent_for_missing_session() {
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new(sink);
        registry.kill("ghost");
        registry.kill("ghost");
    }

    #[cfg(unix)]
    #[test]
    fn create_write_exit_scenario() {
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new(Arc::clone(&sink) as Arc<dyn EventSink>);

        registry.create(sh_spawn("s1")).unwrap();
        assert!(registry.contains("s1"));

        assert!(registry.write("s1", b"echo hi\n"));
        assert!(
            wait_until(Duration::from_secs(5), || sink.data_text().contains("hi")),
            "expected 'hi' in output, got: {:?}",
            sink.data_text()
        );
        assert!(sink.exit_events().is_empty());

        assert!(registry.write("s1", b"exit\n"));
        assert!(
            wait_until(Duration::from_secs(5), || !sink.exit_events().is_empty()),
            "expected an exit event"
        );

        let exits = sink.exit_events();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].session_id, "s1");
        assert_eq!(exits[0].exit_code, 0);
        assert!(sink.exit_follows_all_data());

        // The emitter removed the entry before emitting exit.
        assert!(!registry.contains("s1"));
        assert!(!registry.write("s1", b"x"));
    }

    #[cfg(unix)]
    #[test]
    fn kill_produces_exactly_one_exit() {
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new(Arc::clone(&sink) as Arc<dyn EventSink>);

        registry.create(sh_spawn("s2")).unwrap();
        registry.kill("s2");
        registry.kill("s2");

        assert!(
            wait_until(Duration::from_secs(5), || !sink.exit_events().is_empty()),
            "expected an exit event after kill"
        );
        // A second kill after removal must also be a no-op.
        assert!(wait_until(Duration::from_secs(5), || !registry.contains("s2")));
        registry.kill("s2");

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(sink.exit_events().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn zero_dimension_resize_is_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new(Arc::clone(&sink) as Arc<dyn EventSink>);

        registry.create(sh_spawn("s3")).unwrap();
        // Session exists, so the call is delivered; the 0x0 never reaches
        // the process.
        assert!(registry.resize("s3", 0, 0));
        assert!(registry.resize("s3", 120, 40));
        registry.kill("s3");
    }

    #[cfg(unix)]
    #[test]
    fn startup_command_is_typed_into_the_shell() {
        let sink = Arc::new(RecordingSink::default());
        let registry = SessionRegistry::new(Arc::clone(&sink) as Arc<dyn EventSink>);

        let mut spawn = sh_spawn("s4");
        spawn.startup_command = Some("echo STARTUP_RAN".to_string());
        registry.create(spawn).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || sink
                .data_text()
                .contains("STARTUP_RAN")),
            "expected startup command output, got: {:?}",
            sink.data_text()
        );
        registry.kill("s4");
    }

    #[test]
    fn activity_goes_active_on_first_output() {
        let (active, event) = next_activity_state("pane-1", false, ActivityPulse::Output);
        assert!(active);
        let event = event.unwrap();
        assert_eq!(event.session_id, "pane-1");
        assert!(event.active);
    }

    #[test]
    fn activity_goes_quiet_after_timeout() {
        let (active, event) = next_activity_state("pane-1", true, ActivityPulse::Quiet);
        assert!(!active);
        assert!(!event.unwrap().active);
    }

    #[test]
    fn activity_noop_when_already_inactive() {
        let (active, event) = next_activity_state("pane-1", false, ActivityPulse::Quiet);
        assert!(!active);
        assert!(event.is_none());
    }

    #[test]
    fn activity_noop_when_already_active() {
        let (active, event) = next_activity_state("pane-1", true, ActivityPulse::Output);
        assert!(active);
        assert!(event.is_none());
    }

    #[test]
    fn activity_goes_inactive_on_close() {
        let (active, event) = next_activity_state("pane-1", true, ActivityPulse::Closed);
        assert!(!active);
        assert!(!event.unwrap().active);
    }

    #[test]
    fn send_chunk_fails_when_receiver_dropped() {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(1);
        drop(rx);
        assert!(!send_chunk(&tx, b"data".to_vec()));
    }

    #[test]
    fn send_chunk_blocks_instead_of_dropping_when_full() {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(1);
        tx.send(b"first".to_vec()).unwrap();

        let sender = tx.clone();
        let handle = std::thread::spawn(move || send_chunk(&sender, b"second".to_vec()));

        assert_eq!(rx.recv().unwrap(), b"first");
        assert!(handle.join().unwrap());
        assert_eq!(rx.recv().unwrap(), b"second");
    }
}
