//! spool-pty: PTY session lifecycle and I/O pipeline for Spool.
//!
//! This crate owns the operating-system side of a terminal pane: it spawns
//! shell processes attached to pseudo-terminals, keeps a registry of live
//! sessions, and streams their output as events while accepting keystrokes
//! back.
//!
//! # Architecture
//!
//! - [`pty`] — Low-level PTY allocation and process spawning.
//! - [`SessionRegistry`] — The only place sessions are created or destroyed.
//!   Each session gets a dedicated blocking reader thread and a coalescing
//!   emitter thread, so a slow process never stalls another session.
//! - [`EventSink`] — The process-wide outlet the registry emits into. The
//!   host's event bridge (or `spool-events`' bus) implements it.

pub mod events;
pub mod pty;
pub mod registry;

pub use events::{ActivityEvent, DataEvent, EventSink, ExitEvent};
pub use pty::{default_shell, SpawnError};
pub use registry::{SessionRegistry, SessionSpawn};
