//! spool-pane: per-pane logic between the session registry and the
//! rendering surface.
//!
//! A pane is one visible terminal surface bound to one session. This crate
//! owns everything the pane decides on its own:
//!
//! - [`keymap`] — which keys bypass the surface and go straight to the
//!   process, as an explicit table.
//! - [`retry`] — startup-command failure detection over early output, with
//!   a bounded at-most-once automatic retry.
//! - [`fit`] — when an observed size is trustworthy enough to push to the
//!   process.
//! - [`batch`] — output coalescing and visibility-driven backpressure,
//!   with optional telemetry counters.
//! - [`controller`] — the state machine tying those to a live session.

pub mod batch;
pub mod controller;
pub mod fit;
pub mod keymap;
pub mod retry;
pub mod strip;

pub use batch::{BatchMode, IoTelemetry, OutputBatcher};
pub use controller::{AssistantTracker, PaneController, PaneSettings, PaneSpawn, RenderSurface};
pub use keymap::{AssistantKind, Key, KeyAction, Modifiers, PaneTarget};
pub use retry::{FailurePatterns, StartupRetry};
