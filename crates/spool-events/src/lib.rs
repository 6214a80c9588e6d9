//! spool-events: consumer-side event fan-out for Spool sessions.
//!
//! One process has ONE inbound stream of session events (the registry's
//! sink). Panes come and go constantly, and installing a native listener
//! per pane would leak a limited resource over a long-lived process. This
//! crate splits the problem in two:
//!
//! - [`EventBus`] — the process-wide event source. Implements
//!   `spool_pty::EventSink`, so it plugs directly into a
//!   `SessionRegistry`.
//! - [`EventRouter`] — per-session and global subscriptions built on top
//!   of exactly one lazily-installed bus listener per event kind.

pub mod bus;
pub mod router;

pub use bus::{EventBus, ListenerId};
pub use router::{EventRouter, Subscription};
