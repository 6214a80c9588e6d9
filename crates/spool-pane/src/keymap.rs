//! Control-key interception table.
//!
//! Some keys must bypass the rendering surface's built-in handling and
//! reach the process as raw bytes: the surface's defaults (clearing a
//! selection on Escape, copying on Ctrl+C while text is selected,
//! submitting on Enter) conflict with interactive terminal programs. The
//! whole policy is this one pure function over (key, modifiers, target),
//! so it is testable without any UI library in sight.

use std::time::Duration;

/// How long after a doubled Escape to wait before force-interrupting an
/// assistant that is still generating.
pub const ESCAPE_ESCALATION_DELAY: Duration = Duration::from_millis(400);

/// The assistant CLI families a pane can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantKind {
    Claude,
    Codex,
}

/// What kind of program the pane is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneTarget {
    Shell,
    Assistant(AssistantKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    Enter,
    Char(char),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        ctrl: false,
        alt: false,
        shift: false,
        meta: false,
    };
    pub const CTRL: Modifiers = Modifiers {
        ctrl: true,
        alt: false,
        shift: false,
        meta: false,
    };
    pub const SHIFT: Modifiers = Modifiers {
        ctrl: false,
        alt: false,
        shift: true,
        meta: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Write these bytes to the process; suppress the surface's default.
    Forward(&'static [u8]),
    /// Forward the bytes and arm the escalation timer
    /// ([`ESCAPE_ESCALATION_DELAY`]).
    ForwardAndEscalate(&'static [u8]),
    /// Let the rendering surface handle the key.
    Pass,
}

/// Decide what to do with a key press before the surface sees it.
pub fn intercept(key: Key, mods: Modifiers, target: PaneTarget) -> KeyAction {
    match (key, target) {
        // A lone Escape must reach the process immediately instead of
        // clearing the surface's selection. Assistants get it doubled,
        // which disambiguates it from the start of an escape sequence
        // faster than the surface's own timeout, and arms escalation.
        (Key::Escape, PaneTarget::Assistant(_)) if mods == Modifiers::NONE => {
            KeyAction::ForwardAndEscalate(b"\x1b\x1b")
        }
        (Key::Escape, PaneTarget::Shell) if mods == Modifiers::NONE => KeyAction::Forward(b"\x1b"),

        // Plain Ctrl+C always interrupts, even while a selection would
        // normally turn it into a copy.
        (Key::Char('c'), _) if mods == Modifiers::CTRL => KeyAction::Forward(b"\x03"),

        // Shift+Enter inserts a newline instead of submitting the line.
        // The claude CLI takes a bare line feed; codex expects it wrapped
        // in a bracketed paste.
        (Key::Enter, PaneTarget::Assistant(AssistantKind::Claude)) if mods == Modifiers::SHIFT => {
            KeyAction::Forward(b"\n")
        }
        (Key::Enter, PaneTarget::Assistant(AssistantKind::Codex)) if mods == Modifiers::SHIFT => {
            KeyAction::Forward(b"\x1b[200~\n\x1b[201~")
        }

        _ => KeyAction::Pass,
    }
}
