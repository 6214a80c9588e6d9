//! Resize-fit policy: which observed sizes may reach the process.
//!
//! Hidden surfaces report nonsense (0x0 during tab switches, stale sizes
//! mid-animation), and a bad size overwriting a good one garbles every
//! full-screen program in the pane. So the policy is strict: only a
//! visible pane with positive dimensions gets through, and the controller
//! debounces bursts before pushing the survivor.

use std::time::Duration;

/// Quiet window before a re-fit is pushed to the session.
pub const RESIZE_DEBOUNCE: Duration = Duration::from_millis(50);

/// Fallback dimensions when a pane must be created before its surface has
/// reported a trustworthy size.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Returns the size to push, or `None` when the observation is untrusted.
pub fn fit_decision(visible: bool, cols: u16, rows: u16) -> Option<(u16, u16)> {
    if !visible || cols == 0 || rows == 0 {
        None
    } else {
        Some((cols, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_positive_size_passes() {
        assert_eq!(fit_decision(true, 120, 40), Some((120, 40)));
    }

    #[test]
    fn hidden_pane_is_rejected() {
        assert_eq!(fit_decision(false, 120, 40), None);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        assert_eq!(fit_decision(true, 0, 40), None);
        assert_eq!(fit_decision(true, 120, 0), None);
        assert_eq!(fit_decision(true, 0, 0), None);
    }
}
