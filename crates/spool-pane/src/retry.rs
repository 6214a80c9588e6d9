//! Startup-command failure detection and one-shot retry.
//!
//! Resuming an assistant session can fail without the shell exiting: the
//! CLI prints a complaint and hands the prompt back. The only signal is
//! the wording of that complaint, so while a resume-style startup command
//! is pending we buffer a little early output (stripped of control
//! sequences) and scan it for known failure phrases. On a match the
//! command is rewritten and retried, once.

/// Cap on buffered early output. A failure complaint lands well inside
/// this; anything longer means the command is running normally.
pub const EARLY_OUTPUT_CAP: usize = 2048;

/// The phrases assistant CLIs print when a session-targeted start fails.
///
/// Pure string heuristics against third-party output; the wording WILL
/// drift with CLI releases, which is why it lives behind this type and
/// the state machine never sees it.
#[derive(Debug, Clone)]
pub struct FailurePatterns {
    phrases: Vec<String>,
}

impl FailurePatterns {
    /// The stock phrase set: a resume pointed at a session the CLI cannot
    /// find, and a pinned session id that is already taken.
    pub fn default_set() -> Self {
        Self::new(["no conversation found with session id", "already in use"])
    }

    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .collect(),
        }
    }

    pub fn matches(&self, stripped: &str) -> bool {
        let haystack = stripped.to_lowercase();
        self.phrases.iter().any(|p| haystack.contains(p.as_str()))
    }
}

/// Rewrite a failed session-targeted command into its counterpart.
///
/// - `claude --resume <id>` → `claude` (fresh session)
/// - `claude --session-id <id>` → `claude --resume <id>` (the pinned id
///   exists already, so attach to it)
/// - `codex resume <id>` → `codex`
///
/// Returns `None` when the command has no session-targeted form to
/// rewrite.
pub fn corrected_command(command: &str) -> Option<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();

    if let Some(pos) = tokens.iter().position(|t| *t == "--resume") {
        let mut rewritten = tokens.clone();
        rewritten.remove(pos);
        if rewritten.get(pos).is_some_and(|t| !t.starts_with('-')) {
            rewritten.remove(pos);
        }
        return Some(rewritten.join(" "));
    }

    if let Some(pos) = tokens.iter().position(|t| *t == "--session-id") {
        let mut rewritten = tokens.clone();
        rewritten[pos] = "--resume";
        return Some(rewritten.join(" "));
    }

    // Subcommand form: `codex resume <id>`.
    if tokens.len() >= 2 && tokens[1] == "resume" {
        let mut rewritten = vec![tokens[0]];
        let rest = if tokens.get(2).is_some_and(|t| !t.starts_with('-')) {
            &tokens[3..]
        } else {
            &tokens[2..]
        };
        rewritten.extend_from_slice(rest);
        return Some(rewritten.join(" "));
    }

    None
}

fn is_session_targeted(command: &str) -> bool {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    tokens.iter().any(|t| *t == "--resume" || *t == "--session-id")
        || tokens.get(1).is_some_and(|t| *t == "resume")
}

/// Per-pane retry state. Armed only while a session-targeted startup
/// command is pending; fires at most once for the pane's lifetime.
#[derive(Debug)]
pub struct StartupRetry {
    pending: Option<String>,
    buffer: String,
    fired: bool,
    patterns: FailurePatterns,
}

impl StartupRetry {
    pub fn new(startup_command: Option<&str>) -> Self {
        Self::with_patterns(startup_command, FailurePatterns::default_set())
    }

    pub fn with_patterns(startup_command: Option<&str>, patterns: FailurePatterns) -> Self {
        let pending = startup_command
            .filter(|cmd| is_session_targeted(cmd))
            .map(str::to_string);
        Self {
            pending,
            buffer: String::new(),
            fired: false,
            patterns,
        }
    }

    /// Whether early output still needs scanning.
    pub fn armed(&self) -> bool {
        self.pending.is_some() && !self.fired
    }

    /// Stop watching (the session exited, or the pane is going away).
    pub fn disarm(&mut self) {
        self.pending = None;
        self.buffer.clear();
    }

    /// Feed a chunk of stripped early output. Returns the corrected
    /// command to type, at most once ever.
    pub fn observe(&mut self, stripped: &str) -> Option<String> {
        if !self.armed() {
            return None;
        }

        for ch in stripped.chars() {
            if self.buffer.len() + ch.len_utf8() > EARLY_OUTPUT_CAP {
                break;
            }
            self.buffer.push(ch);
        }

        if self.patterns.matches(&self.buffer) {
            self.fired = true;
            let corrected = self.pending.take().and_then(|cmd| corrected_command(&cmd));
            self.buffer.clear();
            return corrected;
        }

        // The window filled with unremarkable output; the command is
        // evidently running.
        if self.buffer.len() >= EARLY_OUTPUT_CAP {
            self.disarm();
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_flag_is_dropped() {
        assert_eq!(
            corrected_command("claude --resume 123e4567").as_deref(),
            Some("claude")
        );
        assert_eq!(
            corrected_command("claude --resume 123e4567 --model opus").as_deref(),
            Some("claude --model opus")
        );
    }

    #[test]
    fn pinned_session_id_becomes_resume() {
        assert_eq!(
            corrected_command("claude --session-id 123e4567").as_deref(),
            Some("claude --resume 123e4567")
        );
    }

    #[test]
    fn codex_resume_subcommand_is_dropped() {
        assert_eq!(
            corrected_command("codex resume 123e4567").as_deref(),
            Some("codex")
        );
    }

    #[test]
    fn plain_commands_have_no_correction() {
        assert_eq!(corrected_command("claude"), None);
        assert_eq!(corrected_command("htop"), None);
    }

    #[test]
    fn retry_fires_once_on_failure_phrase() {
        let mut retry = StartupRetry::new(Some("claude --resume abc"));
        assert!(retry.armed());

        let corrected = retry.observe("No conversation found with session ID: abc");
        assert_eq!(corrected.as_deref(), Some("claude"));

        // The CLI echoes the same complaint again; nothing fires.
        assert_eq!(retry.observe("No conversation found with session ID: abc"), None);
        assert!(!retry.armed());
    }

    #[test]
    fn phrase_split_across_chunks_still_matches() {
        let mut retry = StartupRetry::new(Some("claude --resume abc"));
        assert_eq!(retry.observe("No conversation found "), None);
        let corrected = retry.observe("with session ID: abc");
        assert_eq!(corrected.as_deref(), Some("claude"));
    }

    #[test]
    fn already_in_use_rewrites_pinned_id() {
        let mut retry = StartupRetry::new(Some("claude --session-id abc"));
        let corrected = retry.observe("Error: session abc is already in use");
        assert_eq!(corrected.as_deref(), Some("claude --resume abc"));
    }

    #[test]
    fn plain_startup_command_never_arms() {
        let mut retry = StartupRetry::new(Some("npm run dev"));
        assert!(!retry.armed());
        assert_eq!(retry.observe("no conversation found with session id"), None);
    }

    #[test]
    fn no_startup_command_never_arms() {
        let mut retry = StartupRetry::new(None);
        assert!(!retry.armed());
    }

    #[test]
    fn cap_disarms_without_a_match() {
        let mut retry = StartupRetry::new(Some("claude --resume abc"));
        let filler = "x".repeat(EARLY_OUTPUT_CAP);
        assert_eq!(retry.observe(&filler), None);
        assert!(!retry.armed());
        // Even the failure phrase no longer triggers anything.
        assert_eq!(retry.observe("no conversation found with session id"), None);
    }

    #[test]
    fn custom_patterns_are_honored() {
        let patterns = FailurePatterns::new(["session vanished"]);
        let mut retry = StartupRetry::with_patterns(Some("claude --resume abc"), patterns);
        assert_eq!(retry.observe("no conversation found with session id"), None);
        let corrected = retry.observe("SESSION VANISHED");
        assert_eq!(corrected.as_deref(), Some("claude"));
    }

    #[test]
    fn disarm_clears_state() {
        let mut retry = StartupRetry::new(Some("claude --resume abc"));
        retry.disarm();
        assert!(!retry.armed());
        assert_eq!(retry.observe("no conversation found with session id"), None);
    }
}
