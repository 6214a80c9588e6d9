//! Low-level PTY allocation and process spawning.
//!
//! Spawns a shell attached to a fresh master/slave pair and hands the
//! registry everything it needs to run the session: the master (for
//! resize), the child (for kill/wait), a writer, and a reader the caller
//! moves onto a dedicated thread.

use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// Errors surfaced synchronously by session creation.
///
/// Everything past a successful spawn is best-effort: stale-session
/// operations report a delivered-boolean, never an error.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to allocate PTY: {0}")]
    OpenPty(String),
    #[error("failed to spawn `{shell}`: {reason}")]
    Spawn { shell: String, reason: String },
    #[error("failed to set up PTY I/O: {0}")]
    Io(String),
}

/// A freshly spawned PTY process, before registration.
pub struct PtyProcess {
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub writer: Box<dyn Write + Send>,
    pub reader: Box<dyn Read + Send>,
}

/// Open a PTY of the given dimensions and spawn `shell` in it.
///
/// An empty shell resolves to the user's default shell. The working
/// directory and environment come from [`build_command`].
pub fn open(shell: &str, cwd: &str, cols: u16, rows: u16) -> Result<PtyProcess, SpawnError> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

    let shell_path = if shell.is_empty() {
        default_shell()
    } else {
        shell.to_string()
    };

    let cmd = build_command(&shell_path, cwd);

    let child = pair.slave.spawn_command(cmd).map_err(|e| SpawnError::Spawn {
        shell: shell_path,
        reason: e.to_string(),
    })?;

    // The slave fd is the child's side; holding it open would keep the
    // master's reader from seeing EOF when the child exits.
    drop(pair.slave);

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SpawnError::Io(e.to_string()))?;

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SpawnError::Io(e.to_string()))?;

    Ok(PtyProcess {
        master: pair.master,
        child,
        writer,
        reader,
    })
}

/// Build the shell invocation: login shell on unix, caller's working
/// directory, and an environment the spawned tools expect.
fn build_command(shell_path: &str, cwd: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(shell_path);
    #[cfg(unix)]
    cmd.arg("-l");
    cmd.cwd(cwd);

    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    #[cfg(unix)]
    {
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        if let Ok(user) = std::env::var("USER") {
            cmd.env("USER", user);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        cmd.env(
            "LANG",
            std::env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string()),
        );
    }
    #[cfg(windows)]
    {
        for key in ["USERPROFILE", "USERNAME", "APPDATA", "LOCALAPPDATA", "SystemRoot"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
    }
    cmd
}

/// The user's default shell for this platform.
pub fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/zsh".to_string())
    }
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "powershell.exe".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_returns_nonempty() {
        assert!(!default_shell().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn default_shell_unix_is_a_path() {
        let shell = default_shell();
        assert!(
            shell.starts_with('/') || shell.contains("sh"),
            "unexpected unix shell: {shell}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn open_spawns_a_live_shell() {
        let cwd = std::env::temp_dir();
        let pty = open("/bin/sh", cwd.to_str().unwrap(), 80, 24);
        assert!(pty.is_ok(), "failed to open PTY: {:?}", pty.err());
        let mut pty = pty.unwrap();
        assert!(pty.child.try_wait().unwrap().is_none());
        let _ = pty.child.kill();
    }

    #[cfg(unix)]
    #[test]
    fn open_reports_missing_shell() {
        let cwd = std::env::temp_dir();
        let result = open("/definitely/not/a/shell", cwd.to_str().unwrap(), 80, 24);
        assert!(matches!(result, Err(SpawnError::Spawn { .. })));
    }
}
