//! Runner for the `tmux` CLI backing durable sessions.

use std::process::Command;

use ctower_vt::TermSize;
use portable_pty::CommandBuilder;

use crate::provider::DurableSessionInfo;
use crate::pty::PtyError;
use crate::shell::TERMINAL_ENV;

/// Prefix of every tmux session owned by Control Tower.
pub const DURABLE_PREFIX: &str = "ct-";

/// Scrollback kept inside each tmux session.
const HISTORY_LIMIT: &str = "50000";

const LIST_FORMAT: &str = "#{session_name}\t#{session_path}\t#{session_created}";

/// Durable session name for a provider session id: `ct-` plus its first 8 chars.
pub fn durable_name_for(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(8).collect();
    format!("{DURABLE_PREFIX}{prefix}")
}

/// A detected tmux installation.
#[derive(Clone, Debug)]
pub struct Tmux {
    program: String,
    version: String,
}

impl Tmux {
    /// Detect tmux on `PATH` via `tmux -V`.
    pub fn detect() -> Option<Self> {
        Self::detect_program("tmux")
    }

    pub fn detect_program(program: &str) -> Option<Self> {
        let output = Command::new(program).arg("-V").output().ok()?;
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8(output.stdout).ok()?.trim().to_string();
        Some(Self {
            program: program.to_string(),
            version,
        })
    }

    /// Version string reported by `tmux -V`.
    pub fn version(&self) -> &str {
        &self.version
    }

    fn run(&self, args: &[&str]) -> Result<String, PtyError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| PtyError::Tmux(format!("failed to run tmux: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PtyError::Tmux(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create a detached session running `launch_line` in `working_dir`.
    pub fn new_session(
        &self,
        name: &str,
        working_dir: &str,
        size: TermSize,
        launch_line: &str,
    ) -> Result<(), PtyError> {
        let cols = size.cols.to_string();
        let rows = size.rows.to_string();
        self.run(&[
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            working_dir,
            "-x",
            &cols,
            "-y",
            &rows,
            launch_line,
        ])?;
        Ok(())
    }

    /// Apply session options. Failures are logged and ignored.
    pub fn configure(&self, name: &str, default_command: Option<&str>) {
        let mut options: Vec<Vec<&str>> = vec![
            vec!["set-option", "-t", name, "status", "off"],
            vec!["set-option", "-t", name, "-g", "mouse", "on"],
            vec!["set-option", "-t", name, "history-limit", HISTORY_LIMIT],
        ];
        if let Some(command) = default_command {
            options.push(vec!["set-option", "-t", name, "default-command", command]);
        }
        for args in options {
            if let Err(e) = self.run(&args) {
                log::warn!("tmux {} on {name} failed: {e}", args[args.len() - 2]);
            }
        }
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.run(&["has-session", "-t", name]).is_ok()
    }

    /// Resize the session's window. Failures are logged and ignored.
    pub fn resize_window(&self, name: &str, size: TermSize) {
        let cols = size.cols.to_string();
        let rows = size.rows.to_string();
        if let Err(e) = self.run(&["resize-window", "-t", name, "-x", &cols, "-y", &rows]) {
            log::debug!("tmux resize-window {name} failed: {e}");
        }
    }

    pub fn kill_session(&self, name: &str) -> Result<(), PtyError> {
        self.run(&["kill-session", "-t", name])?;
        Ok(())
    }

    /// All live `ct-*` sessions. An unreachable tmux server yields an empty list.
    pub fn list_sessions(&self) -> Vec<DurableSessionInfo> {
        match self.run(&["list-sessions", "-F", LIST_FORMAT]) {
            Ok(stdout) => parse_list_output(&stdout),
            Err(_) => Vec::new(),
        }
    }

    /// Command that attaches a client to `name` inside a PTY.
    pub fn attach_command(&self, name: &str, working_dir: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.arg("attach-session");
        cmd.arg("-t");
        cmd.arg(name);
        cmd.cwd(working_dir);
        for (key, value) in TERMINAL_ENV {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Parse `list-sessions -F` output, keeping only `ct-` sessions.
pub(crate) fn parse_list_output(stdout: &str) -> Vec<DurableSessionInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let name = parts.next()?;
            if !name.starts_with(DURABLE_PREFIX) {
                return None;
            }
            Some(DurableSessionInfo {
                name: name.to_string(),
                working_directory: parts.next().unwrap_or_default().to_string(),
                created_at: parts.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}
