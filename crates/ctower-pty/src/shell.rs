//! Clean shell launch lines for native and tmux-backed sessions.
//!
//! Shells start without rc files so every tab gets the same predictable
//! environment, with a prompt showing the working directory's name.

use std::path::Path;

use portable_pty::CommandBuilder;

/// Environment applied to every spawned terminal process.
pub const TERMINAL_ENV: [(&str, &str); 3] = [
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("CONTROL_TOWER", "1"),
];

/// Shell family, which decides the flags that skip rc files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellFlavor {
    Zsh,
    Bash,
    Other,
}

impl ShellFlavor {
    pub fn detect(shell: &str) -> Self {
        if shell.ends_with("zsh") {
            ShellFlavor::Zsh
        } else if shell.ends_with("bash") {
            ShellFlavor::Bash
        } else {
            ShellFlavor::Other
        }
    }

    /// Flags that start the shell without user rc files.
    pub fn clean_args(self) -> &'static [&'static str] {
        match self {
            ShellFlavor::Zsh => &["--no-rcs"],
            ShellFlavor::Bash => &["--norc", "--noprofile"],
            ShellFlavor::Other => &[],
        }
    }

    /// `PS1` showing `label` in cyan followed by a blue `$`.
    pub fn prompt(self, label: &str) -> String {
        match self {
            ShellFlavor::Zsh => format!("%F{{cyan}}{label}%f %F{{blue}}$%f "),
            _ => format!("\\[\\033[36m\\]{label}\\[\\033[0m\\] \\[\\033[34m\\]$\\[\\033[0m\\] "),
        }
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Last path component of the working directory, used in the prompt.
fn dir_label(working_dir: &str) -> &str {
    Path::new(working_dir)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(working_dir)
}

/// Single-quote `s` for a POSIX shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Command for a native PTY: the clean shell, or the clean shell running `command`.
pub fn native_command(shell: &str, working_dir: &str, command: Option<&str>) -> CommandBuilder {
    let flavor = ShellFlavor::detect(shell);
    let mut cmd = CommandBuilder::new(shell);
    for arg in flavor.clean_args() {
        cmd.arg(arg);
    }
    if let Some(command) = command {
        cmd.arg("-c");
        cmd.arg(command);
    }
    cmd.cwd(working_dir);
    for (key, value) in TERMINAL_ENV {
        cmd.env(key, value);
    }
    if command.is_none() {
        cmd.env("PS1", flavor.prompt(dir_label(working_dir)));
    }
    cmd
}

/// Shell line handed to `tmux new-session` as the window's initial command.
pub fn tmux_launch_line(shell: &str, working_dir: &str, command: Option<&str>) -> String {
    let flavor = ShellFlavor::detect(shell);
    let mut parts = vec![shell.to_string()];
    parts.extend(flavor.clean_args().iter().map(|a| a.to_string()));

    match command {
        Some(command) => {
            parts.push("-c".to_string());
            parts.push(quote(command));
            parts.join(" ")
        }
        None => {
            let env: Vec<String> = TERMINAL_ENV
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            let prompt = quote(&flavor.prompt(dir_label(working_dir)));
            format!("/usr/bin/env {} PS1={prompt} {}", env.join(" "), parts.join(" "))
        }
    }
}

/// `default-command` for new panes inside an interactive tmux session.
pub fn tmux_default_command(shell: &str) -> String {
    let mut parts = vec![shell];
    parts.extend(ShellFlavor::detect(shell).clean_args());
    parts.join(" ")
}
