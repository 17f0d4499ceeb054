//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ctower_session::CommandKind;

#[derive(Parser, Debug)]
#[command(name = "ctower")]
#[command(about = "Persistent terminal tabs per project", long_about = None)]
#[command(version)]
pub struct Args {
    /// Project directory. Defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// Database file. Defaults to ~/.ctower/ctower.db.
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Shell for new sessions. Defaults to $SHELL.
    #[arg(long, value_name = "PATH")]
    pub shell: Option<String>,

    /// Never wrap sessions in tmux.
    #[arg(long)]
    pub no_tmux: bool,

    /// What the first tab runs when the project has none.
    #[arg(long, value_enum, default_value_t = TabKind::Shell)]
    pub kind: TabKind,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the saved terminal sessions as JSON.
    Sessions,
    /// Store a setting, e.g. `terminal_font_size 16`.
    Set { key: String, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TabKind {
    Shell,
    Claude,
    Yolo,
}

impl From<TabKind> for CommandKind {
    fn from(kind: TabKind) -> Self {
        match kind {
            TabKind::Shell => CommandKind::Shell,
            TabKind::Claude => CommandKind::Claude,
            TabKind::Yolo => CommandKind::Yolo,
        }
    }
}
