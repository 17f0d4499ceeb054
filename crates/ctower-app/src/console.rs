//! Line-oriented front end: typed lines go to the active tab, `:` lines
//! drive the engine.

use std::error::Error;

use ctower_session::{CommandKind, EngineError, Pane, PersistKey, SessionManager};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// A line of input for the active tab.
    Input(String),
    New(CommandKind),
    Select(usize),
    Close,
    Split,
    Restart,
    Broadcast,
    Join,
    Show,
    Tabs,
    Font(i64),
    Quit,
}

/// Parse one console line. `::` escapes a literal leading colon.
pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    if let Some(rest) = line.strip_prefix("::") {
        return Ok(ConsoleCommand::Input(format!(":{rest}")));
    }
    let Some(command) = line.strip_prefix(':') else {
        return Ok(ConsoleCommand::Input(line.to_string()));
    };

    let mut words = command.split_whitespace();
    let name = words.next().unwrap_or_default();
    let arg = words.next();
    match name {
        "new" => {
            let kind = match arg {
                None => CommandKind::Shell,
                Some(kind) => CommandKind::parse(kind).ok_or_else(|| format!("unknown tab kind: {kind}"))?,
            };
            Ok(ConsoleCommand::New(kind))
        }
        "tab" => {
            let index = arg
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| "usage: :tab <number>".to_string())?;
            Ok(ConsoleCommand::Select(index - 1))
        }
        "font" => {
            let size = arg
                .and_then(|n| n.parse::<i64>().ok())
                .ok_or_else(|| "usage: :font <size>".to_string())?;
            Ok(ConsoleCommand::Font(size))
        }
        "close" => Ok(ConsoleCommand::Close),
        "split" => Ok(ConsoleCommand::Split),
        "restart" => Ok(ConsoleCommand::Restart),
        "broadcast" => Ok(ConsoleCommand::Broadcast),
        "join" => Ok(ConsoleCommand::Join),
        "show" => Ok(ConsoleCommand::Show),
        "tabs" => Ok(ConsoleCommand::Tabs),
        "quit" | "q" => Ok(ConsoleCommand::Quit),
        other => Err(format!("unknown command: :{other}")),
    }
}

/// Read stdin until EOF, `:quit` or Ctrl-C.
pub async fn run(manager: &SessionManager, project_id: &str) -> Result<(), Box<dyn Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                break;
            }
        };
        let Some(line) = line else { break };

        let command = match parse(&line) {
            Ok(command) => command,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };
        match execute(manager, project_id, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) if e.is_retryable() => eprintln!("{e} ({}); try again or :restart", e.error_code()),
            Err(e) => eprintln!("{e} ({})", e.error_code()),
        }
    }
    Ok(())
}

fn active_key(manager: &SessionManager, project_id: &str) -> Result<PersistKey, EngineError> {
    manager
        .project_terminals(project_id)
        .and_then(|group| group.active_tab().map(|t| t.key(Pane::Main)))
        .ok_or_else(|| EngineError::TabNotFound(format!("{project_id}: no active tab")))
}

/// Run one command. Returns `false` when the console should stop.
async fn execute(
    manager: &SessionManager,
    project_id: &str,
    command: ConsoleCommand,
) -> Result<bool, EngineError> {
    match command {
        ConsoleCommand::Input(mut line) => {
            let key = active_key(manager, project_id)?;
            line.push('\n');
            manager.send_input(&key, line.as_bytes()).await?;
        }
        ConsoleCommand::New(kind) => {
            let tab = manager.add_tab(project_id, kind);
            manager.connect(&tab.key(Pane::Main), false).await?;
            println!("opened {}", tab.label);
        }
        ConsoleCommand::Select(index) => {
            let tab_id = manager
                .project_terminals(project_id)
                .and_then(|group| group.tabs.get(index).map(|t| t.id.clone()))
                .ok_or_else(|| EngineError::TabNotFound(format!("#{}", index + 1)))?;
            manager.set_active_tab(project_id, &tab_id)?;
            manager.connect(&PersistKey::main(project_id, &tab_id), false).await?;
        }
        ConsoleCommand::Close => {
            let key = active_key(manager, project_id)?;
            manager.close_tab(project_id, &key.tab_id).await?;
        }
        ConsoleCommand::Split => {
            let key = active_key(manager, project_id)?;
            if manager.toggle_split(project_id, &key.tab_id).await? {
                manager
                    .connect(&PersistKey::split(project_id, &key.tab_id), false)
                    .await?;
            }
        }
        ConsoleCommand::Restart => {
            let key = active_key(manager, project_id)?;
            manager.restart(&key).await?;
        }
        ConsoleCommand::Broadcast => {
            let enabled = manager.toggle_broadcast_mode();
            println!("broadcast {}", if enabled { "on" } else { "off" });
        }
        ConsoleCommand::Join => {
            let key = active_key(manager, project_id)?;
            let joined = manager.toggle_broadcast_tab(&key.tab_id);
            println!("{} broadcast group", if joined { "joined" } else { "left" });
        }
        ConsoleCommand::Show => {
            let key = active_key(manager, project_id)?;
            if let Some(text) = manager.buffer_text(&key) {
                println!("{}", text.trim_end());
            }
        }
        ConsoleCommand::Tabs => print_tabs(manager, project_id),
        ConsoleCommand::Font(size) => {
            println!("font size {}", manager.set_font_size(size).await);
        }
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

fn print_tabs(manager: &SessionManager, project_id: &str) {
    let Some(group) = manager.project_terminals(project_id) else {
        println!("no tabs");
        return;
    };
    let participants = manager.broadcast_participants();
    for (i, tab) in group.tabs.iter().enumerate() {
        let active = if group.active_tab_id.as_deref() == Some(tab.id.as_str()) { '*' } else { ' ' };
        let broadcast = if participants.contains(&tab.id) { 'B' } else { ' ' };
        let state = manager.connection_state(&tab.key(Pane::Main));
        println!(
            "{active}{broadcast} {}. {} [{}] {state:?}",
            i + 1,
            tab.label,
            tab.kind.as_str()
        );
    }
}
