mod cli;
mod console;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::Parser;
use ctower_pty::{event_channel, PtyHost};
use ctower_session::{EngineConfig, Pane, SessionManager, SqliteRegistry};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    // Logs go to stderr; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => {
            let home = ctower_home().ok_or("could not determine home directory")?;
            std::fs::create_dir_all(&home)?;
            home.join("ctower.db")
        }
    };
    let conn = ctower_db::open(&db_path)?;

    match &args.command {
        Some(Command::Sessions) => return print_sessions(&conn),
        Some(Command::Set { key, value }) => {
            ctower_db::settings::set(&conn, key, value)?;
            return Ok(());
        }
        None => {}
    }

    let mut config = EngineConfig::load(&conn)?;
    if args.no_tmux {
        config.use_tmux = false;
    }

    let project_dir = match &args.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let project_dir = project_dir.canonicalize()?;
    let project_id = project_dir.to_string_lossy().into_owned();

    let (events, event_rx) = event_channel();
    let host = PtyHost::new(args.shell.clone(), config.use_tmux, events);
    let status = host.tmux_status();
    log::info!(
        "tmux available={} enabled={} version={:?}",
        status.available,
        status.enabled,
        status.version
    );

    let provider = Arc::new(host.clone());
    let store = Arc::new(SqliteRegistry::new(Arc::new(Mutex::new(conn))));
    let manager = SessionManager::new(provider.clone(), provider, store, config);
    manager.start_event_pump(event_rx);
    manager.start_autosave();

    let restored = manager.restore().await?;
    log::info!("restored {restored} tabs");
    match manager.reap_orphans().await {
        Ok(killed) if !killed.is_empty() => log::info!("killed orphaned sessions: {killed:?}"),
        Ok(_) => {}
        Err(e) => log::warn!("orphan cleanup failed: {e}"),
    }

    manager.register_project(&project_id, &project_id);
    if !manager.has_terminals(&project_id) {
        manager.add_tab(&project_id, args.kind.into());
    }
    connect_project(&manager, &project_id).await;

    let result = console::run(&manager, &project_id).await;

    manager.shutdown().await;
    let running = host.close_all();
    log::info!("shut down {running} running sessions");
    result
}

/// Bring every tab of the project up. Failures stay on their tab.
async fn connect_project(manager: &SessionManager, project_id: &str) {
    let Some(group) = manager.project_terminals(project_id) else {
        return;
    };
    for tab in &group.tabs {
        let key = tab.key(Pane::Main);
        match manager.connect(&key, false).await {
            Ok(session) => log::info!("{key}: {:?} session {}", session.tier, session.session_id),
            Err(e) => log::warn!("{key}: {e}"),
        }
    }
}

fn print_sessions(conn: &Connection) -> Result<(), Box<dyn Error>> {
    let records = ctower_db::sessions::list_all(conn)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// `~/.ctower`, where the database lives.
fn ctower_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".ctower"))
}
