use std::sync::{Arc, Mutex};
use std::time::Duration;

use ctower_pty::{event_channel, PtyHost};
use ctower_session::{
    CommandKind, ConnectTier, EngineConfig, EngineError, Pane, PersistKey, SessionManager,
    SqliteRegistry,
};

fn engine(db: &std::path::Path) -> (SessionManager, PtyHost) {
    let conn = ctower_db::open(db).unwrap();
    let config = EngineConfig {
        use_tmux: false,
        ..EngineConfig::load(&conn).unwrap()
    };
    let (tx, rx) = event_channel();
    let host = PtyHost::with_tmux(Some("/bin/sh".to_string()), None, false, tx);
    let store = Arc::new(SqliteRegistry::new(Arc::new(Mutex::new(conn))));
    let provider = Arc::new(host.clone());
    let manager = SessionManager::new(provider.clone(), provider, store, config);
    manager.start_event_pump(rx);
    (manager, host)
}

async fn wait_for_text(manager: &SessionManager, key: &PersistKey, needle: &str) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if manager
            .buffer_text(key)
            .is_some_and(|text| text.contains(needle))
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_tabs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ctower.db");
    let project_dir = dir.path().to_string_lossy().into_owned();

    let (manager, host) = engine(&db);
    manager.restore().await.unwrap();
    manager.register_project("proj", &project_dir);
    let shell = manager.add_tab("proj", CommandKind::Shell);
    manager.rename_tab("proj", &shell.id, "build").unwrap();
    manager.add_tab("proj", CommandKind::Claude);

    let key = shell.key(Pane::Main);
    let session = manager.connect(&key, false).await.unwrap();
    assert_eq!(session.tier, ConnectTier::Fresh);
    manager.send_input(&key, b"echo restart-marker\n").await.unwrap();
    assert!(wait_for_text(&manager, &key, "restart-marker").await);

    manager.shutdown().await;
    assert_eq!(host.close_all(), 1);
    drop(manager);

    let (restored, host) = engine(&db);
    assert_eq!(restored.restore().await.unwrap(), 2);
    assert!(matches!(
        restored.restore().await.unwrap_err(),
        EngineError::AlreadyRestored
    ));

    let group = restored.project_terminals("proj").unwrap();
    let labels: Vec<&str> = group.tabs.iter().map(|t| t.label.as_str()).collect();
    assert_eq!(labels, vec!["build", "Claude"]);
    assert_eq!(group.tabs[1].kind, CommandKind::Claude);
    assert_eq!(group.active_tab_id.as_deref(), Some(group.tabs[0].id.as_str()));
    assert!(group.tabs.iter().all(|t| t.session_id.is_none()));
    assert_ne!(group.tabs[0].id, shell.id);

    // The restored tab gets a new shell with an empty buffer.
    let key = group.tabs[0].key(Pane::Main);
    let session = restored.connect(&key, false).await.unwrap();
    assert_eq!(session.tier, ConnectTier::Fresh);
    restored.send_input(&key, b"echo second-run\n").await.unwrap();
    assert!(wait_for_text(&restored, &key, "second-run").await);
    assert!(!restored.buffer_text(&key).unwrap().contains("restart-marker"));

    restored.close_tab("proj", &group.tabs[0].id).await.unwrap();
    assert_eq!(host.active_count(), 0);
    restored.shutdown().await;
}
