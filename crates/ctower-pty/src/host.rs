//! The concrete PTY provider and tmux bridge.
//!
//! Each session gets a dedicated OS thread for its blocking PTY reads. Every
//! other blocking call (spawning, tmux, writes) runs on tokio's blocking pool
//! so the async callers never stall the event loop.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ctower_vt::TermSize;
use portable_pty::CommandBuilder;
use uuid::Uuid;

use crate::provider::{
    AttachRequest, ConnectRequest, DurableBridge, DurableSessionInfo, EventSender, PtyEvent,
    PtyProvider, ReconnectOutcome, ReconnectRequest, SessionId, SpawnedSession,
};
use crate::pty::{try_wait_child, PtyError, PtyHandle, SharedChild};
use crate::session::{Backend, HostedSession, SessionInfo};
use crate::shell;
use crate::tmux::{durable_name_for, Tmux};

/// How long an EOF'd reader waits for the child's exit status.
const EXIT_STATUS_GRACE: Duration = Duration::from_millis(500);
/// Poll interval of the exit watcher for command sessions.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// tmux availability and preference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TmuxStatus {
    pub available: bool,
    pub version: Option<String>,
    pub enabled: bool,
}

/// Hosts PTY sessions on this machine, optionally inside tmux.
#[derive(Clone)]
pub struct PtyHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    sessions: Mutex<HashMap<SessionId, HostedSession>>,
    shell: String,
    tmux: Option<Tmux>,
    use_tmux: AtomicBool,
    events: EventSender,
}

impl PtyHost {
    /// Create a host, auto-detecting tmux.
    ///
    /// If `shell` is `None`, uses the user's default shell (`$SHELL` or `/bin/sh`).
    pub fn new(shell: Option<String>, use_tmux: bool, events: EventSender) -> Self {
        let tmux = Tmux::detect();
        match &tmux {
            Some(t) => log::info!("tmux detected: {} (use_tmux={use_tmux})", t.version()),
            None => log::info!("tmux not found, using native PTY only"),
        }
        Self::with_tmux(shell, tmux, use_tmux, events)
    }

    pub fn with_tmux(
        shell: Option<String>,
        tmux: Option<Tmux>,
        use_tmux: bool,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                sessions: Mutex::new(HashMap::new()),
                shell: shell.unwrap_or_else(shell::default_shell),
                tmux,
                use_tmux: AtomicBool::new(use_tmux),
                events,
            }),
        }
    }

    /// Update the tmux preference. Affects future connects only.
    pub fn set_use_tmux(&self, enabled: bool) {
        self.inner.use_tmux.store(enabled, Ordering::SeqCst);
        log::info!("tmux preference updated: use_tmux={enabled}");
    }

    pub fn tmux_status(&self) -> TmuxStatus {
        TmuxStatus {
            available: self.inner.tmux.is_some(),
            version: self.inner.tmux.as_ref().map(|t| t.version().to_string()),
            enabled: self.inner.use_tmux.load(Ordering::SeqCst),
        }
    }

    /// All hosted session ids, sorted.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of hosted sessions whose process is still running.
    pub fn active_count(&self) -> usize {
        self.inner
            .sessions()
            .values()
            .filter(|s| s.is_running())
            .count()
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner
            .sessions()
            .get(session_id)
            .map(|s| s.info(session_id))
    }

    /// Shut every session down: native sessions are killed, durable sessions
    /// are detached so tmux keeps them. Returns how many were running.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(SessionId, HostedSession)> = self.inner.sessions().drain().collect();
        let mut running = 0;
        for (session_id, session) in drained {
            session.claim_exit();
            if session.is_running() {
                running += 1;
            }
            session.terminate();
            match session.backend() {
                Backend::Durable { name } => {
                    log::info!("Detached session {session_id} on shutdown ({name} survives)")
                }
                Backend::Native => log::info!("Closed native session {session_id} on shutdown"),
            }
        }
        running
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, PtyError>
    where
        F: FnOnce(&HostInner) -> Result<T, PtyError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| PtyError::TaskFailed(e.to_string()))?
    }
}

impl HostInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, HostedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The tmux runner to use for new sessions, if durable mode is on.
    fn durable_backend(&self) -> Option<&Tmux> {
        if self.use_tmux.load(Ordering::SeqCst) {
            self.tmux.as_ref()
        } else {
            None
        }
    }

    /// Spawn `cmd` on a new PTY and start its I/O thread.
    fn register(
        &self,
        session_id: &str,
        backend: Backend,
        cmd: CommandBuilder,
        working_directory: &str,
        size: TermSize,
        watch_exit: bool,
    ) -> Result<(), PtyError> {
        let mut pty = PtyHandle::spawn(cmd, size)?;
        let reader = pty
            .take_reader()
            .ok_or_else(|| PtyError::SpawnFailed("PTY reader unavailable".to_string()))?;
        let child = pty.child();
        let session = HostedSession::new(backend, pty, working_directory);
        let exit_flag = session.exit_flag();
        self.sessions().insert(session_id.to_string(), session);

        if let Err(e) = start_io_thread(
            session_id,
            reader,
            self.events.clone(),
            Arc::clone(&exit_flag),
            Arc::clone(&child),
        ) {
            if let Some(session) = self.sessions().remove(session_id) {
                session.claim_exit();
                session.terminate();
            }
            return Err(e);
        }

        if watch_exit {
            if let Err(e) = start_exit_watcher(session_id, self.events.clone(), exit_flag, child) {
                log::warn!("no exit watcher for session {session_id}: {e}");
            }
        }
        Ok(())
    }

    fn connect(&self, request: &ConnectRequest) -> Result<SpawnedSession, PtyError> {
        let session_id = Uuid::new_v4().to_string();
        let working_dir = request.working_directory.as_str();
        let command = request.command.as_deref();

        let Some(tmux) = self.durable_backend() else {
            let cmd = shell::native_command(&self.shell, working_dir, command);
            self.register(
                &session_id,
                Backend::Native,
                cmd,
                working_dir,
                request.size,
                command.is_some(),
            )?;
            log::info!("Created native session {session_id} in {working_dir}");
            return Ok(SpawnedSession {
                session_id,
                durable_name: None,
            });
        };

        let name = durable_name_for(&session_id);
        let launch = shell::tmux_launch_line(&self.shell, working_dir, command);
        tmux.new_session(&name, working_dir, request.size, &launch)?;
        let default_command = command
            .is_none()
            .then(|| shell::tmux_default_command(&self.shell));
        tmux.configure(&name, default_command.as_deref());

        let backend = Backend::Durable { name: name.clone() };
        let cmd = tmux.attach_command(&name, working_dir);
        if let Err(e) = self.register(
            &session_id,
            backend,
            cmd,
            working_dir,
            request.size,
            command.is_some(),
        ) {
            if let Err(kill_err) = tmux.kill_session(&name) {
                log::warn!("failed to remove tmux session {name} after attach failure: {kill_err}");
            }
            return Err(e);
        }

        log::info!("Created durable session {session_id} (tmux: {name}) in {working_dir}");
        Ok(SpawnedSession {
            session_id,
            durable_name: Some(name),
        })
    }

    fn attach(&self, request: &AttachRequest) -> Result<Option<SessionId>, PtyError> {
        let tmux = self.tmux.as_ref().ok_or(PtyError::DurableUnavailable)?;
        let name = request.durable_name.as_str();
        if !tmux.has_session(name) {
            log::info!("tmux session {name} no longer exists");
            return Ok(None);
        }
        if !request.size.is_degenerate() {
            tmux.resize_window(name, request.size);
        }

        let session_id = Uuid::new_v4().to_string();
        self.register(
            &session_id,
            Backend::Durable {
                name: name.to_string(),
            },
            tmux.attach_command(name, &request.working_directory),
            &request.working_directory,
            request.size,
            false,
        )?;
        log::info!("Reattached session {session_id} to tmux {name}");
        Ok(Some(session_id))
    }

    fn is_active(&self, session_id: &str) -> bool {
        let durable_name = {
            let sessions = self.sessions();
            let Some(session) = sessions.get(session_id) else {
                return false;
            };
            if !session.is_running() {
                return false;
            }
            session.durable_name().map(str::to_string)
        };
        match durable_name {
            Some(name) => self.tmux.as_ref().is_some_and(|t| t.has_session(&name)),
            None => true,
        }
    }

    fn resize(&self, session_id: &str, size: TermSize) -> Result<(), PtyError> {
        // A hidden container reports tiny sizes. Resizing tmux to 1x1 destroys its layout.
        if size.is_degenerate() {
            return Ok(());
        }
        let durable_name = {
            let sessions = self.sessions();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| PtyError::SessionNotFound(session_id.to_string()))?;
            session.pty().resize(size)?;
            session.durable_name().map(str::to_string)
        };
        if let (Some(name), Some(tmux)) = (durable_name, self.tmux.as_ref()) {
            tmux.resize_window(&name, size);
        }
        Ok(())
    }

    fn write(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| PtyError::SessionNotFound(session_id.to_string()))?;
        session.write(data)
    }

    fn detach(&self, session_id: &str) -> Result<(), PtyError> {
        let session = self
            .sessions()
            .remove(session_id)
            .ok_or_else(|| PtyError::SessionNotFound(session_id.to_string()))?;
        session.claim_exit();
        session.terminate();
        log::info!("Detached session {session_id}");
        Ok(())
    }

    fn close(&self, session_id: &str) -> Result<Option<i32>, PtyError> {
        let session = self
            .sessions()
            .remove(session_id)
            .ok_or_else(|| PtyError::SessionNotFound(session_id.to_string()))?;
        let report_exit = session.claim_exit();

        if let (Some(name), Some(tmux)) = (session.durable_name(), self.tmux.as_ref()) {
            log::info!("Killing tmux session {name} for session {session_id}");
            if let Err(e) = tmux.kill_session(name) {
                log::warn!("failed to kill tmux session {name}: {e}");
            }
        }

        let exit_code = session.terminate();
        if report_exit {
            let _ = self.events.send(PtyEvent::Exit {
                session_id: session_id.to_string(),
                exit_code,
            });
        }
        log::info!("Closed session {session_id}");
        Ok(exit_code)
    }

    fn cleanup_orphaned(&self, known: &[String]) -> Vec<String> {
        let Some(tmux) = self.tmux.as_ref() else {
            return Vec::new();
        };
        let mut killed = Vec::new();
        for session in tmux.list_sessions() {
            if known.contains(&session.name) {
                continue;
            }
            log::info!("Cleaning up orphaned tmux session: {}", session.name);
            match tmux.kill_session(&session.name) {
                Ok(()) => killed.push(session.name),
                Err(e) => log::warn!("failed to kill orphan {}: {e}", session.name),
            }
        }
        killed
    }
}

/// Start the read loop for a session on a dedicated OS thread.
fn start_io_thread(
    session_id: &str,
    reader: Box<dyn Read + Send>,
    events: EventSender,
    exit_flag: Arc<AtomicBool>,
    child: SharedChild,
) -> Result<(), PtyError> {
    let sid = session_id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-io-{session_id}"))
        .spawn(move || io_loop(sid, reader, events, exit_flag, child))?;
    Ok(())
}

fn io_loop(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    events: EventSender,
    exit_flag: Arc<AtomicBool>,
    child: SharedChild,
) {
    let mut buf = [0u8; 65536];
    let mut total = 0usize;

    loop {
        // Blocks until data is available or the PTY closes.
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("PTY {session_id} read error: {e}");
                break;
            }
        };
        if exit_flag.load(Ordering::SeqCst) {
            // Detached or closed. Nobody routes this output any more.
            return;
        }
        total += n;
        let event = PtyEvent::Output {
            session_id: session_id.clone(),
            data: buf[..n].to_vec(),
        };
        if events.send(event).is_err() {
            return;
        }
    }

    log::info!("PTY {session_id} EOF after {total} bytes");
    let deadline = Instant::now() + EXIT_STATUS_GRACE;
    let mut exit_code = try_wait_child(&child);
    while exit_code.is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(25));
        exit_code = try_wait_child(&child);
    }
    if !exit_flag.swap(true, Ordering::SeqCst) {
        let _ = events.send(PtyEvent::Exit {
            session_id,
            exit_code,
        });
    }
}

/// Watch a command session's child and report its exit code.
fn start_exit_watcher(
    session_id: &str,
    events: EventSender,
    exit_flag: Arc<AtomicBool>,
    child: SharedChild,
) -> Result<(), PtyError> {
    let sid = session_id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-wait-{session_id}"))
        .spawn(move || loop {
            std::thread::sleep(EXIT_POLL_INTERVAL);
            if exit_flag.load(Ordering::SeqCst) {
                return;
            }
            if let Some(exit_code) = try_wait_child(&child) {
                // Let the reader drain the last output first.
                std::thread::sleep(EXIT_STATUS_GRACE);
                if !exit_flag.swap(true, Ordering::SeqCst) {
                    log::info!("session {sid} command exited with {exit_code}");
                    let _ = events.send(PtyEvent::Exit {
                        session_id: sid,
                        exit_code: Some(exit_code),
                    });
                }
                return;
            }
        })?;
    Ok(())
}

#[async_trait]
impl PtyProvider for PtyHost {
    async fn connect(&self, request: ConnectRequest) -> Result<SpawnedSession, PtyError> {
        self.run_blocking(move |inner| inner.connect(&request)).await
    }

    async fn reconnect(&self, request: ReconnectRequest) -> Result<ReconnectOutcome, PtyError> {
        let Some(durable_name) = request.durable_name else {
            let alive = self.is_active(&request.session_id).await?;
            return Ok(if alive {
                ReconnectOutcome::connected(request.session_id)
            } else {
                ReconnectOutcome::failed()
            });
        };

        let attach = AttachRequest {
            durable_name,
            working_directory: request.working_directory.unwrap_or_else(|| "/".to_string()),
            size: request.size.unwrap_or_default(),
        };
        Ok(match DurableBridge::attach(self, attach).await? {
            Some(session_id) => ReconnectOutcome::connected(session_id),
            None => ReconnectOutcome::failed(),
        })
    }

    async fn is_active(&self, session_id: &str) -> Result<bool, PtyError> {
        let id = session_id.to_string();
        self.run_blocking(move |inner| Ok(inner.is_active(&id))).await
    }

    async fn resize(&self, session_id: &str, size: TermSize) -> Result<(), PtyError> {
        let id = session_id.to_string();
        self.run_blocking(move |inner| inner.resize(&id, size)).await
    }

    async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError> {
        let id = session_id.to_string();
        let data = data.to_vec();
        self.run_blocking(move |inner| inner.write(&id, &data)).await
    }

    async fn detach(&self, session_id: &str) -> Result<(), PtyError> {
        let id = session_id.to_string();
        self.run_blocking(move |inner| inner.detach(&id)).await
    }

    async fn close(&self, session_id: &str) -> Result<Option<i32>, PtyError> {
        let id = session_id.to_string();
        self.run_blocking(move |inner| inner.close(&id)).await
    }
}

#[async_trait]
impl DurableBridge for PtyHost {
    async fn attach(&self, request: AttachRequest) -> Result<Option<SessionId>, PtyError> {
        self.run_blocking(move |inner| inner.attach(&request)).await
    }

    async fn list(&self) -> Result<Vec<DurableSessionInfo>, PtyError> {
        self.run_blocking(|inner| {
            Ok(inner
                .tmux
                .as_ref()
                .map(Tmux::list_sessions)
                .unwrap_or_default())
        })
        .await
    }

    async fn cleanup_orphaned(&self, known: &[String]) -> Result<Vec<String>, PtyError> {
        let known = known.to_vec();
        self.run_blocking(move |inner| Ok(inner.cleanup_orphaned(&known)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{event_channel, EventReceiver};
    use tokio::time::timeout;

    fn native_host() -> (PtyHost, EventReceiver) {
        let (tx, rx) = event_channel();
        let host = PtyHost::with_tmux(Some("/bin/sh".to_string()), None, false, tx);
        (host, rx)
    }

    fn request(command: Option<&str>) -> ConnectRequest {
        ConnectRequest {
            working_directory: "/tmp".to_string(),
            command: command.map(str::to_string),
            size: TermSize::new(80, 24),
        }
    }

    /// Collect output for `session_id` until `needle` shows up or time runs out.
    async fn read_until(rx: &mut EventReceiver, session_id: &str, needle: &str) -> String {
        let mut output = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let PtyEvent::Output { session_id: id, data } = event {
                if id == session_id {
                    output.extend_from_slice(&data);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    /// Wait for the next exit event of `session_id`.
    async fn next_exit(
        rx: &mut EventReceiver,
        session_id: &str,
        within: Duration,
    ) -> Option<Option<i32>> {
        let deadline = tokio::time::Instant::now() + within;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let PtyEvent::Exit {
                session_id: id,
                exit_code,
            } = event
            {
                if id == session_id {
                    return Some(exit_code);
                }
            }
        }
        None
    }

    #[tokio::test]
    async fn test_connect_write_output() {
        let (host, mut rx) = native_host();
        let spawned = host.connect(request(None)).await.unwrap();
        assert_eq!(spawned.durable_name, None);
        assert!(host.is_active(&spawned.session_id).await.unwrap());

        host.write(&spawned.session_id, b"echo HOST_OK\n").await.unwrap();
        let text = read_until(&mut rx, &spawned.session_id, "HOST_OK").await;
        assert!(text.contains("HOST_OK"), "got: {text}");

        host.close(&spawned.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_exit_reported_once_with_code() {
        let (host, mut rx) = native_host();
        let spawned = host.connect(request(Some("exit 7"))).await.unwrap();

        let exit = next_exit(&mut rx, &spawned.session_id, Duration::from_secs(5)).await;
        assert_eq!(exit, Some(Some(7)));

        let again = next_exit(&mut rx, &spawned.session_id, Duration::from_secs(1)).await;
        assert_eq!(again, None, "exit must be reported once");
        assert!(!host.is_active(&spawned.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_detach_is_silent() {
        let (host, mut rx) = native_host();
        let spawned = host.connect(request(None)).await.unwrap();

        host.detach(&spawned.session_id).await.unwrap();
        assert!(!host.is_active(&spawned.session_id).await.unwrap());
        assert!(host.list_sessions().is_empty());

        let exit = next_exit(&mut rx, &spawned.session_id, Duration::from_secs(1)).await;
        assert_eq!(exit, None);

        let again = host.detach(&spawned.session_id).await;
        assert!(matches!(again, Err(PtyError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_close_emits_single_exit() {
        let (host, mut rx) = native_host();
        let spawned = host.connect(request(None)).await.unwrap();

        host.close(&spawned.session_id).await.unwrap();
        let exit = next_exit(&mut rx, &spawned.session_id, Duration::from_secs(2)).await;
        assert!(exit.is_some());
        let again = next_exit(&mut rx, &spawned.session_id, Duration::from_secs(1)).await;
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn test_resize_guard_and_unknown_session() {
        let (host, _rx) = native_host();
        let spawned = host.connect(request(None)).await.unwrap();

        host.resize(&spawned.session_id, TermSize::new(120, 40))
            .await
            .unwrap();
        host.resize(&spawned.session_id, TermSize::new(1, 1))
            .await
            .unwrap();
        let missing = host.resize("nope", TermSize::new(80, 24)).await;
        assert!(matches!(missing, Err(PtyError::SessionNotFound(_))));

        host.close(&spawned.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_native_reconnect() {
        let (host, _rx) = native_host();
        let spawned = host.connect(request(None)).await.unwrap();

        let outcome = host
            .reconnect(ReconnectRequest {
                session_id: spawned.session_id.clone(),
                durable_name: None,
                working_directory: None,
                size: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReconnectOutcome::connected(spawned.session_id.clone()));

        let outcome = host
            .reconnect(ReconnectRequest {
                session_id: "gone".to_string(),
                durable_name: None,
                working_directory: None,
                size: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReconnectOutcome::failed());

        host.close(&spawned.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_durable_calls_without_tmux() {
        let (host, _rx) = native_host();
        let attach = DurableBridge::attach(
            &host,
            AttachRequest {
                durable_name: "ct-1234abcd".to_string(),
                working_directory: "/tmp".to_string(),
                size: TermSize::new(80, 24),
            },
        )
        .await;
        assert!(matches!(attach, Err(PtyError::DurableUnavailable)));
        assert!(host.list().await.unwrap().is_empty());
        assert!(host.cleanup_orphaned(&[]).await.unwrap().is_empty());
        assert!(!host.tmux_status().available);
    }

    #[tokio::test]
    async fn test_close_all_and_info() {
        let (host, _rx) = native_host();
        let a = host.connect(request(None)).await.unwrap();
        let b = host.connect(request(None)).await.unwrap();

        assert_eq!(host.list_sessions().len(), 2);
        assert_eq!(host.active_count(), 2);
        let info = host.session_info(&a.session_id).unwrap();
        assert_eq!(info.working_directory, "/tmp");
        assert_eq!(info.durable_name, None);

        assert_eq!(host.close_all(), 2);
        assert!(host.list_sessions().is_empty());
        assert!(host.session_info(&b.session_id).is_none());
    }

    #[tokio::test]
    async fn test_set_use_tmux() {
        let (host, _rx) = native_host();
        host.set_use_tmux(true);
        assert!(host.tmux_status().enabled);
        // Without tmux installed, connects stay native.
        let spawned = timeout(Duration::from_secs(5), host.connect(request(None)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spawned.durable_name, None);
        host.close(&spawned.session_id).await.unwrap();
    }
}
