//! In-memory provider, bridge and registry for engine tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ctower_db::SessionRecord;
use ctower_pty::{
    AttachRequest, ConnectRequest, DurableBridge, DurableSessionInfo, EventSender, PtyError,
    PtyEvent, PtyProvider, ReconnectOutcome, ReconnectRequest, SessionId, SpawnedSession,
};
use ctower_vt::TermSize;

use crate::error::EngineError;
use crate::registry::RegistryStore;

/// One recorded provider or bridge call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Connect(ConnectRequest),
    Reconnect(ReconnectRequest),
    IsActive(SessionId),
    Resize(SessionId, TermSize),
    Write(SessionId, Vec<u8>),
    Detach(SessionId),
    Close(SessionId),
    Attach(AttachRequest),
    Cleanup(Vec<String>),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    next_id: u64,
    alive: HashSet<SessionId>,
    durables: BTreeSet<String>,
    durable_of: HashMap<SessionId, String>,
    failing_writes: HashSet<SessionId>,
    fail_connect: bool,
    is_active_error: bool,
    durable_mode: bool,
    reconnectable: bool,
    connect_delay: Option<Duration>,
    events: Option<EventSender>,
}

impl FakeState {
    fn spawn(&mut self) -> SessionId {
        self.next_id += 1;
        let id = format!("s{}", self.next_id);
        self.alive.insert(id.clone());
        id
    }
}

/// A provider and bridge that only keeps bookkeeping.
#[derive(Default)]
pub struct FakePty {
    state: Mutex<FakeState>,
}

impl FakePty {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn connects(&self) -> Vec<ConnectRequest> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Connect(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn alive_count(&self) -> usize {
        self.state().alive.len()
    }

    pub fn is_alive(&self, session_id: &str) -> bool {
        self.state().alive.contains(session_id)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn set_is_active_error(&self, fail: bool) {
        self.state().is_active_error = fail;
    }

    /// Fresh connects get a durable name `ct-<id>`.
    pub fn set_durable_mode(&self, durable: bool) {
        self.state().durable_mode = durable;
    }

    pub fn set_reconnectable(&self, reconnectable: bool) {
        self.state().reconnectable = reconnectable;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    pub fn fail_writes_to(&self, session_id: &str) {
        self.state().failing_writes.insert(session_id.to_string());
    }

    /// Kill a session's PTY. Its durable session, if any, survives.
    pub fn kill_pty(&self, session_id: &str) {
        self.state().alive.remove(session_id);
    }

    pub fn add_durable(&self, name: &str) {
        self.state().durables.insert(name.to_string());
    }

    pub fn has_durable(&self, name: &str) -> bool {
        self.state().durables.contains(name)
    }

    pub fn set_events(&self, events: EventSender) {
        self.state().events = Some(events);
    }

    fn emit(&self, event: PtyEvent) {
        if let Some(events) = &self.state().events {
            let _ = events.send(event);
        }
    }

    pub fn emit_output(&self, session_id: &str, data: &[u8]) {
        self.emit(PtyEvent::Output {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        });
    }

    pub fn emit_exit(&self, session_id: &str, exit_code: Option<i32>) {
        self.emit(PtyEvent::Exit {
            session_id: session_id.to_string(),
            exit_code,
        });
    }

    /// Let spawned tasks (the event pump, settled resizes) run.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl PtyProvider for FakePty {
    async fn connect(&self, request: ConnectRequest) -> Result<SpawnedSession, PtyError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(Call::Connect(request));
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_connect {
            return Err(PtyError::SpawnFailed("connect refused".into()));
        }
        let session_id = state.spawn();
        let durable_name = if state.durable_mode {
            let name = format!("ct-{session_id}");
            state.durables.insert(name.clone());
            state.durable_of.insert(session_id.clone(), name.clone());
            Some(name)
        } else {
            None
        };
        Ok(SpawnedSession {
            session_id,
            durable_name,
        })
    }

    async fn reconnect(&self, request: ReconnectRequest) -> Result<ReconnectOutcome, PtyError> {
        let mut state = self.state();
        state.calls.push(Call::Reconnect(request));
        if !state.reconnectable {
            return Ok(ReconnectOutcome::failed());
        }
        let session_id = state.spawn();
        Ok(ReconnectOutcome::connected(session_id))
    }

    async fn is_active(&self, session_id: &str) -> Result<bool, PtyError> {
        let mut state = self.state();
        state.calls.push(Call::IsActive(session_id.to_string()));
        if state.is_active_error {
            return Err(PtyError::TaskFailed("liveness unavailable".into()));
        }
        Ok(state.alive.contains(session_id))
    }

    async fn resize(&self, session_id: &str, size: TermSize) -> Result<(), PtyError> {
        let mut state = self.state();
        state.calls.push(Call::Resize(session_id.to_string(), size));
        if !state.alive.contains(session_id) {
            return Err(PtyError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError> {
        let mut state = self.state();
        state
            .calls
            .push(Call::Write(session_id.to_string(), data.to_vec()));
        if state.failing_writes.contains(session_id) || !state.alive.contains(session_id) {
            return Err(PtyError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn detach(&self, session_id: &str) -> Result<(), PtyError> {
        let mut state = self.state();
        state.calls.push(Call::Detach(session_id.to_string()));
        state.alive.remove(session_id);
        Ok(())
    }

    async fn close(&self, session_id: &str) -> Result<Option<i32>, PtyError> {
        let was_alive = {
            let mut state = self.state();
            state.calls.push(Call::Close(session_id.to_string()));
            if let Some(name) = state.durable_of.remove(session_id) {
                state.durables.remove(&name);
            }
            state.alive.remove(session_id)
        };
        if was_alive {
            self.emit_exit(session_id, None);
        }
        Ok(None)
    }
}

#[async_trait]
impl DurableBridge for FakePty {
    async fn attach(&self, request: AttachRequest) -> Result<Option<SessionId>, PtyError> {
        let mut state = self.state();
        let name = request.durable_name.clone();
        state.calls.push(Call::Attach(request));
        if !state.durables.contains(&name) {
            return Ok(None);
        }
        let session_id = state.spawn();
        state.durable_of.insert(session_id.clone(), name);
        Ok(Some(session_id))
    }

    async fn list(&self) -> Result<Vec<DurableSessionInfo>, PtyError> {
        Ok(self
            .state()
            .durables
            .iter()
            .map(|name| DurableSessionInfo {
                name: name.clone(),
                working_directory: String::new(),
                created_at: String::new(),
            })
            .collect())
    }

    async fn cleanup_orphaned(&self, known: &[String]) -> Result<Vec<String>, PtyError> {
        let mut state = self.state();
        state.calls.push(Call::Cleanup(known.to_vec()));
        let orphans: Vec<String> = state
            .durables
            .iter()
            .filter(|name| !known.contains(name))
            .cloned()
            .collect();
        for name in &orphans {
            state.durables.remove(name);
        }
        Ok(orphans)
    }
}

/// A registry store kept in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    records: Mutex<Vec<SessionRecord>>,
    saves: AtomicUsize,
    fail: AtomicBool,
    next_save_delay: Mutex<Option<Duration>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, records: Vec<SessionRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make the next save block for `delay` before writing.
    pub fn delay_next_save(&self, delay: Duration) {
        *self.next_save_delay.lock().unwrap() = Some(delay);
    }
}

impl RegistryStore for MemoryRegistry {
    fn save(&self, records: &[SessionRecord]) -> Result<usize, EngineError> {
        let delay = self.next_save_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::TaskFailed("registry unavailable".into()));
        }
        *self.records.lock().unwrap() = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(records.len())
    }

    fn restore(&self) -> Result<Vec<SessionRecord>, EngineError> {
        Ok(self.records())
    }
}
