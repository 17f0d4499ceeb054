//! The engine facade: tabs, cached instances, live sessions and persistence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ctower_pty::{DurableBridge, PtyProvider, SessionId};
use ctower_vt::{ContainerSize, TermSize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{BroadcastReport, BroadcastState};
use crate::cache::{InstanceCache, InstanceHandle, SurfaceId};
use crate::config::{clamp_font_size, EngineConfig};
use crate::error::EngineError;
use crate::model::{CommandKind, ConnectionState, Pane, PersistKey, ProjectTerminals, Tab};
use crate::pump::PendingOutput;
use crate::reconnect::{SessionTracker, TrackedSession};
use crate::registry::{Registry, RegistryStore};
use crate::resize::ResizeNegotiator;
use crate::sink::{InputTarget, KeyDisposition, KeyEvent, KeyInterceptor};

/// Everything guarded by the engine lock. Never held across an await.
pub(crate) struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) tabs: crate::tabs::TabStore,
    pub(crate) cache: InstanceCache,
    pub(crate) tracker: SessionTracker,
    pub(crate) broadcast: BroadcastState,
    pub(crate) states: HashMap<PersistKey, ConnectionState>,
    pub(crate) pending: PendingOutput,
}

impl EngineState {
    /// Where keystrokes typed into `key` should go right now.
    pub(crate) fn input_target_for(&self, key: &PersistKey) -> InputTarget {
        if key.pane == Pane::Main && self.broadcast.routes(&key.tab_id) {
            return InputTarget::Broadcast;
        }
        match self.tracker.live_session(key) {
            Some(session_id) => InputTarget::Session(session_id.clone()),
            None => InputTarget::Detached,
        }
    }

    pub(crate) fn rebind_input(&mut self, key: &PersistKey) {
        let target = self.input_target_for(key);
        if let Some(instance) = self.cache.get_mut(key) {
            instance.rebind_input(target);
        }
    }

    fn rebind_tab_inputs(&mut self, tab_id: &str) {
        let keys: Vec<PersistKey> = self
            .tabs
            .tabs()
            .filter(|t| t.id == tab_id)
            .map(|t| t.key(Pane::Main))
            .collect();
        for key in keys {
            self.rebind_input(&key);
        }
    }
}

pub(crate) struct Inner {
    pub(crate) provider: Arc<dyn PtyProvider>,
    pub(crate) bridge: Arc<dyn DurableBridge>,
    pub(crate) registry: Registry,
    pub(crate) resize: ResizeNegotiator,
    pub(crate) shutdown: CancellationToken,
    state: Mutex<EngineState>,
    connect_locks: Mutex<HashMap<PersistKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Inner {
    pub(crate) fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-key lock serializing connects.
    pub(crate) fn connect_lock(&self, key: &PersistKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .connect_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn drop_connect_lock(&self, key: &PersistKey) {
        self.connect_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Result of mounting an instance into a surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachOutcome {
    pub handle: InstanceHandle,
    /// `true` when the instance was created for this mount.
    pub is_fresh: bool,
    pub geometry: TermSize,
}

/// Owns every terminal tab and its sessions.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn PtyProvider>,
        bridge: Arc<dyn DurableBridge>,
        store: Arc<dyn RegistryStore>,
        config: EngineConfig,
    ) -> Self {
        let resize = ResizeNegotiator::new(config.resize_debounce);
        let state = EngineState {
            config,
            tabs: crate::tabs::TabStore::new(),
            cache: InstanceCache::new(),
            tracker: SessionTracker::default(),
            broadcast: BroadcastState::new(),
            states: HashMap::new(),
            pending: PendingOutput::default(),
        };
        Self {
            inner: Arc::new(Inner {
                provider,
                bridge,
                registry: Registry::new(store),
                resize,
                shutdown: CancellationToken::new(),
                state: Mutex::new(state),
                connect_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.inner.state().config.clone()
    }

    // ── Restore and projects ────────────────────────────────────────────

    /// Seed tabs from the registry. Allowed once per process.
    ///
    /// Returns the number of tabs created.
    pub async fn restore(&self) -> Result<usize, EngineError> {
        let records = self.inner.registry.restore_once().await?;
        let created = self.inner.state().tabs.seed_from_records(&records);
        log::info!(
            "restored {} tabs from {} saved records",
            created.len(),
            records.len()
        );
        Ok(created.len())
    }

    /// Kill durable sessions no tab refers to. Only valid after `restore`.
    pub async fn reap_orphans(&self) -> Result<Vec<String>, EngineError> {
        if !self.inner.registry.is_restored() {
            return Err(EngineError::RestoreRequired);
        }
        let known = self.inner.state().tabs.durable_names();
        let killed = self.inner.bridge.cleanup_orphaned(&known).await?;
        if !killed.is_empty() {
            log::info!("reaped {} orphaned durable sessions", killed.len());
        }
        Ok(killed)
    }

    /// Record a project's working directory. Returns `true` if it was new.
    pub fn register_project(&self, project_id: &str, working_directory: &str) -> bool {
        let added = self
            .inner
            .state()
            .tabs
            .register_project(project_id, working_directory);
        if added {
            self.inner.registry.mark_dirty();
        }
        added
    }

    // ── Tabs ────────────────────────────────────────────────────────────

    /// Add a tab and make it active. It connects on first mount or `connect`.
    pub fn add_tab(&self, project_id: &str, kind: CommandKind) -> Tab {
        let tab = self.inner.state().tabs.add_tab(project_id, kind);
        log::debug!("added {} tab {} to {project_id}", kind.as_str(), tab.id);
        self.inner.registry.mark_dirty();
        tab
    }

    /// Remove a tab, dispose its instances and close every session it owns.
    pub async fn close_tab(&self, project_id: &str, tab_id: &str) -> Result<(), EngineError> {
        let keys = PersistKey::panes(project_id, tab_id);
        let sessions = {
            let mut state = self.inner.state();
            let tab = state
                .tabs
                .close_tab(project_id, tab_id)
                .ok_or_else(|| EngineError::TabNotFound(tab_id.to_string()))?;
            let mut sessions: Vec<SessionId> = Vec::new();
            for key in &keys {
                if let Some(tracked) = state.tracker.forget(key) {
                    sessions.push(tracked.session_id);
                }
                if let Some(session_id) = tab.session_of(key.pane) {
                    if !sessions.contains(session_id) {
                        sessions.push(session_id.clone());
                    }
                }
                state.cache.evict(key);
                state.states.remove(key);
            }
            state.broadcast.remove(tab_id);
            sessions
        };

        for key in &keys {
            self.inner.resize.cancel(key);
            self.inner.drop_connect_lock(key);
        }
        self.inner.registry.mark_dirty();

        for session_id in sessions {
            match self.inner.provider.close(&session_id).await {
                Ok(code) => log::debug!("closed session {session_id} (exit {code:?})"),
                Err(e) => log::debug!("closing session {session_id} failed: {e}"),
            }
        }
        log::info!("closed tab {tab_id} in {project_id}");
        Ok(())
    }

    pub fn set_active_tab(&self, project_id: &str, tab_id: &str) -> Result<(), EngineError> {
        self.inner.state().tabs.set_active(project_id, tab_id)
    }

    pub fn rename_tab(&self, project_id: &str, tab_id: &str, label: &str) -> Result<(), EngineError> {
        self.inner.state().tabs.rename(project_id, tab_id, label)?;
        self.inner.registry.mark_dirty();
        Ok(())
    }

    /// Flip a tab's split pane. Turning it off closes the pane's session.
    ///
    /// Returns whether the tab is now split.
    pub async fn toggle_split(&self, project_id: &str, tab_id: &str) -> Result<bool, EngineError> {
        let key = PersistKey::split(project_id, tab_id);
        let (split, closing) = {
            let mut state = self.inner.state();
            let split = state.tabs.toggle_split(project_id, tab_id)?;
            let closing = if split {
                None
            } else {
                state.cache.evict(&key);
                state.states.remove(&key);
                state.tracker.forget(&key).map(|t| t.session_id)
            };
            (split, closing)
        };

        if !split {
            self.inner.resize.cancel(&key);
            self.inner.drop_connect_lock(&key);
        }
        if let Some(session_id) = closing {
            if let Err(e) = self.inner.provider.close(&session_id).await {
                log::debug!("closing split session {session_id} failed: {e}");
            }
        }
        Ok(split)
    }

    pub fn set_tab_exited(&self, key: &PersistKey, exit_code: Option<i32>) -> bool {
        let changed = self.inner.state().tabs.set_exited(key, exit_code);
        if changed {
            self.inner.registry.mark_dirty();
        }
        changed
    }

    pub fn set_tab_ready(&self, key: &PersistKey) -> bool {
        let changed = self.inner.state().tabs.set_ready(key);
        if changed {
            self.inner.registry.mark_dirty();
        }
        changed
    }

    pub fn project_terminals(&self, project_id: &str) -> Option<ProjectTerminals> {
        self.inner.state().tabs.group(project_id).cloned()
    }

    pub fn all_terminals(&self) -> Vec<ProjectTerminals> {
        self.inner.state().tabs.groups().to_vec()
    }

    pub fn has_terminals(&self, project_id: &str) -> bool {
        self.inner.state().tabs.has_terminals(project_id)
    }

    pub fn tab(&self, project_id: &str, tab_id: &str) -> Option<Tab> {
        self.inner.state().tabs.tab(project_id, tab_id).cloned()
    }

    // ── Broadcast ───────────────────────────────────────────────────────

    /// Flip broadcast mode. Turning it off clears the participant set.
    pub fn toggle_broadcast_mode(&self) -> bool {
        let mut state = self.inner.state();
        let enabled = !state.broadcast.is_enabled();
        let affected = state.broadcast.set_mode(enabled);
        let participants: Vec<String> = state.broadcast.participants().cloned().collect();
        for tab_id in affected.iter().chain(participants.iter()) {
            state.rebind_tab_inputs(tab_id);
        }
        log::info!("broadcast mode {}", if enabled { "on" } else { "off" });
        enabled
    }

    /// Add or remove a tab from the participant set. Returns membership.
    pub fn toggle_broadcast_tab(&self, tab_id: &str) -> bool {
        let mut state = self.inner.state();
        let member = state.broadcast.toggle(tab_id);
        state.rebind_tab_inputs(tab_id);
        member
    }

    pub fn is_broadcast_enabled(&self) -> bool {
        self.inner.state().broadcast.is_enabled()
    }

    pub fn broadcast_participants(&self) -> Vec<String> {
        self.inner.state().broadcast.participants().cloned().collect()
    }

    /// Write `data` to every participant with a live, non-exited session.
    ///
    /// Writes run concurrently. One failing does not stop the others.
    pub async fn broadcast_write(&self, data: &[u8]) -> BroadcastReport {
        let targets: Vec<SessionId> = {
            let state = self.inner.state();
            state
                .tabs
                .tabs()
                .filter(|t| state.broadcast.is_participant(&t.id) && !t.is_exited)
                .filter_map(|t| t.session_id.clone())
                .collect()
        };

        let mut writes = JoinSet::new();
        for session_id in targets {
            let provider = Arc::clone(&self.inner.provider);
            let data = data.to_vec();
            writes.spawn(async move {
                provider
                    .write(&session_id, &data)
                    .await
                    .map_err(|e| (session_id, e))
            });
        }

        let mut report = BroadcastReport::default();
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok(Ok(())) => report.sent += 1,
                Ok(Err((session_id, e))) => {
                    log::warn!("broadcast write to {session_id} failed: {e}");
                    report.failed += 1;
                }
                Err(e) => {
                    log::warn!("broadcast write task failed: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    // ── Geometry ────────────────────────────────────────────────────────

    /// Change the font size for every instance. Returns the clamped size.
    pub async fn set_font_size(&self, size: i64) -> u16 {
        let font_size = clamp_font_size(size);
        let resizes: Vec<(SessionId, TermSize)> = {
            let mut state = self.inner.state();
            let state = &mut *state;
            state.config.font_size = font_size;
            let mut resizes = Vec::new();
            for (key, instance) in state.cache.iter_mut() {
                instance.set_font_size(font_size);
                if instance.surface().is_none() {
                    continue;
                }
                if let Some(size) = instance.refit() {
                    instance.vt_mut().refresh();
                    if let Some(session_id) = state.tracker.live_session(key) {
                        resizes.push((session_id.clone(), size));
                    }
                }
            }
            resizes
        };

        for (session_id, size) in resizes {
            if let Err(e) = self.inner.provider.resize(&session_id, size).await {
                log::debug!("resize of {session_id} failed: {e}");
            }
        }
        font_size
    }

    /// Change the line height. Instances pick it up when next attached,
    /// being recreated in the process.
    pub fn set_line_height(&self, line_height: f32) {
        self.inner.state().config.line_height = line_height;
    }

    // ── Surfaces ────────────────────────────────────────────────────────

    /// Mount the instance for `key` into a surface, creating it if needed.
    pub fn attach(
        &self,
        key: &PersistKey,
        surface: SurfaceId,
        container: ContainerSize,
    ) -> Result<AttachOutcome, EngineError> {
        let mut state = self.inner.state();
        if !state.tabs.has_pane(key) {
            return Err(EngineError::TabNotFound(key.to_string()));
        }
        let options = state.config.geometry();
        let (handle, is_fresh) = state.cache.acquire(key, options);
        let target = state.input_target_for(key);
        let instance = state
            .cache
            .get_mut(key)
            .ok_or_else(|| EngineError::NotAttached(key.to_string()))?;
        instance.mount(surface, container);
        instance.rebind_input(target);
        Ok(AttachOutcome {
            handle,
            is_fresh,
            geometry: instance.last_geometry(),
        })
    }

    /// Tear down the surface but keep the instance cached.
    pub fn detach(&self, key: &PersistKey) -> bool {
        self.inner.resize.cancel(key);
        self.inner.state().cache.release(key)
    }

    /// Note a new container size. The resize is applied once notifications
    /// for `key` stop arriving for the debounce window.
    pub fn on_geometry_changed(&self, key: &PersistKey, container: ContainerSize) -> Result<(), EngineError> {
        if container.is_empty() {
            self.inner.resize.cancel(key);
            return Ok(());
        }
        {
            let mut state = self.inner.state();
            let instance = state
                .cache
                .get_mut(key)
                .ok_or_else(|| EngineError::NotAttached(key.to_string()))?;
            instance.set_container(container);
        }

        let weak = Arc::downgrade(&self.inner);
        let settled_key = key.clone();
        self.inner.resize.schedule(key.clone(), async move {
            let Some(inner) = weak.upgrade() else { return };
            let manager = SessionManager { inner };
            if let Err(e) = manager.apply_geometry(&settled_key, false).await {
                log::debug!("resize of {settled_key} failed: {e}");
            }
        });
        Ok(())
    }

    /// Track visibility. Becoming visible refits and repaints at once.
    pub async fn on_visibility_changed(&self, key: &PersistKey, visible: bool) -> Result<(), EngineError> {
        let was_visible = {
            let mut state = self.inner.state();
            let instance = state
                .cache
                .get_mut(key)
                .ok_or_else(|| EngineError::NotAttached(key.to_string()))?;
            instance.set_visible(visible)
        };
        if visible && !was_visible {
            self.apply_geometry(key, true).await?;
        }
        Ok(())
    }

    /// Fit the instance to its container and tell its session once.
    pub(crate) async fn apply_geometry(
        &self,
        key: &PersistKey,
        repaint: bool,
    ) -> Result<Option<TermSize>, EngineError> {
        let (session_id, size) = {
            let mut state = self.inner.state();
            let state = &mut *state;
            let Some(instance) = state.cache.get_mut(key) else {
                return Ok(None);
            };
            let Some(size) = instance.refit() else {
                return Ok(None);
            };
            if repaint {
                instance.vt_mut().refresh();
            }
            (state.tracker.live_session(key).cloned(), size)
        };
        if let Some(session_id) = session_id {
            self.inner.provider.resize(&session_id, size).await?;
        }
        Ok(Some(size))
    }

    // ── Input ───────────────────────────────────────────────────────────

    /// Route typed input through the instance's current input binding.
    pub async fn send_input(&self, key: &PersistKey, data: &[u8]) -> Result<(), EngineError> {
        let target = {
            let state = self.inner.state();
            let instance = state
                .cache
                .get(key)
                .ok_or_else(|| EngineError::NotAttached(key.to_string()))?;
            instance.input_target().clone()
        };
        match target {
            InputTarget::Session(session_id) => {
                self.inner.provider.write(&session_id, data).await?;
            }
            InputTarget::Broadcast => {
                self.broadcast_write(data).await;
            }
            InputTarget::Detached => return Err(EngineError::NotConnected(key.to_string())),
        }
        Ok(())
    }

    pub fn set_key_interceptor(&self, key: &PersistKey, interceptor: KeyInterceptor) -> Result<(), EngineError> {
        let mut state = self.inner.state();
        let instance = state
            .cache
            .get_mut(key)
            .ok_or_else(|| EngineError::NotAttached(key.to_string()))?;
        instance.rebind_keys(interceptor);
        Ok(())
    }

    /// Run the instance's current key interceptor.
    pub fn intercept_key(&self, key: &PersistKey, event: &KeyEvent) -> KeyDisposition {
        let interceptor = match self.inner.state().cache.get(key) {
            Some(instance) => instance.key_interceptor(),
            None => return KeyDisposition::PassThrough,
        };
        interceptor(event)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn buffer_text(&self, key: &PersistKey) -> Option<String> {
        self.inner.state().cache.get(key).map(|i| i.vt().text())
    }

    pub fn connection_state(&self, key: &PersistKey) -> ConnectionState {
        self.inner
            .state()
            .states
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// The session currently bound to `key`, if any.
    pub fn tracked_session(&self, key: &PersistKey) -> Option<TrackedSession> {
        self.inner.state().tracker.get(key).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.state().cache.len()
    }

    /// Inspect the cached instance for `key`.
    pub fn with_instance<R>(
        &self,
        key: &PersistKey,
        f: impl FnOnce(&crate::cache::CachedInstance) -> R,
    ) -> Option<R> {
        self.inner.state().cache.get(key).map(f)
    }

    // ── Persistence and lifecycle ───────────────────────────────────────

    /// Write the current tab set to the registry now.
    pub async fn save_now(&self) -> Result<usize, EngineError> {
        let inner = &self.inner;
        let saved = inner.registry.save(|| inner.state().tabs.records()).await?;
        log::debug!("saved {saved} terminal sessions");
        Ok(saved)
    }

    /// Save in the background once changes stop for the debounce window.
    pub fn start_autosave(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let dirty = self.inner.registry.dirty_signal();
        let shutdown = self.inner.shutdown.clone();
        let debounce = self.config().save_debounce;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = dirty.notified() => {}
                }
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = dirty.notified() => continue,
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }
                let Some(inner) = weak.upgrade() else { return };
                let manager = SessionManager { inner };
                if let Err(e) = manager.save_now().await {
                    log::warn!("saving terminal sessions failed: {e}");
                    manager.inner.registry.mark_dirty();
                }
            }
        })
    }

    /// Stop background tasks and save once more.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.resize.cancel_all();
        match self.save_now().await {
            Ok(saved) => log::info!("saved {saved} terminal sessions on shutdown"),
            Err(e) => log::warn!("final save failed: {e}"),
        }
    }
}
