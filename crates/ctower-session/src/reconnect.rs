//! Connects a pane to a session: reuse, reattach, reconnect or spawn.
//!
//! Tiers are tried in order and the first that yields a session wins:
//!
//! 1. the tracked session, if the provider still reports it active
//! 2. the durable session by name, through the bridge
//! 3. the bare session id, through `PtyProvider::reconnect`
//! 4. a fresh session in the project's working directory
//!
//! Connects for one key are serialized. `bind_session` is the only place a
//! pane's session changes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ctower_pty::{AttachRequest, ConnectRequest, ReconnectRequest, SessionId};
use ctower_vt::TermSize;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::manager::SessionManager;
use crate::model::{ConnectTier, ConnectionState, Pane, PersistKey, SessionRef};

/// The session currently bound to a pane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedSession {
    pub session_id: SessionId,
    pub durable_name: Option<String>,
}

/// Retired ids remembered at most. Detached sessions never report an exit,
/// so the oldest ids are dropped past this.
const MAX_RETIRED: usize = 256;

/// Which session each pane owns, and which key each live session feeds.
///
/// A session stops being routed when it exits or is replaced. Replaced
/// sessions are retired so their late output is dropped instead of buffered.
#[derive(Debug, Default)]
pub(crate) struct SessionTracker {
    by_key: HashMap<PersistKey, TrackedSession>,
    routes: HashMap<SessionId, PersistKey>,
    retired: HashSet<SessionId>,
    retired_order: VecDeque<SessionId>,
}

impl SessionTracker {
    pub(crate) fn get(&self, key: &PersistKey) -> Option<&TrackedSession> {
        self.by_key.get(key)
    }

    /// The key a session's events go to.
    pub(crate) fn route(&self, session_id: &str) -> Option<&PersistKey> {
        self.routes.get(session_id)
    }

    /// The pane's session, if it is still routed.
    pub(crate) fn live_session(&self, key: &PersistKey) -> Option<&SessionId> {
        self.by_key
            .get(key)
            .map(|t| &t.session_id)
            .filter(|id| self.routes.contains_key(id.as_str()))
    }

    /// Make `tracked` the pane's session. A different previous session is retired.
    pub(crate) fn bind(&mut self, key: &PersistKey, tracked: TrackedSession) -> Option<TrackedSession> {
        let previous = self.by_key.insert(key.clone(), tracked.clone());
        if let Some(previous) = &previous {
            if previous.session_id != tracked.session_id {
                self.retire(&previous.session_id);
            }
        }
        self.clear_retired(&tracked.session_id);
        self.routes.insert(tracked.session_id, key.clone());
        previous
    }

    /// Stop routing an exited session. The pane keeps it as its last session.
    pub(crate) fn unroute(&mut self, session_id: &str) -> Option<PersistKey> {
        self.routes.remove(session_id)
    }

    pub(crate) fn retire(&mut self, session_id: &str) {
        self.routes.remove(session_id);
        if self.retired.insert(session_id.to_string()) {
            self.retired_order.push_back(session_id.to_string());
        }
        while self.retired_order.len() > MAX_RETIRED {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    pub(crate) fn is_retired(&self, session_id: &str) -> bool {
        self.retired.contains(session_id)
    }

    pub(crate) fn clear_retired(&mut self, session_id: &str) {
        if self.retired.remove(session_id) {
            self.retired_order.retain(|id| id != session_id);
        }
    }

    /// Drop the pane's session entirely, retiring it.
    pub(crate) fn forget(&mut self, key: &PersistKey) -> Option<TrackedSession> {
        let tracked = self.by_key.remove(key)?;
        self.retire(&tracked.session_id);
        Some(tracked)
    }
}

/// Everything a connect needs, captured under the engine lock.
struct ConnectPlan {
    working_directory: String,
    command: Option<String>,
    size: TermSize,
    tracked: Option<TrackedSession>,
    durable_name: Option<String>,
    teardown: CancellationToken,
}

impl SessionManager {
    /// Give the pane at `key` a live session.
    ///
    /// With `force_fresh` the current session is closed, durable wrapper
    /// included, the buffer is cleared, and tier 1 is skipped.
    ///
    /// If the instance's surface is torn down while a connect is in flight,
    /// any session created is still bound to the pane, but the connect
    /// returns `Cancelled` without pushing geometry or publishing state.
    pub async fn connect(&self, key: &PersistKey, force_fresh: bool) -> Result<SessionRef, EngineError> {
        let lock = self.inner.connect_lock(key);
        let _serial = lock.lock().await;

        let plan = self.prepare_connect(key, force_fresh)?;
        let result = self.run_tiers(key, plan, force_fresh).await;

        let mut state = self.inner.state();
        match result {
            Ok(session) => {
                state.tabs.set_ready(key);
                state.states.insert(key.clone(), ConnectionState::Connected);
                log::info!(
                    "{key} connected to {} ({:?})",
                    session.session_id,
                    session.tier
                );
                Ok(session)
            }
            Err(EngineError::Cancelled(k)) => {
                log::debug!("connect for {k} cancelled by teardown");
                state.states.insert(key.clone(), ConnectionState::Idle);
                Err(EngineError::Cancelled(k))
            }
            Err(e @ EngineError::TabNotFound(_)) => {
                state.states.remove(key);
                Err(e)
            }
            Err(e) => {
                let message = e.to_string();
                log::warn!("connect failed for {key}: {message}");
                state
                    .states
                    .insert(key.clone(), ConnectionState::Error(message.clone()));
                Err(EngineError::ConnectFailed {
                    key: key.to_string(),
                    message,
                })
            }
        }
    }

    /// Close the pane's session and start a new one with an empty buffer.
    pub async fn restart(&self, key: &PersistKey) -> Result<SessionRef, EngineError> {
        self.connect(key, true).await
    }

    fn prepare_connect(&self, key: &PersistKey, force_fresh: bool) -> Result<ConnectPlan, EngineError> {
        let mut state = self.inner.state();
        let state = &mut *state;
        if !state.tabs.has_pane(key) {
            return Err(EngineError::TabNotFound(key.to_string()));
        }
        let tab = state
            .tabs
            .tab(&key.project_id, &key.tab_id)
            .ok_or_else(|| EngineError::TabNotFound(key.to_string()))?;
        let working_directory = state
            .tabs
            .project_path(&key.project_id)
            .ok_or_else(|| EngineError::ProjectNotRegistered(key.project_id.clone()))?
            .to_string();
        let (command, tab_durable) = match key.pane {
            Pane::Main => (tab.kind.command().map(str::to_string), tab.durable_name.clone()),
            Pane::Split => (None, None),
        };

        if !state.cache.contains(key) {
            state.cache.acquire(key, state.config.geometry());
        }
        let instance = state
            .cache
            .get_mut(key)
            .ok_or_else(|| EngineError::NotAttached(key.to_string()))?;
        if force_fresh {
            instance.reset_buffer();
        }
        let size = instance.last_geometry();
        let teardown = instance.connect_token();

        let tracked = state.tracker.get(key).cloned();
        let durable_name = tracked
            .as_ref()
            .and_then(|t| t.durable_name.clone())
            .or(tab_durable);
        state.states.insert(key.clone(), ConnectionState::Connecting);

        Ok(ConnectPlan {
            working_directory,
            command,
            size,
            tracked,
            durable_name,
            teardown,
        })
    }

    async fn run_tiers(
        &self,
        key: &PersistKey,
        plan: ConnectPlan,
        force_fresh: bool,
    ) -> Result<SessionRef, EngineError> {
        let provider = &self.inner.provider;
        let mut bare_id = plan.tracked.as_ref().map(|t| t.session_id.clone());
        let mut durable_name = plan.durable_name.clone();
        let mut unverified: Option<TrackedSession> = None;

        if force_fresh {
            if let Some(old) = &plan.tracked {
                self.inner.state().tracker.forget(key);
                if let Err(e) = provider.close(&old.session_id).await {
                    log::debug!("closing {} for restart failed: {e}", old.session_id);
                }
                if old.durable_name.is_some() && old.durable_name == durable_name {
                    durable_name = None;
                }
            }
            bare_id = None;
        } else if let Some(old) = &plan.tracked {
            check_cancelled(key, &plan.teardown)?;
            match provider.is_active(&old.session_id).await {
                Ok(true) => {
                    self.bind_session(key, old.clone())?;
                    check_cancelled(key, &plan.teardown)?;
                    self.push_geometry(&old.session_id, plan.size).await;
                    return Ok(SessionRef {
                        session_id: old.session_id.clone(),
                        durable_name: old.durable_name.clone(),
                        tier: ConnectTier::Reused,
                    });
                }
                Ok(false) => {
                    self.inner.state().tracker.retire(&old.session_id);
                    if old.durable_name.is_some() {
                        check_cancelled(key, &plan.teardown)?;
                        if let Err(e) = provider.detach(&old.session_id).await {
                            log::debug!("detaching dead session {} failed: {e}", old.session_id);
                        }
                    }
                }
                Err(e) => {
                    log::debug!("liveness check for {} failed: {e}", old.session_id);
                    unverified = Some(old.clone());
                }
            }
        }

        if let Some(name) = durable_name.take() {
            check_cancelled(key, &plan.teardown)?;
            let request = AttachRequest {
                durable_name: name.clone(),
                working_directory: plan.working_directory.clone(),
                size: plan.size,
            };
            match self.inner.bridge.attach(request).await {
                Ok(Some(session_id)) => {
                    let tracked = TrackedSession {
                        session_id: session_id.clone(),
                        durable_name: Some(name.clone()),
                    };
                    self.bind_and_save(key, tracked).await?;
                    self.release_unverified(unverified, &session_id).await;
                    check_cancelled(key, &plan.teardown)?;
                    return Ok(SessionRef {
                        session_id,
                        durable_name: Some(name),
                        tier: ConnectTier::Reattached,
                    });
                }
                Ok(None) => {
                    log::info!("durable session {name} for {key} is gone, starting fresh");
                    self.purge_durable(key);
                }
                Err(e) => log::warn!("attaching {name} for {key} failed: {e}"),
            }
        } else if let Some(session_id) = bare_id {
            check_cancelled(key, &plan.teardown)?;
            let request = ReconnectRequest {
                session_id: session_id.clone(),
                durable_name: None,
                working_directory: Some(plan.working_directory.clone()),
                size: Some(plan.size),
            };
            match provider.reconnect(request).await {
                Ok(outcome) if outcome.success => {
                    let session_id = outcome.session_id.unwrap_or(session_id);
                    let tracked = TrackedSession {
                        session_id: session_id.clone(),
                        durable_name: None,
                    };
                    self.bind_session(key, tracked)?;
                    self.release_unverified(unverified, &session_id).await;
                    check_cancelled(key, &plan.teardown)?;
                    self.push_geometry(&session_id, plan.size).await;
                    return Ok(SessionRef {
                        session_id,
                        durable_name: None,
                        tier: ConnectTier::Reconnected,
                    });
                }
                Ok(_) => log::debug!("session {session_id} cannot be reconnected"),
                Err(e) => log::debug!("reconnecting {session_id} failed: {e}"),
            }
        }

        check_cancelled(key, &plan.teardown)?;
        let request = ConnectRequest {
            working_directory: plan.working_directory,
            command: plan.command,
            size: plan.size,
        };
        let spawned = provider.connect(request).await?;
        let tracked = TrackedSession {
            session_id: spawned.session_id.clone(),
            durable_name: spawned.durable_name.clone(),
        };
        self.bind_and_save(key, tracked).await?;
        self.release_unverified(unverified, &spawned.session_id).await;
        check_cancelled(key, &plan.teardown)?;
        Ok(SessionRef {
            session_id: spawned.session_id,
            durable_name: spawned.durable_name,
            tier: ConnectTier::Fresh,
        })
    }

    /// Bind, and save right away when a durable name was newly recorded.
    async fn bind_and_save(&self, key: &PersistKey, tracked: TrackedSession) -> Result<(), EngineError> {
        if self.bind_session(key, tracked)? {
            if let Err(e) = self.save_now().await {
                log::warn!("saving durable name for {key} failed: {e}");
            }
        }
        Ok(())
    }

    /// Make `tracked` the pane's current session.
    ///
    /// Routes its events to the pane, flushes output that arrived early,
    /// mirrors it onto the tab and rebinds the input slot. Returns `true`
    /// when a durable name was newly bound to the tab.
    ///
    /// A session created for a pane that was closed meanwhile is closed.
    fn bind_session(&self, key: &PersistKey, tracked: TrackedSession) -> Result<bool, EngineError> {
        let mut state = self.inner.state();
        let state = &mut *state;
        if !state.tabs.has_pane(key) {
            let provider = Arc::clone(&self.inner.provider);
            let session_id = tracked.session_id;
            log::debug!("{key} went away during connect, closing {session_id}");
            tokio::spawn(async move {
                if let Err(e) = provider.close(&session_id).await {
                    log::debug!("closing orphaned session {session_id} failed: {e}");
                }
            });
            return Err(EngineError::TabNotFound(key.to_string()));
        }

        state.tracker.bind(key, tracked.clone());
        if let Some(early) = state.pending.take(&tracked.session_id) {
            if let Some(instance) = state.cache.get_mut(key) {
                instance.vt_mut().write(&early);
            }
        }

        let mut newly_durable = false;
        if let Some(tab) = state.tabs.tab_mut(&key.project_id, &key.tab_id) {
            tab.set_session(key.pane, Some(tracked.session_id.clone()));
            if key.pane == Pane::Main {
                newly_durable =
                    tracked.durable_name.is_some() && tab.durable_name != tracked.durable_name;
                tab.durable_name = tracked.durable_name;
            }
        }
        state.rebind_input(key);
        self.inner.registry.mark_dirty();
        Ok(newly_durable)
    }

    /// Forget a durable session that no longer exists.
    fn purge_durable(&self, key: &PersistKey) {
        let mut state = self.inner.state();
        state.tracker.forget(key);
        if let Some(tab) = state.tabs.tab_mut(&key.project_id, &key.tab_id) {
            tab.set_session(key.pane, None);
            if key.pane == Pane::Main {
                tab.durable_name = None;
            }
        }
        state.rebind_input(key);
        drop(state);
        self.inner.registry.mark_dirty();
    }

    /// Let go of a session whose liveness could not be checked once another
    /// session replaced it. A durable one is detached so its tmux session
    /// stays with the replacement; a native one is closed.
    async fn release_unverified(&self, old: Option<TrackedSession>, current: &str) {
        let Some(old) = old.filter(|old| old.session_id != current) else {
            return;
        };
        let provider = &self.inner.provider;
        let result = if old.durable_name.is_some() {
            provider.detach(&old.session_id).await
        } else {
            provider.close(&old.session_id).await.map(|_| ())
        };
        if let Err(e) = result {
            log::debug!("releasing unverified session {} failed: {e}", old.session_id);
        }
    }

    async fn push_geometry(&self, session_id: &str, size: TermSize) {
        if let Err(e) = self.inner.provider.resize(session_id, size).await {
            log::debug!("resize of {session_id} failed: {e}");
        }
    }
}

fn check_cancelled(key: &PersistKey, teardown: &CancellationToken) -> Result<(), EngineError> {
    if teardown.is_cancelled() {
        return Err(EngineError::Cancelled(key.to_string()));
    }
    Ok(())
}
