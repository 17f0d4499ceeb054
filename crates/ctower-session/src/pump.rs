//! Applies provider events to the instances that own them.

use std::collections::HashMap;
use std::sync::Arc;

use ctower_pty::{EventReceiver, PtyEvent, SessionId};
use tokio::task::JoinHandle;

use crate::manager::SessionManager;
use crate::model::ConnectionState;

/// Output held for a session that is not routed yet, per session.
const MAX_PENDING_BYTES: usize = 1 << 20;

/// Output that arrived before its session was bound to a key.
#[derive(Debug, Default)]
pub(crate) struct PendingOutput {
    buffers: HashMap<SessionId, Vec<u8>>,
}

impl PendingOutput {
    pub(crate) fn push(&mut self, session_id: &str, data: &[u8]) {
        let buffer = self.buffers.entry(session_id.to_string()).or_default();
        buffer.extend_from_slice(data);
        if buffer.len() > MAX_PENDING_BYTES {
            let excess = buffer.len() - MAX_PENDING_BYTES;
            buffer.drain(..excess);
        }
    }

    pub(crate) fn take(&mut self, session_id: &str) -> Option<Vec<u8>> {
        self.buffers.remove(session_id)
    }

    pub(crate) fn discard(&mut self, session_id: &str) {
        self.buffers.remove(session_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }
}

impl SessionManager {
    /// Consume provider events until the channel closes or the engine shuts down.
    ///
    /// Events are applied one at a time in arrival order, so chunks of one
    /// session always reach its buffer in the order they were read.
    pub fn start_event_pump(&self, mut events: EventReceiver) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                let Some(inner) = weak.upgrade() else { break };
                SessionManager { inner }.apply_event(event);
            }
            log::debug!("event pump stopped");
        })
    }

    pub(crate) fn apply_event(&self, event: PtyEvent) {
        match event {
            PtyEvent::Output { session_id, data } => self.apply_output(&session_id, &data),
            PtyEvent::Exit {
                session_id,
                exit_code,
            } => self.apply_exit(&session_id, exit_code),
        }
    }

    fn apply_output(&self, session_id: &str, data: &[u8]) {
        let write_backs = {
            let mut state = self.inner.state();
            let state = &mut *state;
            match state.tracker.route(session_id) {
                Some(key) => match state.cache.get_mut(key) {
                    Some(instance) => {
                        instance.vt_mut().write(data);
                        instance.vt_mut().take_pty_writes()
                    }
                    None => {
                        log::debug!("dropping output for {key}: no instance");
                        Vec::new()
                    }
                },
                None if state.tracker.is_retired(session_id) => Vec::new(),
                None => {
                    state.pending.push(session_id, data);
                    Vec::new()
                }
            }
        };

        if write_backs.is_empty() {
            return;
        }
        // Device status replies and similar go back to the PTY in order.
        let provider = Arc::clone(&self.inner.provider);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            for data in write_backs {
                if let Err(e) = provider.write(&session_id, data.as_bytes()).await {
                    log::debug!("write-back to {session_id} failed: {e}");
                    return;
                }
            }
        });
    }

    fn apply_exit(&self, session_id: &str, exit_code: Option<i32>) {
        let mut state = self.inner.state();
        let Some(key) = state.tracker.unroute(session_id) else {
            state.pending.discard(session_id);
            state.tracker.clear_retired(session_id);
            return;
        };

        log::info!("session {session_id} for {key} exited with {exit_code:?}");
        state.tabs.set_exited(&key, exit_code);
        state
            .states
            .insert(key.clone(), ConnectionState::Exited(exit_code));
        state.rebind_input(&key);
        drop(state);
        self.inner.registry.mark_dirty();
    }
}
