//! Broadcast mode: one keystroke stream fanned out to several tabs.

use std::collections::HashSet;

use crate::model::TabId;

#[derive(Debug, Default)]
pub struct BroadcastState {
    enabled: bool,
    participants: HashSet<TabId>,
}

impl BroadcastState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn broadcast mode on or off. Turning it off clears the participants,
    /// which are returned so their input can be rebound.
    pub fn set_mode(&mut self, enabled: bool) -> Vec<TabId> {
        self.enabled = enabled;
        if enabled {
            self.participants.iter().cloned().collect()
        } else {
            self.participants.drain().collect()
        }
    }

    /// Add or remove a tab. Returns whether it now participates.
    pub fn toggle(&mut self, tab_id: &str) -> bool {
        if self.participants.remove(tab_id) {
            false
        } else {
            self.participants.insert(tab_id.to_string());
            true
        }
    }

    pub fn remove(&mut self, tab_id: &str) -> bool {
        self.participants.remove(tab_id)
    }

    pub fn is_participant(&self, tab_id: &str) -> bool {
        self.participants.contains(tab_id)
    }

    /// Whether input typed into this tab goes to every participant.
    pub fn routes(&self, tab_id: &str) -> bool {
        self.enabled && self.is_participant(tab_id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &TabId> {
        self.participants.iter()
    }
}

/// Outcome of one broadcast write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the bytes were written to.
    pub sent: usize,
    /// Sessions whose write failed.
    pub failed: usize,
}
