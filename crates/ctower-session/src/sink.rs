//! Rebindable input and key-handling slots.
//!
//! A cached instance registers its input subscription exactly once. What that
//! subscription does is decided by the slot's current target, which the engine
//! swaps as sessions come and go or broadcast mode changes.

use std::fmt;
use std::sync::Arc;

use ctower_pty::SessionId;

/// A value that can be swapped without re-registering whoever reads it.
pub struct Slot<T> {
    target: T,
    rebinds: u64,
}

impl<T> Slot<T> {
    pub fn new(target: T) -> Self {
        Self { target, rebinds: 0 }
    }

    pub fn get(&self) -> &T {
        &self.target
    }

    pub fn rebind(&mut self, target: T) {
        self.target = target;
        self.rebinds += 1;
    }

    /// How many times the target has been swapped.
    pub fn rebinds(&self) -> u64 {
        self.rebinds
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("target", &self.target)
            .field("rebinds", &self.rebinds)
            .finish()
    }
}

/// Where keystrokes typed into an instance go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputTarget {
    /// No live session yet. Input is dropped.
    Detached,
    /// The instance's own session.
    Session(SessionId),
    /// Every broadcast participant.
    Broadcast,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub meta: bool,
    pub alt: bool,
    pub shift: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPhase {
    Down,
    Up,
}

/// A key event as reported by the view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub phase: KeyPhase,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn down(key: &str, modifiers: Modifiers) -> Self {
        Self {
            key: key.to_string(),
            phase: KeyPhase::Down,
            modifiers,
        }
    }
}

/// What happens to a key after interception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyDisposition {
    /// Let the terminal handle the key.
    PassThrough,
    /// Open the search bar. The terminal never sees the key.
    OpenSearch,
    /// Swallow the key.
    Consumed,
}

pub type KeyInterceptor = Arc<dyn Fn(&KeyEvent) -> KeyDisposition + Send + Sync>;

/// Ctrl/Cmd+F opens search; everything else passes through.
pub fn default_key_interceptor() -> KeyInterceptor {
    Arc::new(|event: &KeyEvent| {
        let find = event.key.eq_ignore_ascii_case("f");
        if event.phase == KeyPhase::Down && find && (event.modifiers.ctrl || event.modifiers.meta) {
            KeyDisposition::OpenSearch
        } else {
            KeyDisposition::PassThrough
        }
    })
}
