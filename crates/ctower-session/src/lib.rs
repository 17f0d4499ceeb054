//! ctower-session: the terminal session engine for Control Tower.
//!
//! Keeps each terminal tab bound to exactly one live PTY session across view
//! mounts, in-process reconnects and application restarts.
//!
//! # Architecture
//!
//! - [`SessionManager`] — The engine facade. Owns tabs, cached instances and
//!   session tracking behind one lock; everything async runs outside it.
//! - [`InstanceCache`] — Terminal instances that outlive their view surfaces.
//! - `reconnect` — The four-tier connect (reuse, reattach, reconnect, fresh).
//! - [`ResizeNegotiator`] — Debounced geometry changes, one resize per burst.
//! - [`BroadcastState`] — Which tabs mirror typed input.
//! - [`RegistryStore`] — Where the tab set is persisted between runs.

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
mod pump;
mod reconnect;
pub mod registry;
pub mod resize;
pub mod sink;
pub mod tabs;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcast::{BroadcastReport, BroadcastState};
pub use cache::{CachedInstance, InstanceCache, InstanceHandle, SurfaceId};
pub use config::{clamp_font_size, EngineConfig, MAX_FONT_SIZE, MIN_FONT_SIZE};
pub use error::EngineError;
pub use manager::{AttachOutcome, SessionManager};
pub use model::{
    CommandKind, ConnectTier, ConnectionState, Pane, PersistKey, ProjectId, ProjectTerminals,
    SessionRef, Tab, TabId,
};
pub use reconnect::TrackedSession;
pub use registry::{RegistryStore, SqliteRegistry};
pub use resize::ResizeNegotiator;
pub use sink::{
    default_key_interceptor, InputTarget, KeyDisposition, KeyEvent, KeyInterceptor, KeyPhase,
    Modifiers,
};
pub use tabs::TabStore;
