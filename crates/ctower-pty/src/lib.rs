//! ctower-pty: PTY hosting and durable session plumbing for Control Tower.
//!
//! This crate owns the OS side of every terminal tab. It spawns shells on
//! pseudo-terminals, optionally wraps them in tmux sessions that outlive the
//! application, and reports output and exit events on a channel.
//!
//! # Architecture
//!
//! - [`PtyProvider`] / [`DurableBridge`] — The async boundaries the session
//!   engine talks to. Sessions are addressed by opaque string ids.
//! - [`PtyHandle`] — Low-level PTY process management (spawn, write, resize, kill).
//! - [`Tmux`] — Thin runner over the `tmux` CLI for durable sessions.
//! - [`PtyHost`] — The concrete provider and bridge backed by `portable-pty`.

pub mod host;
pub mod provider;
pub mod pty;
pub mod session;
pub mod shell;
pub mod tmux;

pub use host::{PtyHost, TmuxStatus};
pub use provider::{
    event_channel, AttachRequest, ConnectRequest, DurableBridge, DurableSessionInfo, EventReceiver,
    EventSender, PtyEvent, PtyProvider, ReconnectOutcome, ReconnectRequest, SessionId,
    SpawnedSession,
};
pub use pty::{PtyError, PtyHandle};
pub use session::{Backend, HostedSession, SessionInfo};
pub use tmux::{durable_name_for, Tmux, DURABLE_PREFIX};
