//! Async boundaries between the session engine and PTY hosting.

use async_trait::async_trait;
use ctower_vt::TermSize;
use tokio::sync::mpsc;

use crate::pty::PtyError;

/// Opaque provider session identifier.
pub type SessionId = String;

/// Events emitted by a provider, keyed by session id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of PTY output, in read order.
    Output { session_id: SessionId, data: Vec<u8> },
    /// The session ended. Emitted at most once per session.
    Exit {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
}

impl PtyEvent {
    pub fn session_id(&self) -> &str {
        match self {
            PtyEvent::Output { session_id, .. } | PtyEvent::Exit { session_id, .. } => session_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<PtyEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PtyEvent>;

/// Create a fresh provider event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub working_directory: String,
    /// Command to run instead of an interactive shell.
    pub command: Option<String>,
    pub size: TermSize,
}

/// Result of a fresh connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnedSession {
    pub session_id: SessionId,
    /// Set when the session runs inside a durable wrapper.
    pub durable_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectRequest {
    pub session_id: SessionId,
    pub durable_name: Option<String>,
    pub working_directory: Option<String>,
    pub size: Option<TermSize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectOutcome {
    pub success: bool,
    pub session_id: Option<SessionId>,
}

impl ReconnectOutcome {
    pub fn connected(session_id: SessionId) -> Self {
        Self {
            success: true,
            session_id: Some(session_id),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            session_id: None,
        }
    }
}

/// Attach-by-name request for an existing durable session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachRequest {
    pub durable_name: String,
    pub working_directory: String,
    pub size: TermSize,
}

/// A live durable session as reported by the multiplexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DurableSessionInfo {
    pub name: String,
    pub working_directory: String,
    pub created_at: String,
}

/// Creates, drives and tears down OS pseudo-terminals.
#[async_trait]
pub trait PtyProvider: Send + Sync {
    /// Spawn a new session, inside a durable wrapper when the provider prefers one.
    async fn connect(&self, request: ConnectRequest) -> Result<SpawnedSession, PtyError>;

    /// Re-establish a session by id, or by durable name when one is given.
    async fn reconnect(&self, request: ReconnectRequest) -> Result<ReconnectOutcome, PtyError>;

    async fn is_active(&self, session_id: &str) -> Result<bool, PtyError>;

    async fn resize(&self, session_id: &str, size: TermSize) -> Result<(), PtyError>;

    async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError>;

    /// Drop the session's PTY. A durable wrapper keeps running.
    async fn detach(&self, session_id: &str) -> Result<(), PtyError>;

    /// End the session for good, durable wrapper included. Returns the exit code if known.
    async fn close(&self, session_id: &str) -> Result<Option<i32>, PtyError>;
}

/// Durable multiplexer sessions that survive application restarts.
#[async_trait]
pub trait DurableBridge: Send + Sync {
    /// Attach a new provider session to the named durable session.
    ///
    /// Returns `Ok(None)` when the durable session no longer exists.
    async fn attach(&self, request: AttachRequest) -> Result<Option<SessionId>, PtyError>;

    async fn list(&self) -> Result<Vec<DurableSessionInfo>, PtyError>;

    /// Kill every durable session whose name is not in `known`. Returns the killed names.
    async fn cleanup_orphaned(&self, known: &[String]) -> Result<Vec<String>, PtyError>;
}
