use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::pty::{PtyError, PtyHandle};

/// What backs a hosted session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Plain PTY. Dies with the application.
    Native,
    /// A tmux client attached to a durable session.
    Durable { name: String },
}

/// A PTY session owned by the host.
///
/// The exit flag is shared with the session's I/O and watcher threads. Whoever
/// flips it first reports the exit, so an exit is emitted at most once and never
/// for a session that was detached or closed on purpose.
pub struct HostedSession {
    backend: Backend,
    pty: PtyHandle,
    working_directory: String,
    created_at: DateTime<Utc>,
    exit_claimed: Arc<AtomicBool>,
}

impl HostedSession {
    pub fn new(backend: Backend, pty: PtyHandle, working_directory: &str) -> Self {
        Self {
            backend,
            pty,
            working_directory: working_directory.to_string(),
            created_at: Utc::now(),
            exit_claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The tmux session name if this is a durable session.
    pub fn durable_name(&self) -> Option<&str> {
        match &self.backend {
            Backend::Durable { name } => Some(name),
            Backend::Native => None,
        }
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    pub fn pty_mut(&mut self) -> &mut PtyHandle {
        &mut self.pty
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.pty.write(data)
    }

    pub fn is_running(&self) -> bool {
        self.pty.is_alive()
    }

    pub(crate) fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit_claimed)
    }

    /// Claim the right to report this session's exit. Returns `true` once.
    pub fn claim_exit(&self) -> bool {
        !self.exit_claimed.swap(true, Ordering::SeqCst)
    }

    /// Kill the PTY child if it is still running. Returns its exit code if it had already exited.
    pub fn terminate(&self) -> Option<i32> {
        if self.pty.is_alive() {
            if let Err(e) = self.pty.kill() {
                log::warn!("failed to kill PTY child: {e}");
            }
            None
        } else {
            self.pty.try_wait()
        }
    }

    pub fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            working_directory: self.working_directory.clone(),
            created_at: self.created_at.to_rfc3339(),
            durable_name: self.durable_name().map(str::to_string),
        }
    }
}

/// Session information for listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub working_directory: String,
    pub created_at: String,
    pub durable_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctower_vt::TermSize;
    use portable_pty::CommandBuilder;

    fn spawn(backend: Backend) -> HostedSession {
        let pty = PtyHandle::spawn(CommandBuilder::new("/bin/sh"), TermSize::new(80, 24)).unwrap();
        HostedSession::new(backend, pty, "/tmp")
    }

    #[test]
    fn test_durable_name() {
        let native = spawn(Backend::Native);
        assert_eq!(native.durable_name(), None);
        native.terminate();

        let durable = spawn(Backend::Durable {
            name: "ct-1234abcd".to_string(),
        });
        assert_eq!(durable.durable_name(), Some("ct-1234abcd"));
        durable.terminate();
    }

    #[test]
    fn test_claim_exit_once() {
        let session = spawn(Backend::Native);
        assert!(session.claim_exit());
        assert!(!session.claim_exit());
        session.terminate();
    }

    #[test]
    fn test_info() {
        let session = spawn(Backend::Native);
        let info = session.info("abc");
        assert_eq!(info.session_id, "abc");
        assert_eq!(info.working_directory, "/tmp");
        assert!(DateTime::parse_from_rfc3339(&info.created_at).is_ok());
        session.terminate();
    }
}
