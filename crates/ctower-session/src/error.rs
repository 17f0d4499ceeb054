use ctower_pty::PtyError;

/// All error types for the session engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("tab not found: {0}")]
    TabNotFound(String),

    #[error("project not registered: {0}")]
    ProjectNotRegistered(String),

    #[error("no terminal instance for {0}")]
    NotAttached(String),

    #[error("connect failed for {key}: {message}")]
    ConnectFailed { key: String, message: String },

    #[error("connect cancelled for {0}")]
    Cancelled(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("sessions already restored")]
    AlreadyRestored,

    #[error("sessions must be restored before orphan cleanup")]
    RestoreRequired,

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// Stable error code string for logs and the UI.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Pty(_) => "pty_error",
            EngineError::Storage(_) => "storage_error",
            EngineError::TabNotFound(_) => "tab_not_found",
            EngineError::ProjectNotRegistered(_) => "project_not_registered",
            EngineError::NotAttached(_) => "not_attached",
            EngineError::ConnectFailed { .. } => "connect_failed",
            EngineError::Cancelled(_) => "connect_cancelled",
            EngineError::NotConnected(_) => "not_connected",
            EngineError::AlreadyRestored => "already_restored",
            EngineError::RestoreRequired => "restore_required",
            EngineError::TaskFailed(_) => "task_failed",
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Pty(_)
                | EngineError::Storage(_)
                | EngineError::ConnectFailed { .. }
                | EngineError::TaskFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ConnectFailed {
            key: "p1:t1".to_string(),
            message: "PTY spawn failed: no pty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "connect failed for p1:t1: PTY spawn failed: no pty"
        );
        assert_eq!(err.error_code(), "connect_failed");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        let cases: Vec<(EngineError, &str, bool)> = vec![
            (EngineError::TabNotFound("t".into()), "tab_not_found", false),
            (
                EngineError::ProjectNotRegistered("p".into()),
                "project_not_registered",
                false,
            ),
            (EngineError::Cancelled("k".into()), "connect_cancelled", false),
            (EngineError::AlreadyRestored, "already_restored", false),
            (EngineError::RestoreRequired, "restore_required", false),
            (
                EngineError::Pty(PtyError::SessionNotFound("s".into())),
                "pty_error",
                true,
            ),
        ];
        for (err, code, retryable) in cases {
            assert_eq!(err.error_code(), code);
            assert_eq!(err.is_retryable(), retryable, "{code}");
        }
    }
}
