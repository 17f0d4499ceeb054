use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ctower_vt::TermSize;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// Errors from PTY and durable-session operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("tmux error: {0}")]
    Tmux(String),

    #[error("durable sessions unavailable: tmux not found")]
    DurableUnavailable,

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl PtyError {
    /// Stable error code string for logs and the UI.
    pub fn error_code(&self) -> &'static str {
        match self {
            PtyError::SpawnFailed(_) => "pty_spawn_failed",
            PtyError::Io(_) => "pty_io_error",
            PtyError::ResizeFailed(_) => "pty_resize_failed",
            PtyError::SessionNotFound(_) => "session_not_found",
            PtyError::Tmux(_) => "tmux_error",
            PtyError::DurableUnavailable => "durable_unavailable",
            PtyError::TaskFailed(_) => "task_failed",
        }
    }
}

/// Child process shared between the owning session and its watcher threads.
pub type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// Owns a portable-pty child process, master, reader, and writer.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
    child: SharedChild,
}

impl PtyHandle {
    /// Open a PTY of the given size and spawn `cmd` on its slave side.
    pub fn spawn(cmd: CommandBuilder, size: TermSize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn command: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        Ok(Self {
            master: pair.master,
            reader: Some(reader),
            writer,
            child: Arc::new(Mutex::new(child)),
        })
    }

    /// Resize the PTY to new dimensions.
    pub fn resize(&self, size: TermSize) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    /// Write bytes to the PTY master (user input -> shell).
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Extract the PTY reader for use in a dedicated I/O thread.
    ///
    /// Returns `None` once the reader has already been taken.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Shared handle to the child, for exit watchers.
    pub fn child(&self) -> SharedChild {
        Arc::clone(&self.child)
    }

    /// Check if the child process is still alive.
    ///
    /// A poisoned child lock is treated as exited.
    pub fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    /// Get the child process exit code if it has exited.
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&self) -> Option<i32> {
        try_wait_child(&self.child)
    }

    /// Kill the child process.
    pub fn kill(&self) -> Result<(), PtyError> {
        lock_child(&self.child).kill()?;
        Ok(())
    }
}

/// Exit code of a shared child, if it has exited.
pub(crate) fn try_wait_child(child: &SharedChild) -> Option<i32> {
    match lock_child(child).try_wait() {
        Ok(Some(status)) => Some(status.exit_code() as i32),
        _ => None,
    }
}

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Box<dyn Child + Send + Sync>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn sh() -> CommandBuilder {
        CommandBuilder::new("/bin/sh")
    }

    #[test]
    fn test_spawn_pty() {
        let handle = PtyHandle::spawn(sh(), TermSize::new(80, 24));
        assert!(handle.is_ok(), "Failed to spawn PTY: {:?}", handle.err());
        let handle = handle.unwrap();
        assert!(handle.is_alive());
        handle.kill().unwrap();
    }

    #[test]
    fn test_write_read_echo() {
        let mut handle = PtyHandle::spawn(sh(), TermSize::new(80, 24)).unwrap();
        let mut reader = handle.take_reader().unwrap();
        assert!(handle.take_reader().is_none());

        handle.write(b"echo CTOWER_TEST_OK\n").unwrap();

        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains("CTOWER_TEST_OK\r\n") {
                        break;
                    }
                }
            }
        }

        let text = String::from_utf8_lossy(&output);
        assert!(
            text.contains("CTOWER_TEST_OK"),
            "Expected output to contain CTOWER_TEST_OK, got: {text}"
        );
        handle.kill().unwrap();
    }

    #[test]
    fn test_resize() {
        let handle = PtyHandle::spawn(sh(), TermSize::new(80, 24)).unwrap();
        let result = handle.resize(TermSize::new(120, 40));
        assert!(result.is_ok(), "Resize failed: {:?}", result.err());
        handle.kill().unwrap();
    }

    #[test]
    fn test_child_exit_code() {
        let mut cmd = sh();
        cmd.arg("-c");
        cmd.arg("exit 3");
        let mut handle = PtyHandle::spawn(cmd, TermSize::new(80, 24)).unwrap();

        let mut reader = handle.take_reader().unwrap();
        let drain = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
        });
        let _ = drain.join();

        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && handle.try_wait().is_none() {
            thread::sleep(Duration::from_millis(50));
        }

        assert!(!handle.is_alive(), "Child should have exited");
        assert_eq!(handle.try_wait(), Some(3));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PtyError::SessionNotFound("x".into()).error_code(),
            "session_not_found"
        );
        assert_eq!(PtyError::DurableUnavailable.error_code(), "durable_unavailable");
        assert_eq!(
            PtyError::SpawnFailed("boom".into()).to_string(),
            "PTY spawn failed: boom"
        );
    }
}
