//! The outcome of one remote command invocation

use command_executor::ExitResult;
use serde::Serialize;
use std::fmt;

/// Exit status, captured output and the derived success flag of one command
///
/// Values are immutable once constructed: fields are private and only
/// exposed through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    exit_status: i32,
    stdout: String,
    stderr: Option<String>,
}

impl ExecutionResult {
    /// Create a result from its parts
    pub fn new(exit_status: i32, stdout: impl Into<String>, stderr: Option<String>) -> Self {
        Self {
            exit_status,
            stdout: stdout.into(),
            stderr,
        }
    }

    /// The command's exit status
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Captured standard output
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Captured standard output without surrounding whitespace
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Captured standard error, if the command wrote any
    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    /// True when the exit status is 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

impl From<ExitResult> for ExecutionResult {
    fn from(exit: ExitResult) -> Self {
        // Shells report death-by-signal as 128 + signal number
        #[cfg(unix)]
        let exit_status = exit
            .status
            .code
            .or(exit.status.signal.map(|s| 128 + s))
            .unwrap_or(-1);
        #[cfg(not(unix))]
        let exit_status = exit.status.code.unwrap_or(-1);

        let stderr = (!exit.stderr.is_empty()).then_some(exit.stderr);

        Self {
            exit_status,
            stdout: exit.stdout,
            stderr,
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.exit_status)?;
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            write!(f, ", stdout: {:?}", stdout)?;
        }
        if let Some(stderr) = self.stderr.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            write!(f, ", stderr: {:?}", stderr)?;
        }
        Ok(())
    }
}
