//! Error types for the appliance harness
//!
//! A command that runs and exits non-zero is not an error: it is an
//! [`ExecutionResult`](crate::ExecutionResult) the caller inspects. The types
//! here cover the cases where no result could be produced.

use crate::config::ConfigError;
use crate::poll::PollError;
use crate::vm::{InstanceId, VmState};
use std::time::Duration;
use thiserror::Error;

/// Failure to reach or talk to a host, distinct from a command failing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The host could not be reached or refused the connection
    #[error("connection to {host} refused: {reason}")]
    ConnectionRefused {
        /// Host that was contacted
        host: String,
        /// Diagnostic reported by the transport
        reason: String,
    },

    /// The host rejected our credentials
    #[error("authentication to {host} failed: {reason}")]
    AuthenticationFailed {
        /// Host that was contacted
        host: String,
        /// Diagnostic reported by the transport
        reason: String,
    },

    /// The session ended before the command reported an exit status
    #[error("channel to {host} closed unexpectedly: {reason}")]
    ChannelClosed {
        /// Host that was contacted
        host: String,
        /// Diagnostic reported by the transport
        reason: String,
    },

    /// The command did not complete within the per-command budget
    #[error("command on {host} did not complete within {after:?}")]
    Timeout {
        /// Host that was contacted
        host: String,
        /// The budget that was exceeded
        after: Duration,
    },

    /// The local transport client could not be started
    #[error("failed to start transport client: {0}")]
    Spawn(String),
}

impl TransportError {
    /// Errors that retrying cannot fix; they fail the owning handle
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::AuthenticationFailed { .. })
    }
}

/// Error reported by a provisioning backend
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend CLI could not be run
    #[error("backend command failed: {0}")]
    Command(#[from] command_executor::Error),

    /// The backend CLI ran but reported failure
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandStatus {
        /// The command line that failed
        command: String,
        /// Its exit status
        status: i32,
        /// Its standard error
        stderr: String,
    },

    /// The backend answered with something we could not understand
    #[error("unexpected backend output: {0}")]
    Parse(String),

    /// The instance does not exist (anymore)
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// The backend refused the request
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// A VM could not be brought to a reachable state
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The backend did not allocate an instance at all
    #[error("failed to request instance: {0}")]
    Request(#[source] BackendError),

    /// The instance did not become reachable in time
    #[error(
        "instance {instance} not reachable after {elapsed:?}: {}",
        .last_error.as_deref().unwrap_or("no error observed")
    )]
    Timeout {
        /// The instance that was rolled back
        instance: InstanceId,
        /// Time spent waiting
        elapsed: Duration,
        /// Last backend or transport error seen while waiting
        last_error: Option<String>,
    },

    /// The backend reported the instance as failed
    #[error("instance {instance} failed during provisioning after {elapsed:?}: {reason}")]
    InstanceFailed {
        /// The instance that was rolled back
        instance: InstanceId,
        /// Time spent before the failure was observed
        elapsed: Duration,
        /// Backend supplied reason
        reason: String,
    },

    /// Provisioning was cancelled from outside
    #[error("provisioning of {instance} cancelled after {elapsed:?}")]
    Cancelled {
        /// The instance that was rolled back
        instance: InstanceId,
        /// Time spent before cancellation
        elapsed: Duration,
    },
}

/// Umbrella error for harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Command execution was requested on a handle that is not `Ready`
    #[error("vm {instance} is {state}, not ready for commands")]
    NotReady {
        /// The handle's instance
        instance: InstanceId,
        /// The state it is in
        state: VmState,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Provisioning failure
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Poll did not succeed
    #[error(transparent)]
    Poll(#[from] PollError),

    /// A poll specification violates its invariants
    #[error("invalid poll specification: {0}")]
    InvalidPollSpec(String),

    /// Backend failure outside of provisioning (e.g. during release)
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HarnessError {
    /// Whether a poller may treat this as a failed attempt and try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarnessError::Transport(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, HarnessError>;
