//! SSH remote execution backend using the OpenSSH CLI

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::Command;
use crate::error::Result;
use crate::launcher::Launcher;

/// Exit status the OpenSSH client reserves for its own failures
pub const SSH_CLIENT_ERROR_STATUS: i32 = 255;

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Target host (hostname or IP)
    host: String,
    /// SSH user (optional, uses system default if not specified)
    user: Option<String>,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    /// TCP connect timeout passed as `ConnectTimeout`
    connect_timeout: Option<Duration>,
    /// Multiplexed master connection socket
    control_path: Option<PathBuf>,
    /// How long an idle master connection stays open
    control_persist: Duration,
    /// Additional SSH arguments
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            connect_timeout: None,
            control_path: None,
            control_persist: Duration::from_secs(60),
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Reuse one master connection through the given control socket
    pub fn with_control_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_path = Some(path.into());
        self
    }

    /// Set how long an idle master connection is kept alive
    pub fn with_control_persist(mut self, persist: Duration) -> Self {
        self.control_persist = persist;
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// The configured host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The configured port, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The control socket, if multiplexing is enabled
    pub fn control_path(&self) -> Option<&Path> {
        self.control_path.as_deref()
    }

    /// Get the host string (user@host if user is specified)
    fn host_string(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }

    /// Build the local `ssh` invocation up to (and including) the destination
    fn base_command(&self) -> Command {
        let mut ssh_cmd = Command::new("ssh");

        // Never prompt; a missing key must fail instead of hanging
        ssh_cmd.arg("-o").arg("BatchMode=yes");

        if let Some(port) = self.port {
            ssh_cmd.arg("-p").arg(port.to_string());
        }

        if let Some(identity) = &self.identity_file {
            ssh_cmd.arg("-i").arg(identity);
        }

        if let Some(timeout) = self.connect_timeout {
            ssh_cmd
                .arg("-o")
                .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }

        if let Some(control) = &self.control_path {
            ssh_cmd
                .arg("-o")
                .arg("ControlMaster=auto")
                .arg("-o")
                .arg(format!("ControlPath={}", control.display()))
                .arg("-o")
                .arg(format!("ControlPersist={}", self.control_persist.as_secs()));
        }

        for arg in &self.extra_args {
            ssh_cmd.arg(arg);
        }

        ssh_cmd
    }

    /// Command that wraps `command` for execution on the remote host
    pub fn remote_command(&self, command: &Command) -> Command {
        let mut ssh_cmd = self.base_command();
        ssh_cmd.arg(self.host_string());
        ssh_cmd.arg(command.to_shell_string());
        ssh_cmd
    }

    /// Command that asks the master connection to exit
    ///
    /// Returns `None` when multiplexing is not configured.
    pub fn control_exit_command(&self) -> Option<Command> {
        let control = self.control_path.as_ref()?;
        let mut ssh_cmd = Command::new("ssh");
        ssh_cmd
            .arg("-o")
            .arg(format!("ControlPath={}", control.display()))
            .arg("-O")
            .arg("exit")
            .arg(self.host_string());
        Some(ssh_cmd)
    }
}

/// SSH launcher that wraps another launcher for remote execution
#[derive(Debug, Clone)]
pub struct SshLauncher<L> {
    inner: L,
    config: SshConfig,
}

impl<L> SshLauncher<L> {
    /// Create a new SSH launcher wrapping the given inner launcher
    pub fn new(inner: L, config: SshConfig) -> Self {
        Self { inner, config }
    }

    /// The SSH configuration used for every launch
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// The launcher the `ssh` client itself runs on
    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl SshLauncher<crate::backends::local::LocalLauncher> {
    /// Convenience constructor for SSH wrapping LocalLauncher
    pub fn to_host(host: impl Into<String>) -> Self {
        Self {
            inner: crate::backends::local::LocalLauncher,
            config: SshConfig::new(host),
        }
    }
}

#[async_trait]
impl<L> Launcher for SshLauncher<L>
where
    L: Launcher,
{
    type EventStream = L::EventStream;
    type Handle = L::Handle;

    async fn launch(&self, command: Command) -> Result<(Self::EventStream, Self::Handle)> {
        let ssh_cmd = self.config.remote_command(&command);
        tracing::debug!(host = %self.config.host, "ssh: {}", command);
        self.inner.launch(ssh_cmd).await
    }
}
