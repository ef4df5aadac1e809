//! Command transport to a single remote host
//!
//! A transport runs exactly one command per call and never retries; retrying
//! is the poller's job. The SSH implementation keeps one multiplexed master
//! connection per handle and throws it away after any transport failure so
//! the next call starts from a fresh connection.

use crate::error::TransportError;
use crate::result::ExecutionResult;
use crate::vm::{InstanceId, VmAddress};
use async_trait::async_trait;
use command_executor::backends::ssh::SSH_CLIENT_ERROR_STATUS;
use command_executor::backends::{LocalLauncher, SshConfig, SshLauncher};
use command_executor::{Command, Launcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Runs commands on one host
#[async_trait]
pub trait Transport: Send {
    /// Run `command` and return its completed result
    ///
    /// A non-zero exit is a successful call. Errors mean the command's
    /// outcome is unknown.
    async fn execute(&mut self, command: &Command) -> Result<ExecutionResult, TransportError>;

    /// Drop any cached connection state
    async fn close(&mut self) {}
}

/// Creates the transport a freshly provisioned instance is bound to
pub trait TransportFactory: Send + Sync {
    /// Build a transport for the instance at `address`
    fn connect(&self, instance: &InstanceId, address: &VmAddress) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&InstanceId, &VmAddress) -> Box<dyn Transport> + Send + Sync,
{
    fn connect(&self, instance: &InstanceId, address: &VmAddress) -> Box<dyn Transport> {
        self(instance, address)
    }
}

/// Settings shared by every SSH transport a factory creates
#[derive(Debug, Clone)]
pub struct SshTransportSettings {
    /// Remote user
    pub user: Option<String>,
    /// Port used when the address does not carry one
    pub port: Option<u16>,
    /// Private key
    pub identity_file: Option<PathBuf>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Upper bound for a single command
    pub command_timeout: Duration,
    /// Directory holding per-instance control sockets; `None` disables multiplexing
    pub control_dir: Option<PathBuf>,
    /// Extra arguments for the ssh client
    pub extra_args: Vec<String>,
}

impl Default for SshTransportSettings {
    fn default() -> Self {
        Self {
            user: Some("root".to_string()),
            port: None,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
            control_dir: None,
            extra_args: vec![
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "LogLevel=ERROR".to_string(),
            ],
        }
    }
}

/// Builds [`SshTransport`]s with one control socket per instance
#[derive(Debug, Clone)]
pub struct SshTransportFactory {
    settings: SshTransportSettings,
}

impl SshTransportFactory {
    /// Create the factory, making sure the control socket directory exists
    pub fn new(settings: SshTransportSettings) -> std::io::Result<Self> {
        if let Some(dir) = &settings.control_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { settings })
    }

    /// Settings applied to each transport
    pub fn settings(&self) -> &SshTransportSettings {
        &self.settings
    }

    /// SSH configuration for one instance
    pub fn ssh_config(&self, instance: &InstanceId, address: &VmAddress) -> SshConfig {
        let settings = &self.settings;
        let mut config =
            SshConfig::new(address.host.clone()).with_connect_timeout(settings.connect_timeout);

        if let Some(user) = &settings.user {
            config = config.with_user(user.clone());
        }
        if let Some(port) = address.port.or(settings.port) {
            config = config.with_port(port);
        }
        if let Some(identity) = &settings.identity_file {
            config = config.with_identity_file(identity.clone());
        }
        if let Some(dir) = &settings.control_dir {
            config = config.with_control_path(control_socket(dir, instance));
        }
        for arg in &settings.extra_args {
            config = config.with_extra_arg(arg.clone());
        }

        config
    }
}

impl TransportFactory for SshTransportFactory {
    fn connect(&self, instance: &InstanceId, address: &VmAddress) -> Box<dyn Transport> {
        Box::new(SshTransport::new(
            self.ssh_config(instance, address),
            self.settings.command_timeout,
        ))
    }
}

fn control_socket(dir: &Path, instance: &InstanceId) -> PathBuf {
    let name: String = instance
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("{}.sock", name))
}

/// Transport running commands through the OpenSSH client
pub struct SshTransport<L = LocalLauncher> {
    launcher: SshLauncher<L>,
    command_timeout: Duration,
    channel_open: bool,
}

impl SshTransport<LocalLauncher> {
    /// Transport using the local `ssh` binary
    pub fn new(config: SshConfig, command_timeout: Duration) -> Self {
        Self::with_launcher(LocalLauncher, config, command_timeout)
    }
}

impl<L: Launcher> SshTransport<L> {
    /// Transport whose `ssh` client runs through `launcher`
    pub fn with_launcher(launcher: L, config: SshConfig, command_timeout: Duration) -> Self {
        Self {
            launcher: SshLauncher::new(launcher, config),
            command_timeout,
            channel_open: false,
        }
    }

    fn host(&self) -> String {
        self.launcher.config().host().to_string()
    }

    /// Tear down the cached master connection, if any
    async fn discard_channel(&mut self) {
        let config = self.launcher.config().clone();
        let Some(exit) = config.control_exit_command() else {
            return;
        };

        if self.channel_open {
            debug!(host = %config.host(), "Discarding cached ssh channel");
            if let Err(e) = self
                .launcher
                .inner()
                .execute_with_timeout(exit, Duration::from_secs(5))
                .await
            {
                debug!("ssh -O exit failed: {}", e);
            }
        }
        self.channel_open = false;

        if let Some(path) = config.control_path() {
            match async_fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove control socket {}: {}", path.display(), e),
            }
        }
    }
}

#[async_trait]
impl<L: Launcher> Transport for SshTransport<L> {
    async fn execute(&mut self, command: &Command) -> Result<ExecutionResult, TransportError> {
        let outcome = self
            .launcher
            .execute_with_timeout(command.clone(), self.command_timeout)
            .await;

        let error = match outcome {
            Ok(exit) if exit.status.code == Some(SSH_CLIENT_ERROR_STATUS) => {
                classify_ssh_failure(&self.host(), &exit.stderr)
            }
            Ok(exit) => {
                self.channel_open = true;
                return Ok(ExecutionResult::from(exit));
            }
            Err(command_executor::Error::TimedOut { after }) => TransportError::Timeout {
                host: self.host(),
                after,
            },
            Err(e) => TransportError::Spawn(e.to_string()),
        };

        debug!(host = %self.host(), "Transport error: {}", error);
        self.discard_channel().await;
        Err(error)
    }

    async fn close(&mut self) {
        self.discard_channel().await;
    }
}

/// Map the diagnostics of a failed `ssh` invocation to a transport error
///
/// The OpenSSH client exits with 255 on its own errors, which is ambiguous
/// with a remote command exiting 255; such a command is reported as a
/// closed channel.
pub fn classify_ssh_failure(host: &str, stderr: &str) -> TransportError {
    let reason = stderr
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("ssh exited with status 255")
        .to_string();
    let host = host.to_string();

    const AUTH: &[&str] = &[
        "Permission denied",
        "Too many authentication failures",
        "Host key verification failed",
    ];
    const UNREACHABLE: &[&str] = &[
        "Connection refused",
        "Connection timed out",
        "No route to host",
        "Network is unreachable",
        "Could not resolve hostname",
        "Connection reset",
        "Connection closed by",
    ];

    if AUTH.iter().any(|m| stderr.contains(m)) {
        TransportError::AuthenticationFailed { host, reason }
    } else if UNREACHABLE.iter().any(|m| stderr.contains(m)) {
        TransportError::ConnectionRefused { host, reason }
    } else {
        TransportError::ChannelClosed { host, reason }
    }
}
