//! YAML configuration for the harness
//!
//! ```yaml
//! provisioning:
//!   backend: opennebula
//!   template: base
//!   disk: service_zabbix
//! ssh:
//!   user: root
//!   control_dir: /tmp/appliance-harness
//! timeouts:
//!   acquire: 600
//!   command: 120
//!   probe_interval: 5
//! context:
//!   NETWORK: "YES"
//!   SSH_PUBLIC_KEY: "${SSH_PUBLIC_KEY}"
//!   ONEAPP_ZABBIX_DB_PASSWORD: "${DB_PASSWORD:-changeme}"
//! ```
//!
//! Durations are whole seconds. Context values may reference environment
//! variables as `${VAR}` or `${VAR:-default}`.

use crate::manager::VmManager;
use crate::provision::{OpenNebulaBackend, ProvisioningBackend, StaticBackend};
use crate::transport::{SshTransportFactory, SshTransportSettings};
use crate::vm::VmAddress;
use command_executor::backends::SshLauncher;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// YAML did not match the schema
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Semantically invalid configuration
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Referenced environment variables without a default are unset
    #[error("environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Where instances come from
    pub provisioning: ProvisioningConfig,

    /// How instances are reached
    #[serde(default)]
    pub ssh: SshSection,

    /// Time budgets
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Context parameters passed to every instance
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

/// Provisioning backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend")]
pub enum ProvisioningConfig {
    /// Instantiate an OpenNebula template
    #[serde(rename = "opennebula")]
    OpenNebula {
        /// Template name or id
        template: String,
        /// Appliance image attached as disk
        #[serde(default, skip_serializing_if = "Option::is_none")]
        disk: Option<String>,
        /// Run the CLI on this frontend over SSH instead of locally
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frontend: Option<String>,
    },

    /// Use an existing host
    #[serde(rename = "static")]
    Static {
        /// Hostname or IP address
        host: String,
        /// SSH port
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
}

/// SSH settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    /// Remote user
    pub user: Option<String>,
    /// Port used when the backend does not report one
    pub port: Option<u16>,
    /// Private key
    pub identity_file: Option<PathBuf>,
    /// TCP connect timeout in seconds
    pub connect_timeout: u64,
    /// Directory for connection multiplexing sockets
    pub control_dir: Option<PathBuf>,
    /// Extra arguments for the ssh client
    pub extra_args: Vec<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        let defaults = SshTransportSettings::default();
        Self {
            user: defaults.user,
            port: defaults.port,
            identity_file: defaults.identity_file,
            connect_timeout: defaults.connect_timeout.as_secs(),
            control_dir: defaults.control_dir,
            extra_args: defaults.extra_args,
        }
    }
}

/// Time budgets in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Provisioning until the instance accepts commands
    pub acquire: u64,
    /// A single remote command
    pub command: u64,
    /// Delay between provisioning status queries
    pub probe_interval: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            acquire: 600,
            command: 120,
            probe_interval: 5,
        }
    }
}

impl HarnessConfig {
    /// Parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate YAML
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check constraints the schema cannot express
    pub fn validate(&self) -> Result<()> {
        match &self.provisioning {
            ProvisioningConfig::OpenNebula { template, .. } if template.trim().is_empty() => {
                return Err(ConfigError::Validation(
                    "provisioning.template must not be empty".to_string(),
                ));
            }
            ProvisioningConfig::Static { host, .. } if host.trim().is_empty() => {
                return Err(ConfigError::Validation(
                    "provisioning.host must not be empty".to_string(),
                ));
            }
            _ => {}
        }

        if self.timeouts.probe_interval == 0 {
            return Err(ConfigError::Validation(
                "timeouts.probe_interval must be at least 1 second".to_string(),
            ));
        }
        if self.timeouts.command == 0 {
            return Err(ConfigError::Validation(
                "timeouts.command must be at least 1 second".to_string(),
            ));
        }

        for key in self.context.keys() {
            let valid = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(ConfigError::Validation(format!(
                    "context key '{}' may only contain letters, digits and '_'",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Context with environment references expanded from the process environment
    pub fn resolved_context(&self) -> Result<BTreeMap<String, String>> {
        self.resolve_context_with(&std::env::vars().collect())
    }

    /// Context with environment references expanded
    ///
    /// Variables are looked up in `env` first, then in the process
    /// environment, then fall back to the reference's default.
    pub fn resolve_context_with(
        &self,
        env: &HashMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut missing = Vec::new();
        let mut resolved = BTreeMap::new();

        for (key, value) in &self.context {
            match resolve_env_vars(value, env) {
                Ok(value) => {
                    resolved.insert(key.clone(), value);
                }
                Err(ConfigError::EnvVarNotFound(names)) => missing.push(names),
                Err(other) => return Err(other),
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
        }
        Ok(resolved)
    }

    /// Provisioning timeout
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.acquire)
    }

    /// Per-command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command)
    }

    /// Settings for the SSH transports
    pub fn transport_settings(&self) -> SshTransportSettings {
        SshTransportSettings {
            user: self.ssh.user.clone(),
            port: self.ssh.port,
            identity_file: self.ssh.identity_file.clone(),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout),
            command_timeout: self.command_timeout(),
            control_dir: self.ssh.control_dir.clone(),
            extra_args: self.ssh.extra_args.clone(),
        }
    }

    /// Instantiate the configured backend
    pub fn build_backend(&self) -> Arc<dyn ProvisioningBackend> {
        match &self.provisioning {
            ProvisioningConfig::OpenNebula {
                template,
                disk,
                frontend,
            } => {
                let timeout = self.command_timeout();
                match frontend {
                    Some(host) => {
                        let backend = OpenNebulaBackend::with_launcher(
                            SshLauncher::to_host(host.clone()),
                            template.clone(),
                        )
                        .with_command_timeout(timeout);
                        Arc::new(match disk {
                            Some(disk) => backend.with_disk(disk.clone()),
                            None => backend,
                        })
                    }
                    None => {
                        let backend =
                            OpenNebulaBackend::new(template.clone()).with_command_timeout(timeout);
                        Arc::new(match disk {
                            Some(disk) => backend.with_disk(disk.clone()),
                            None => backend,
                        })
                    }
                }
            }
            ProvisioningConfig::Static { host, port } => {
                let mut address = VmAddress::new(host.clone());
                if let Some(port) = port {
                    address = address.with_port(*port);
                }
                Arc::new(StaticBackend::new(address))
            }
        }
    }

    /// Build a manager wired to the configured backend and SSH transport
    pub fn build_manager(&self) -> Result<VmManager> {
        let factory = SshTransportFactory::new(self.transport_settings()).map_err(|e| {
            ConfigError::Validation(format!(
                "cannot create ssh.control_dir {:?}: {}",
                self.ssh.control_dir, e
            ))
        })?;

        debug!("Building manager from configuration");
        Ok(VmManager::new(self.build_backend(), Arc::new(factory))
            .with_probe_interval(Duration::from_secs(self.timeouts.probe_interval)))
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references in `input`
pub fn resolve_env_vars(input: &str, env: &HashMap<String, String>) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut missing = Vec::new();

    let resolved = re.replace_all(input, |cap: &regex::Captures<'_>| {
        let expr = &cap[1];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        if let Some(value) = env.get(name) {
            value.clone()
        } else if let Ok(value) = std::env::var(name) {
            value
        } else if let Some(default) = default {
            default.to_string()
        } else {
            missing.push(name.to_string());
            String::new()
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(resolved.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENNEBULA: &str = r#"
provisioning:
  backend: opennebula
  template: base
  disk: service_zabbix
timeouts:
  acquire: 300
context:
  NETWORK: "YES"
  ONEAPP_DB_PASSWORD: "${CERTIFY_TEST_DB_PASSWORD}"
  ONEAPP_DB_NAME: "${CERTIFY_TEST_DB_NAME:-zabbix}"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = HarnessConfig::parse(OPENNEBULA).unwrap();

        assert_eq!(
            config.provisioning,
            ProvisioningConfig::OpenNebula {
                template: "base".to_string(),
                disk: Some("service_zabbix".to_string()),
                frontend: None,
            }
        );
        assert_eq!(config.timeouts.acquire, 300);
        assert_eq!(config.timeouts.command, 120);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(300));
        assert_eq!(config.ssh, SshSection::default());
        assert_eq!(config.ssh.user.as_deref(), Some("root"));
    }

    #[test]
    fn test_parse_static_backend() {
        let config = HarnessConfig::parse(
            "provisioning:\n  backend: static\n  host: 192.168.150.2\n  port: 2222\n",
        )
        .unwrap();
        assert_eq!(
            config.provisioning,
            ProvisioningConfig::Static {
                host: "192.168.150.2".to_string(),
                port: Some(2222),
            }
        );
        assert_eq!(config.build_backend().name(), "static");
    }

    #[test]
    fn test_unknown_backend_is_yaml_error() {
        let err = HarnessConfig::parse("provisioning:\n  backend: vsphere\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_validation() {
        let err = HarnessConfig::parse(
            "provisioning:\n  backend: static\n  host: h\ntimeouts:\n  probe_interval: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = HarnessConfig::parse(
            "provisioning:\n  backend: static\n  host: h\ncontext:\n  \"BAD KEY\": x\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_resolve_context() {
        let config = HarnessConfig::parse(OPENNEBULA).unwrap();
        let mut env = HashMap::new();
        env.insert(
            "CERTIFY_TEST_DB_PASSWORD".to_string(),
            "s3cret".to_string(),
        );

        let context = config.resolve_context_with(&env).unwrap();
        assert_eq!(context["NETWORK"], "YES");
        assert_eq!(context["ONEAPP_DB_PASSWORD"], "s3cret");
        assert_eq!(context["ONEAPP_DB_NAME"], "zabbix");
    }

    #[test]
    fn test_missing_env_var() {
        let config = HarnessConfig::parse(OPENNEBULA).unwrap();
        let err = config.resolve_context_with(&HashMap::new()).unwrap_err();
        match err {
            ConfigError::EnvVarNotFound(names) => {
                assert_eq!(names, "CERTIFY_TEST_DB_PASSWORD")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.yaml");
        std::fs::write(&path, OPENNEBULA).unwrap();

        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.context.len(), 3);

        let err = HarnessConfig::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn test_transport_settings() {
        let config = HarnessConfig::parse(
            "provisioning:\n  backend: static\n  host: h\nssh:\n  user: admin\n  connect_timeout: 3\n",
        )
        .unwrap();
        let settings = config.transport_settings();
        assert_eq!(settings.user.as_deref(), Some("admin"));
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        assert_eq!(settings.command_timeout, Duration::from_secs(120));
        assert!(!settings.extra_args.is_empty());
    }
}
