//! Declarative certification suites
//!
//! A suite names the harness configuration to provision with and the checks
//! to run, in order, against the instance:
//!
//! ```yaml
//! name: zabbix
//! harness:
//!   provisioning:
//!     backend: opennebula
//!     template: base
//!     disk: service_zabbix
//! checks:
//!   - name: zabbix_server is installed
//!     command: [which, zabbix_server]
//!   - name: zabbix-server service is running
//!     command: [systemctl, is-active, zabbix-server]
//!     expect: { stdout_equals: active }
//!     poll: { timeout: 60, delay: 1 }
//! ```

use anyhow::{Context, Result, bail};
use appliance_harness::{Command, Expect, HarnessConfig, PollSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// A named list of checks and the harness to run them on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    /// Suite name used in reports
    pub name: String,

    /// How to provision and reach the instance
    pub harness: HarnessConfig,

    /// Checks, run in order
    pub checks: Vec<Check>,
}

/// One remote command and the condition its result must meet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Name shown in the report
    pub name: String,

    /// Program and arguments, quoted individually
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Shell script run with `sh -c`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Condition on the result
    #[serde(default = "default_expect")]
    pub expect: Expect,

    /// Retry until the condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollConfig>,
}

fn default_expect() -> Expect {
    Expect::Success
}

/// Retry budget of a check, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Total budget
    pub timeout: u64,

    /// Delay between attempts
    #[serde(default = "default_delay")]
    pub delay: u64,

    /// Exponential backoff factor applied to the delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<u32>,

    /// Failure message; `{elapsed}`, `{attempts}` and `{timeout}` are substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_delay() -> u64 {
    5
}

impl Check {
    /// The command to run on the instance
    pub fn to_command(&self) -> Result<Command> {
        match (&self.command, &self.shell) {
            (Some(argv), None) => {
                let Some((program, args)) = argv.split_first() else {
                    bail!("check '{}': command must not be empty", self.name);
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
            (None, Some(script)) => Ok(Command::shell(script)),
            (Some(_), Some(_)) => {
                bail!("check '{}': set either command or shell, not both", self.name)
            }
            (None, None) => bail!("check '{}': one of command or shell is required", self.name),
        }
    }

    /// Poll budget; a check without `poll` runs exactly once
    pub fn poll_spec(&self) -> PollSpec {
        let Some(poll) = &self.poll else {
            return PollSpec::once();
        };

        let mut spec = PollSpec::new(
            Duration::from_secs(poll.timeout),
            Duration::from_secs(poll.delay),
        );
        if let Some(factor) = poll.backoff {
            // Backoff never waits longer than a quarter of the budget
            let max = Duration::from_secs((poll.timeout / 4).max(poll.delay));
            spec = spec.with_backoff(factor, max);
        }
        if let Some(message) = &poll.message {
            spec = spec.with_message(message.clone());
        }
        spec
    }
}

impl Suite {
    /// Parse and validate a suite file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read suite {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid suite {}", path.display()))
    }

    /// Parse and validate suite YAML
    pub fn parse(content: &str) -> Result<Self> {
        let suite: Suite = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        suite.validate()?;
        Ok(suite)
    }

    /// Check everything that can be checked without provisioning
    pub fn validate(&self) -> Result<()> {
        self.harness
            .validate()
            .context("Invalid harness configuration")?;

        if self.checks.is_empty() {
            bail!("suite '{}' has no checks", self.name);
        }

        let mut seen = HashSet::new();
        for check in &self.checks {
            if !seen.insert(check.name.as_str()) {
                bail!("duplicate check name '{}'", check.name);
            }
            check.to_command()?;
            check
                .poll_spec()
                .validate()
                .with_context(|| format!("check '{}'", check.name))?;
        }

        Ok(())
    }
}
