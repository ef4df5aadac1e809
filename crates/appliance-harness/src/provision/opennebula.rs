//! OpenNebula backend driving the `onetemplate` and `onevm` CLIs

use super::{InstanceStatus, ProvisionRequest, ProvisioningBackend};
use crate::error::BackendError;
use crate::vm::{InstanceId, VmAddress};
use async_trait::async_trait;
use command_executor::backends::LocalLauncher;
use command_executor::{Command, Launcher};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

// VM_STATE values
const STATE_ACTIVE: u32 = 3;
const STATE_DONE: u32 = 6;
const STATE_FAILED: u32 = 7;
const STATE_CLONING_FAILURE: u32 = 11;
const STATE_INACTIVE: &[(u32, &str)] = &[
    (4, "stopped"),
    (5, "suspended"),
    (8, "powered off"),
    (9, "undeployed"),
];

// LCM_STATE values
const LCM_RUNNING: u32 = 3;
const LCM_FAILURES: &[u32] = &[14, 36, 37, 38, 39, 40, 41, 42, 44, 46, 47, 48, 49, 50, 60];

/// Instantiates VM templates through the OpenNebula CLI
///
/// The CLI runs through any [`Launcher`], so a frontend reachable only over
/// SSH can be driven with an `SshLauncher`.
#[derive(Debug, Clone)]
pub struct OpenNebulaBackend<L = LocalLauncher> {
    launcher: L,
    template: String,
    disk: Option<String>,
    command_timeout: Duration,
}

impl OpenNebulaBackend<LocalLauncher> {
    /// Backend instantiating `template` with the local CLI tools
    pub fn new(template: impl Into<String>) -> Self {
        Self::with_launcher(LocalLauncher, template)
    }
}

impl<L: Launcher> OpenNebulaBackend<L> {
    /// Backend running the CLI tools through `launcher`
    pub fn with_launcher(launcher: L, template: impl Into<String>) -> Self {
        Self {
            launcher,
            template: template.into(),
            disk: None,
            command_timeout: Duration::from_secs(60),
        }
    }

    /// Attach an image as the appliance disk (`--disk`)
    pub fn with_disk(mut self, disk: impl Into<String>) -> Self {
        self.disk = Some(disk.into());
        self
    }

    /// Upper bound for each CLI call
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// The `onetemplate instantiate` command for a request
    pub fn instantiate_command(&self, request: &ProvisionRequest) -> Command {
        let mut cmd = Command::new("onetemplate");
        cmd.arg("instantiate").arg(&self.template);

        if let Some(name) = &request.name {
            cmd.arg("--name").arg(name);
        }
        if !request.context.is_empty() {
            cmd.arg("--context").arg(format_context(&request.context));
        }
        if let Some(disk) = &self.disk {
            cmd.arg("--disk").arg(disk);
        }

        cmd
    }

    async fn run(&self, command: Command) -> Result<String, BackendError> {
        self.run_with_timeout(command, self.command_timeout).await
    }

    async fn run_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let rendered = command.to_shell_string();
        debug!("opennebula: {}", rendered);

        let exit = self.launcher.execute_with_timeout(command, timeout).await?;

        if exit.success() {
            Ok(exit.stdout)
        } else {
            Err(BackendError::CommandStatus {
                command: rendered,
                status: exit.status.code.unwrap_or(-1),
                stderr: exit.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl<L: Launcher> ProvisioningBackend for OpenNebulaBackend<L> {
    fn name(&self) -> &str {
        "opennebula"
    }

    async fn instantiate(&self, request: &ProvisionRequest) -> Result<InstanceId, BackendError> {
        // A name lets a VM be found again when the CLI's answer is lost
        let name = request.name.clone().unwrap_or_else(unique_name);
        let request = ProvisionRequest {
            name: Some(name.clone()),
            ..request.clone()
        };
        let timeout = request
            .timeout
            .map_or(self.command_timeout, |t| t.min(self.command_timeout));

        let outcome = match self
            .run_with_timeout(self.instantiate_command(&request), timeout)
            .await
        {
            Ok(stdout) => parse_instantiate_output(&stdout),
            Err(err) => Err(err),
        };

        let id = match outcome {
            Ok(id) => id,
            // The CLI was killed or answered garbage; the VM may exist anyway
            Err(err @ (BackendError::Command(_) | BackendError::Parse(_))) => {
                self.recover_by_name(&name, err).await?
            }
            Err(err) => return Err(err),
        };
        info!(template = %self.template, instance = %id, %name, "Instantiated template");
        Ok(id)
    }

    async fn status(&self, instance: &InstanceId) -> Result<InstanceStatus, BackendError> {
        let mut cmd = Command::new("onevm");
        cmd.arg("show").arg(instance.as_str()).arg("--json");

        match self.run(cmd).await {
            Ok(stdout) => parse_vm_status(&stdout),
            Err(err) if is_not_found(&err) => Ok(InstanceStatus::Gone),
            Err(err) => Err(err),
        }
    }

    async fn destroy(&self, instance: &InstanceId) -> Result<(), BackendError> {
        let mut cmd = Command::new("onevm");
        cmd.arg("terminate").arg("--hard").arg(instance.as_str());

        match self.run(cmd).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Err(BackendError::NotFound(instance.clone())),
            Err(err) => Err(err),
        }
    }

    async fn list(&self) -> Result<Vec<InstanceId>, BackendError> {
        let mut cmd = Command::new("onevm");
        cmd.arg("list").arg("--json");
        parse_vm_list(&self.run(cmd).await?)
    }
}

impl<L: Launcher> OpenNebulaBackend<L> {
    /// Look up the VM an interrupted instantiate may have created
    ///
    /// Returns `err` unless exactly one VM carries `name`.
    async fn recover_by_name(
        &self,
        name: &str,
        err: BackendError,
    ) -> Result<InstanceId, BackendError> {
        warn!(%name, "Instantiate outcome unknown ({}), looking the VM up by name", err);

        let mut cmd = Command::new("onevm");
        cmd.arg("list").arg("--json");
        let listed = match self.run(cmd).await {
            Ok(json) => find_vms_by_name(&json, name),
            Err(e) => Err(e),
        };
        let mut found = match listed {
            Ok(ids) => ids,
            Err(e) => {
                warn!(%name, "Failed to list VMs: {}", e);
                return Err(err);
            }
        };

        match found.len() {
            1 => {
                let id = found.remove(0);
                warn!(%name, instance = %id, "Recovered instance of interrupted instantiate");
                Ok(id)
            }
            0 => Err(err),
            n => {
                warn!(%name, "{} VMs share the name, not adopting any", n);
                Err(err)
            }
        }
    }
}

fn unique_name() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!(
        "appliance-harness-{}-{}-{}",
        std::process::id(),
        millis,
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn is_not_found(err: &BackendError) -> bool {
    match err {
        BackendError::CommandStatus { stderr, .. } => {
            stderr.contains("does not exist") || stderr.contains("Error getting")
        }
        _ => false,
    }
}

/// Render context parameters as the CLI's `KEY="value",...` list
pub fn format_context(context: &BTreeMap<String, String>) -> String {
    context
        .iter()
        .map(|(key, value)| {
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            format!("{}=\"{}\"", key, escaped)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Extract the id from `onetemplate instantiate` output (`VM ID: 42`)
pub fn parse_instantiate_output(stdout: &str) -> Result<InstanceId, BackendError> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("VM ID:"))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(InstanceId::new)
        .ok_or_else(|| BackendError::Parse(format!("no VM ID in output: {:?}", stdout.trim())))
}

/// Interpret `onevm show --json`
pub fn parse_vm_status(json: &str) -> Result<InstanceStatus, BackendError> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| BackendError::Parse(format!("onevm show: {}", e)))?;
    let vm = doc
        .get("VM")
        .ok_or_else(|| BackendError::Parse("onevm show: missing VM object".to_string()))?;

    let state = number_field(vm, "STATE")
        .ok_or_else(|| BackendError::Parse("onevm show: missing STATE".to_string()))?;
    let lcm_state = number_field(vm, "LCM_STATE").unwrap_or(0);

    let status = match state {
        STATE_DONE => InstanceStatus::Gone,
        STATE_FAILED | STATE_CLONING_FAILURE => {
            InstanceStatus::Failed(format!("vm state {}", state))
        }
        STATE_ACTIVE if LCM_FAILURES.contains(&lcm_state) => {
            InstanceStatus::Failed(format!("lcm state {}", lcm_state))
        }
        STATE_ACTIVE if lcm_state == LCM_RUNNING => match first_nic_ip(vm) {
            Some(ip) => InstanceStatus::Running(VmAddress::new(ip)),
            None => InstanceStatus::Failed("running without a NIC IP address".to_string()),
        },
        other => match STATE_INACTIVE.iter().find(|(code, _)| *code == other) {
            Some((_, name)) => InstanceStatus::Failed(format!("vm is {}", name)),
            None => InstanceStatus::Pending,
        },
    };

    Ok(status)
}

/// Interpret `onevm list --json`
pub fn parse_vm_list(json: &str) -> Result<Vec<InstanceId>, BackendError> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| BackendError::Parse(format!("onevm list: {}", e)))?;

    let ids = one_or_many(doc.pointer("/VM_POOL/VM"))
        .into_iter()
        .filter_map(|vm| vm.get("ID"))
        .filter_map(value_as_string)
        .map(InstanceId::new)
        .collect();

    Ok(ids)
}

/// Ids of the VMs named `name` in `onevm list --json`
pub fn find_vms_by_name(json: &str, name: &str) -> Result<Vec<InstanceId>, BackendError> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| BackendError::Parse(format!("onevm list: {}", e)))?;

    let ids = one_or_many(doc.pointer("/VM_POOL/VM"))
        .into_iter()
        .filter(|vm| vm.get("NAME").and_then(Value::as_str) == Some(name))
        .filter_map(|vm| vm.get("ID"))
        .filter_map(value_as_string)
        .map(InstanceId::new)
        .collect();

    Ok(ids)
}

fn first_nic_ip(vm: &Value) -> Option<String> {
    one_or_many(vm.pointer("/TEMPLATE/NIC"))
        .into_iter()
        .filter_map(|nic| nic.get("IP"))
        .filter_map(value_as_string)
        .find(|ip| !ip.is_empty())
}

// The CLI emits a bare object for one element and an array for several
fn one_or_many(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

fn number_field(object: &Value, key: &str) -> Option<u32> {
    match object.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
