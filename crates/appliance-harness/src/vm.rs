//! Handles to provisioned appliance instances

use crate::error::{HarnessError, Result};
use crate::poll::{
    poll_until, CancellationToken, Expect, PollError, PollSpec, Predicate, Probe,
};
use crate::result::ExecutionResult;
use crate::transport::Transport;
use async_trait::async_trait;
use command_executor::Command;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Opaque identifier assigned by the provisioning backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap a backend identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an instance can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmAddress {
    /// Hostname or IP address
    pub host: String,
    /// Port override; transports use their default when unset
    pub port: Option<u16>,
}

impl VmAddress {
    /// Address with the transport's default port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    /// Set an explicit port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

impl fmt::Display for VmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// Lifecycle of a handle
///
/// `Requested → Provisioning → Ready → Destroying → Destroyed`, with `Failed`
/// reachable from `Provisioning`, `Ready` and `Destroying`. `Destroyed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// The backend accepted the request
    Requested,
    /// Waiting for the instance to become reachable
    Provisioning,
    /// Accepting commands
    Ready,
    /// Teardown in progress
    Destroying,
    /// Teardown completed
    Destroyed,
    /// Unrecoverable provisioning or transport failure
    Failed,
}

impl VmState {
    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Ready, Destroying)
                | (Ready, Failed)
                | (Destroying, Destroyed)
                | (Destroying, Failed)
        )
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Destroyed | VmState::Failed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::Requested => "requested",
            VmState::Provisioning => "provisioning",
            VmState::Ready => "ready",
            VmState::Destroying => "destroying",
            VmState::Destroyed => "destroyed",
            VmState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Process-wide record of instances that may still hold backend resources
#[derive(Debug, Clone, Default)]
pub(crate) struct Registry {
    entries: Arc<Mutex<HashMap<InstanceId, VmState>>>,
}

impl Registry {
    pub(crate) fn insert(&self, id: &InstanceId, state: VmState) {
        self.lock().insert(id.clone(), state);
    }

    pub(crate) fn update(&self, id: &InstanceId, state: VmState) {
        if let Some(entry) = self.lock().get_mut(id) {
            *entry = state;
        }
    }

    pub(crate) fn remove(&self, id: &InstanceId) {
        self.lock().remove(id);
    }

    pub(crate) fn contains(&self, id: &InstanceId) -> bool {
        self.lock().contains_key(id)
    }

    pub(crate) fn snapshot(&self) -> Vec<(InstanceId, VmState)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, VmState>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One provisioned appliance instance and its exclusive transport
///
/// Handles are created by [`VmManager::acquire`](crate::VmManager::acquire)
/// and must be given back through
/// [`VmManager::release`](crate::VmManager::release).
pub struct VmHandle {
    id: InstanceId,
    address: Option<VmAddress>,
    context: BTreeMap<String, String>,
    state: VmState,
    transport: Option<Box<dyn Transport>>,
    registry: Registry,
}

impl VmHandle {
    pub(crate) fn new(
        id: InstanceId,
        context: BTreeMap<String, String>,
        registry: Registry,
    ) -> Self {
        registry.insert(&id, VmState::Requested);
        Self {
            id,
            address: None,
            context,
            state: VmState::Requested,
            transport: None,
            registry,
        }
    }

    /// The backend identifier of this instance
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Network address, known once the backend reported it
    pub fn address(&self) -> Option<&VmAddress> {
        self.address.as_ref()
    }

    /// Context parameters the instance was provisioned with
    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    /// Current lifecycle state
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Whether the handle accepts commands
    pub fn is_ready(&self) -> bool {
        self.state == VmState::Ready
    }

    /// Run one command on the instance
    ///
    /// Fails with [`HarnessError::NotReady`] without touching the transport
    /// unless the handle is `Ready`. An authentication failure moves the
    /// handle to `Failed`.
    pub async fn execute(&mut self, command: &Command) -> Result<ExecutionResult> {
        if self.state != VmState::Ready {
            return Err(self.not_ready());
        }
        self.execute_unchecked(command).await
    }

    /// Run `command` until `predicate` holds or the poll gives up
    pub async fn poll<P>(
        &mut self,
        command: &Command,
        predicate: &P,
        spec: &PollSpec,
        cancel: &CancellationToken,
    ) -> std::result::Result<ExecutionResult, PollError>
    where
        P: Predicate + ?Sized,
    {
        let mut probe = CommandProbe {
            handle: self,
            command,
            checked: true,
        };
        poll_until(&mut probe, predicate, spec, cancel).await
    }

    /// Wait until the appliance's MOTD announces it is ready to serve
    pub async fn wait_until_ready(
        &mut self,
        timeout: Duration,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<ExecutionResult, PollError> {
        let mut motd = Command::new("cat");
        motd.arg("/etc/motd");
        let spec = PollSpec::new(timeout, delay)
            .with_message("appliance did not report ready within {timeout}");
        self.poll(&motd, &Expect::ReadyBanner, &spec, cancel).await
    }

    pub(crate) fn attach(&mut self, address: VmAddress, transport: Box<dyn Transport>) {
        self.address = Some(address);
        self.transport = Some(transport);
    }

    /// Execute without the state check; used while provisioning
    pub(crate) async fn execute_unchecked(&mut self, command: &Command) -> Result<ExecutionResult> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.not_ready());
        };

        let outcome = transport.execute(command).await;
        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                if err.is_fatal() && self.state == VmState::Ready {
                    warn!(instance = %self.id, "Unrecoverable transport error: {}", err);
                    self.transition(VmState::Failed);
                }
                Err(HarnessError::Transport(err))
            }
        }
    }

    pub(crate) async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    pub(crate) fn transition(&mut self, next: VmState) {
        if !self.state.can_transition_to(next) {
            warn!(
                instance = %self.id,
                "Ignoring invalid state transition {} -> {}",
                self.state, next
            );
            return;
        }
        debug!(instance = %self.id, "State {} -> {}", self.state, next);
        self.state = next;
        self.registry.update(&self.id, next);
    }

    fn not_ready(&self) -> HarnessError {
        HarnessError::NotReady {
            instance: self.id.clone(),
            state: self.state,
        }
    }
}

impl fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.registry.contains(&self.id) {
            warn!(
                instance = %self.id,
                state = %self.state,
                "VM handle dropped without release; instance stays registered for cleanup"
            );
        }
    }
}

/// Probe running one command on a handle
pub(crate) struct CommandProbe<'a> {
    pub(crate) handle: &'a mut VmHandle,
    pub(crate) command: &'a Command,
    /// Whether to enforce the `Ready` state check
    pub(crate) checked: bool,
}

#[async_trait]
impl<'a> Probe for CommandProbe<'a> {
    async fn attempt(&mut self) -> Result<ExecutionResult> {
        if self.checked {
            self.handle.execute(self.command).await
        } else {
            self.handle.execute_unchecked(self.command).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn execute(
            &mut self,
            command: &Command,
        ) -> std::result::Result<ExecutionResult, TransportError> {
            Ok(ExecutionResult::new(0, command.to_shell_string(), None))
        }
    }

    struct Locked;

    #[async_trait]
    impl Transport for Locked {
        async fn execute(
            &mut self,
            _command: &Command,
        ) -> std::result::Result<ExecutionResult, TransportError> {
            Err(TransportError::AuthenticationFailed {
                host: "10.0.0.9".into(),
                reason: "Permission denied (publickey)".into(),
            })
        }
    }

    fn ready_handle(transport: Box<dyn Transport>) -> (VmHandle, Registry) {
        let registry = Registry::default();
        let mut handle = VmHandle::new(InstanceId::new("1"), BTreeMap::new(), registry.clone());
        handle.transition(VmState::Provisioning);
        handle.attach(VmAddress::new("10.0.0.9"), transport);
        handle.transition(VmState::Ready);
        (handle, registry)
    }

    #[test]
    fn test_state_machine() {
        assert!(VmState::Requested.can_transition_to(VmState::Provisioning));
        assert!(VmState::Provisioning.can_transition_to(VmState::Failed));
        assert!(VmState::Ready.can_transition_to(VmState::Failed));
        assert!(!VmState::Requested.can_transition_to(VmState::Ready));
        assert!(!VmState::Destroyed.can_transition_to(VmState::Destroying));
        assert!(!VmState::Failed.can_transition_to(VmState::Ready));
    }

    #[test]
    fn test_not_ready_rejects_without_transport_call() {
        smol::block_on(async {
            let registry = Registry::default();
            let mut handle = VmHandle::new(InstanceId::new("2"), BTreeMap::new(), registry);
            handle.transition(VmState::Provisioning);
            handle.attach(VmAddress::new("10.0.0.2"), Box::new(Locked));

            let err = handle.execute(&Command::new("true")).await.unwrap_err();
            assert!(matches!(
                err,
                HarnessError::NotReady {
                    state: VmState::Provisioning,
                    ..
                }
            ));
            // A transport call would have failed authentication instead
            assert_eq!(handle.state(), VmState::Provisioning);
        });
    }

    #[test]
    fn test_execute_on_ready_handle() {
        smol::block_on(async {
            let (mut handle, registry) = ready_handle(Box::new(Echo));
            let mut cmd = Command::new("echo");
            cmd.arg("hello world");

            let result = handle.execute(&cmd).await.unwrap();
            assert_eq!(result.stdout(), "echo 'hello world'");
            assert_eq!(registry.snapshot(), vec![(InstanceId::new("1"), VmState::Ready)]);
        });
    }

    #[test]
    fn test_authentication_failure_fails_handle() {
        smol::block_on(async {
            let (mut handle, registry) = ready_handle(Box::new(Locked));

            let err = handle.execute(&Command::new("true")).await.unwrap_err();
            assert!(matches!(err, HarnessError::Transport(_)));
            assert_eq!(handle.state(), VmState::Failed);
            assert_eq!(registry.snapshot()[0].1, VmState::Failed);

            let err = handle.execute(&Command::new("true")).await.unwrap_err();
            assert!(matches!(err, HarnessError::NotReady { .. }));
        });
    }
}
