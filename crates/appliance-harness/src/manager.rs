//! VM lifecycle manager
//!
//! The manager is the only place handles are created and destroyed. It turns
//! a context map into a `Ready` [`VmHandle`], tears instances down again and
//! keeps a registry of everything that may still hold backend resources so
//! an aborted run can clean up with [`VmManager::release_all`].

use crate::error::{BackendError, HarnessError, ProvisionError};
use crate::poll::{poll_until, sleep_or_cancel, CancellationToken, Expect, PollError, PollSpec};
use crate::provision::{InstanceStatus, ProvisionRequest, ProvisioningBackend};
use crate::transport::TransportFactory;
use crate::vm::{CommandProbe, InstanceId, Registry, VmAddress, VmHandle, VmState};
use command_executor::Command;
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Acquires and releases appliance instances
pub struct VmManager {
    backend: Arc<dyn ProvisioningBackend>,
    transports: Arc<dyn TransportFactory>,
    registry: Registry,
    probe_interval: Duration,
    probe_command: Command,
}

impl VmManager {
    /// Create a manager provisioning through `backend` and reaching
    /// instances through transports built by `transports`
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        info!("Initializing VmManager with backend: {}", backend.name());
        Self {
            backend,
            transports,
            registry: Registry::default(),
            probe_interval: Duration::from_secs(5),
            probe_command: Command::new("true"),
        }
    }

    /// Delay between backend status queries and reachability probes
    ///
    /// A zero interval is raised to one millisecond.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Command whose success proves an instance is reachable
    pub fn with_probe_command(mut self, command: Command) -> Self {
        self.probe_command = command;
        self
    }

    /// The provisioning backend
    pub fn backend(&self) -> &dyn ProvisioningBackend {
        self.backend.as_ref()
    }

    /// Provision an instance and wait until it accepts commands
    pub async fn acquire(
        &self,
        context: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<VmHandle, ProvisionError> {
        self.acquire_with(context, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`acquire`](Self::acquire), giving up early when `cancel` fires
    ///
    /// `timeout` covers the whole acquisition including the backend request.
    /// Any failure after the backend assigned an instance destroys that
    /// instance before the error is returned.
    pub async fn acquire_with(
        &self,
        context: BTreeMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<VmHandle, ProvisionError> {
        let start = Instant::now();
        // The request itself counts against the budget
        let request = ProvisionRequest::new(context.clone()).with_timeout(timeout);

        info!(
            backend = self.backend.name(),
            "Requesting instance with {} context parameters",
            request.context.len()
        );
        let id = self
            .backend
            .instantiate(&request)
            .await
            .map_err(ProvisionError::Request)?;

        let mut handle = VmHandle::new(id, context, self.registry.clone());
        handle.transition(VmState::Provisioning);

        match self.bring_up(&mut handle, start, timeout, cancel).await {
            Ok(()) => {
                handle.transition(VmState::Ready);
                info!(
                    instance = %handle.id(),
                    elapsed = ?start.elapsed(),
                    "Instance ready"
                );
                Ok(handle)
            }
            Err(err) => {
                error!(instance = %handle.id(), "Provisioning failed: {}", err);
                self.roll_back(&mut handle).await;
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        handle: &mut VmHandle,
        start: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let id = handle.id().clone();
        let address = self.wait_for_address(&id, start, timeout, cancel).await?;

        debug!(instance = %id, %address, "Instance running, probing reachability");
        let transport = self.transports.connect(&id, &address);
        handle.attach(address, transport);

        let spec = PollSpec::new(timeout.saturating_sub(start.elapsed()), self.probe_interval);
        let mut probe = CommandProbe {
            handle: &mut *handle,
            command: &self.probe_command,
            checked: false,
        };

        match poll_until(&mut probe, &Expect::Success, &spec, cancel).await {
            Ok(_) => Ok(()),
            Err(PollError::TimedOut(t)) => Err(ProvisionError::Timeout {
                instance: id,
                elapsed: start.elapsed(),
                last_error: Some(t.last.to_string()),
            }),
            Err(PollError::Cancelled(_)) => Err(ProvisionError::Cancelled {
                instance: id,
                elapsed: start.elapsed(),
            }),
            Err(PollError::Aborted(e)) => Err(ProvisionError::InstanceFailed {
                instance: id,
                elapsed: start.elapsed(),
                reason: e.to_string(),
            }),
        }
    }

    async fn wait_for_address(
        &self,
        id: &InstanceId,
        start: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<VmAddress, ProvisionError> {
        let mut last_error = None;

        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled {
                    instance: id.clone(),
                    elapsed: start.elapsed(),
                });
            }

            let status = self.backend.status(id).await;
            match status {
                Ok(InstanceStatus::Running(address)) => return Ok(address),
                Ok(InstanceStatus::Pending) => debug!(instance = %id, "Instance pending"),
                Ok(InstanceStatus::Failed(reason)) => {
                    return Err(ProvisionError::InstanceFailed {
                        instance: id.clone(),
                        elapsed: start.elapsed(),
                        reason,
                    });
                }
                Ok(InstanceStatus::Gone) => {
                    return Err(ProvisionError::InstanceFailed {
                        instance: id.clone(),
                        elapsed: start.elapsed(),
                        reason: "instance disappeared".to_string(),
                    });
                }
                Err(e) => {
                    debug!(instance = %id, "Status query failed: {}", e);
                    last_error = Some(e.to_string());
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ProvisionError::Timeout {
                    instance: id.clone(),
                    elapsed,
                    last_error,
                });
            }

            if !sleep_or_cancel(self.probe_interval, cancel).await {
                return Err(ProvisionError::Cancelled {
                    instance: id.clone(),
                    elapsed: start.elapsed(),
                });
            }
        }
    }

    async fn roll_back(&self, handle: &mut VmHandle) {
        handle.transition(VmState::Failed);
        handle.close_transport().await;

        let id = handle.id().clone();
        match self.backend.destroy(&id).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                debug!(instance = %id, "Rolled back instance");
                self.registry.remove(&id);
            }
            Err(e) => {
                error!(
                    instance = %id,
                    "Failed to destroy instance after failed provisioning: {}", e
                );
            }
        }
    }

    /// Destroy the instance behind `handle`
    ///
    /// Idempotent: a handle whose instance is already gone is only marked
    /// as such, so an instance is never destroyed twice. A failed destroy
    /// leaves the instance registered for [`release_all`](Self::release_all).
    pub async fn release(&self, handle: &mut VmHandle) -> Result<(), HarnessError> {
        let id = handle.id().clone();

        if !self.registry.contains(&id) {
            if handle.state() == VmState::Ready {
                handle.transition(VmState::Destroying);
                handle.transition(VmState::Destroyed);
            }
            handle.close_transport().await;
            return Ok(());
        }

        handle.close_transport().await;
        if handle.state() == VmState::Ready {
            handle.transition(VmState::Destroying);
        }

        info!(instance = %id, state = %handle.state(), "Releasing instance");
        let destroyed = self.backend.destroy(&id).await;
        match destroyed {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                if handle.state() == VmState::Destroying {
                    handle.transition(VmState::Destroyed);
                }
                self.registry.remove(&id);
                Ok(())
            }
            Err(e) => {
                error!(instance = %id, "Failed to destroy instance: {}", e);
                if handle.state() == VmState::Destroying {
                    handle.transition(VmState::Failed);
                }
                Err(HarnessError::Backend(e))
            }
        }
    }

    /// Acquire an instance, run `body` on it and release it afterwards
    ///
    /// The instance is released whether `body` succeeds, fails or panics;
    /// a panic is resumed once the release finished.
    pub async fn with_vm<T, F>(
        &self,
        context: BTreeMap<String, String>,
        timeout: Duration,
        body: F,
    ) -> Result<T, HarnessError>
    where
        F: for<'a> FnOnce(&'a mut VmHandle) -> BoxFuture<'a, Result<T, HarnessError>>,
    {
        self.with_vm_cancellable(context, timeout, &CancellationToken::new(), body)
            .await
    }

    /// [`with_vm`](Self::with_vm) whose provisioning wait honours `cancel`
    pub async fn with_vm_cancellable<T, F>(
        &self,
        context: BTreeMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T, HarnessError>
    where
        F: for<'a> FnOnce(&'a mut VmHandle) -> BoxFuture<'a, Result<T, HarnessError>>,
    {
        let mut handle = self.acquire_with(context, timeout, cancel).await?;

        let outcome = AssertUnwindSafe(body(&mut handle)).catch_unwind().await;
        let released = self.release(&mut handle).await;

        match outcome {
            Err(panic) => {
                if let Err(e) = released {
                    error!(instance = %handle.id(), "Release after panic failed: {}", e);
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(err)) => {
                if let Err(e) = released {
                    warn!(instance = %handle.id(), "Release after failure failed: {}", e);
                }
                Err(err)
            }
            Ok(Ok(value)) => released.map(|()| value),
        }
    }

    /// Instances that may still hold backend resources, ordered by id
    pub fn active(&self) -> Vec<(InstanceId, VmState)> {
        self.registry.snapshot()
    }

    /// Destroy every registered instance
    ///
    /// Meant for cleanup after an aborted run. Every instance is attempted;
    /// returns how many were destroyed, or the first failure.
    pub async fn release_all(&self) -> Result<usize, HarnessError> {
        let entries = self.registry.snapshot();
        if !entries.is_empty() {
            warn!("Releasing {} leftover instances", entries.len());
        }

        let mut destroyed = 0;
        let mut first_error = None;

        for (id, state) in entries {
            debug!(instance = %id, %state, "Destroying leftover instance");
            let outcome = self.backend.destroy(&id).await;
            match outcome {
                Ok(()) | Err(BackendError::NotFound(_)) => {
                    self.registry.remove(&id);
                    destroyed += 1;
                }
                Err(e) => {
                    error!(instance = %id, "Failed to destroy leftover instance: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(HarnessError::Backend(e)),
            None => Ok(destroyed),
        }
    }
}
