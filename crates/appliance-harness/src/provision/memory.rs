//! In-process backend for tests and dry runs

use super::{InstanceStatus, ProvisionRequest, ProvisioningBackend};
use crate::error::BackendError;
use crate::vm::{InstanceId, VmAddress};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
enum Boot {
    After(usize),
    Fails(String),
    Never,
}

#[derive(Debug)]
struct Instance {
    address: VmAddress,
    status_polls: usize,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    live: HashMap<InstanceId, Instance>,
    destroy_calls: HashMap<InstanceId, usize>,
    requests: Vec<ProvisionRequest>,
}

/// Backend that keeps instances in memory
///
/// Instances get sequential ids and `10.0.0.N` addresses. Clones share state,
/// so a test can keep one clone to inspect what a manager did with the other.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    boot: Boot,
    reject: Option<String>,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Instances are running on the first status query
    pub fn new() -> Self {
        Self {
            boot: Boot::After(0),
            reject: None,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Report `Pending` for the first `polls` status queries of each instance
    pub fn boot_after(mut self, polls: usize) -> Self {
        self.boot = Boot::After(polls);
        self
    }

    /// Every instance fails to boot with `reason`
    pub fn failing_boot(mut self, reason: impl Into<String>) -> Self {
        self.boot = Boot::Fails(reason.into());
        self
    }

    /// Instances stay `Pending` forever
    pub fn never_boot(mut self) -> Self {
        self.boot = Boot::Never;
        self
    }

    /// Refuse every instantiate call
    pub fn reject_requests(mut self, reason: impl Into<String>) -> Self {
        self.reject = Some(reason.into());
        self
    }

    /// How many times `destroy` was called for `instance`
    pub fn destroy_calls(&self, instance: &InstanceId) -> usize {
        self.lock().destroy_calls.get(instance).copied().unwrap_or(0)
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<ProvisionRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProvisioningBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn instantiate(&self, request: &ProvisionRequest) -> Result<InstanceId, BackendError> {
        let mut state = self.lock();
        state.requests.push(request.clone());

        if let Some(reason) = &self.reject {
            return Err(BackendError::Rejected(reason.clone()));
        }

        state.next_id += 1;
        let n = state.next_id;
        let id = InstanceId::new(n.to_string());
        state.live.insert(
            id.clone(),
            Instance {
                address: VmAddress::new(format!("10.0.0.{}", n)),
                status_polls: 0,
            },
        );
        Ok(id)
    }

    async fn status(&self, instance: &InstanceId) -> Result<InstanceStatus, BackendError> {
        let mut state = self.lock();
        let Some(vm) = state.live.get_mut(instance) else {
            return Ok(InstanceStatus::Gone);
        };
        vm.status_polls += 1;

        let status = match &self.boot {
            Boot::After(polls) if vm.status_polls > *polls => {
                InstanceStatus::Running(vm.address.clone())
            }
            Boot::After(_) | Boot::Never => InstanceStatus::Pending,
            Boot::Fails(reason) => InstanceStatus::Failed(reason.clone()),
        };
        Ok(status)
    }

    async fn destroy(&self, instance: &InstanceId) -> Result<(), BackendError> {
        let mut state = self.lock();
        *state.destroy_calls.entry(instance.clone()).or_insert(0) += 1;

        match state.live.remove(instance) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(instance.clone())),
        }
    }

    async fn list(&self) -> Result<Vec<InstanceId>, BackendError> {
        let ids: BTreeMap<_, _> = self.lock().live.keys().map(|id| (id.clone(), ())).collect();
        Ok(ids.into_keys().collect())
    }
}
