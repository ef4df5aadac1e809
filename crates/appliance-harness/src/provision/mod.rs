//! Provisioning backends
//!
//! The harness never allocates compute itself. A [`ProvisioningBackend`]
//! turns a context map into an instance, reports on it, and destroys it.
//! Context parameters are forwarded to the backend unmodified.

use crate::error::BackendError;
use crate::vm::{InstanceId, VmAddress};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod memory;
pub mod opennebula;
pub mod static_host;

pub use memory::MemoryBackend;
pub use opennebula::OpenNebulaBackend;
pub use static_host::StaticBackend;

/// What to provision
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Optional instance name
    pub name: Option<String>,
    /// Context parameters (e.g. database credentials, SSH public key)
    pub context: BTreeMap<String, String>,
    /// Upper bound the backend should apply to the request itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ProvisionRequest {
    /// Request seeded with the given context
    pub fn new(context: BTreeMap<String, String>) -> Self {
        Self {
            name: None,
            context,
            timeout: None,
        }
    }

    /// Set the instance name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bound the time the backend may spend on the request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Backend view of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Still being allocated or booted
    Pending,
    /// Running at the given address
    Running(VmAddress),
    /// Will not come up
    Failed(String),
    /// No longer exists
    Gone,
}

/// A source of VM instances
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Ask for a new instance; returns as soon as the backend assigned an id
    ///
    /// Backends that call out to slow services should not take longer than
    /// `request.timeout`.
    async fn instantiate(&self, request: &ProvisionRequest) -> Result<InstanceId, BackendError>;

    /// Current status of an instance
    async fn status(&self, instance: &InstanceId) -> Result<InstanceStatus, BackendError>;

    /// Destroy an instance; `BackendError::NotFound` when it does not exist
    async fn destroy(&self, instance: &InstanceId) -> Result<(), BackendError>;

    /// Instances the backend currently knows about
    async fn list(&self) -> Result<Vec<InstanceId>, BackendError>;
}
