//! Backend for a host that already exists

use super::{InstanceStatus, ProvisionRequest, ProvisioningBackend};
use crate::error::BackendError;
use crate::vm::{InstanceId, VmAddress};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::warn;

/// Hands out one pre-existing host
///
/// Useful when certifying an appliance that was deployed by other means.
/// Context parameters cannot be applied and are only logged; destroying
/// the instance forgets it without touching the host.
#[derive(Debug)]
pub struct StaticBackend {
    address: VmAddress,
    acquired: Mutex<bool>,
}

impl StaticBackend {
    /// Backend for the host at `address`
    pub fn new(address: VmAddress) -> Self {
        Self {
            address,
            acquired: Mutex::new(false),
        }
    }

    fn id(&self) -> InstanceId {
        InstanceId::new(format!("static:{}", self.address))
    }

    fn is_acquired(&self) -> bool {
        *self.acquired.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_acquired(&self, value: bool) -> bool {
        let mut acquired = self.acquired.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *acquired, value)
    }
}

#[async_trait]
impl ProvisioningBackend for StaticBackend {
    fn name(&self) -> &str {
        "static"
    }

    async fn instantiate(&self, request: &ProvisionRequest) -> Result<InstanceId, BackendError> {
        if self.set_acquired(true) {
            return Err(BackendError::Rejected(format!(
                "host {} is already in use",
                self.address
            )));
        }
        if !request.context.is_empty() {
            warn!(
                host = %self.address,
                "Static host ignores {} context parameters",
                request.context.len()
            );
        }
        Ok(self.id())
    }

    async fn status(&self, instance: &InstanceId) -> Result<InstanceStatus, BackendError> {
        if *instance == self.id() && self.is_acquired() {
            Ok(InstanceStatus::Running(self.address.clone()))
        } else {
            Ok(InstanceStatus::Gone)
        }
    }

    async fn destroy(&self, instance: &InstanceId) -> Result<(), BackendError> {
        if *instance == self.id() && self.set_acquired(false) {
            Ok(())
        } else {
            Err(BackendError::NotFound(instance.clone()))
        }
    }

    async fn list(&self) -> Result<Vec<InstanceId>, BackendError> {
        Ok(if self.is_acquired() {
            vec![self.id()]
        } else {
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_tenant() {
        smol::block_on(async {
            let backend = StaticBackend::new(VmAddress::new("192.168.1.20").with_port(2222));
            let id = backend
                .instantiate(&ProvisionRequest::default())
                .await
                .unwrap();
            assert_eq!(id.as_str(), "static:192.168.1.20:2222");
            assert!(matches!(
                backend.instantiate(&ProvisionRequest::default()).await,
                Err(BackendError::Rejected(_))
            ));

            assert_eq!(
                backend.status(&id).await.unwrap(),
                InstanceStatus::Running(VmAddress::new("192.168.1.20").with_port(2222))
            );

            backend.destroy(&id).await.unwrap();
            assert_eq!(backend.status(&id).await.unwrap(), InstanceStatus::Gone);
            assert!(backend.list().await.unwrap().is_empty());
        });
    }
}
