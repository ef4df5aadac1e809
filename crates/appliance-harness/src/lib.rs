//! Appliance certification harness
//!
//! Provisions virtual machines from a template with context parameters,
//! runs shell commands on them over SSH and polls command results until a
//! predicate holds. Certification suites build on three pieces:
//!
//! - [`VmManager`] acquires [`VmHandle`]s and always gives them back
//! - [`VmHandle::execute`] runs one command and returns an [`ExecutionResult`]
//! - [`poll_until`] / [`VmHandle::poll`] retry until an [`Expect`] holds
//!
//! ```no_run
//! use appliance_harness::{
//!     CancellationToken, Command, Expect, HarnessConfig, HarnessError, PollSpec,
//! };
//! use std::time::Duration;
//!
//! # async fn run() -> appliance_harness::Result<()> {
//! let config = HarnessConfig::from_file("harness.yaml")?;
//! let manager = config.build_manager()?;
//! let context = config.resolved_context()?;
//!
//! manager
//!     .with_vm(context, config.acquire_timeout(), |vm| {
//!         Box::pin(async move {
//!             let spec = PollSpec::new(Duration::from_secs(120), Duration::from_secs(5));
//!             let mut cmd = Command::new("systemctl");
//!             cmd.arg("is-active").arg("zabbix-server");
//!             vm.poll(&cmd, &Expect::StdoutEquals("active".into()), &spec, &CancellationToken::new())
//!                 .await?;
//!             Ok::<(), HarnessError>(())
//!         })
//!     })
//!     .await
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod manager;
pub mod poll;
pub mod provision;
pub mod result;
pub mod transport;
pub mod vm;

pub use command_executor::Command;
pub use config::{ConfigError, HarnessConfig};
pub use error::{BackendError, HarnessError, ProvisionError, Result, TransportError};
pub use manager::VmManager;
pub use poll::{
    poll_until, CancellationToken, Delay, Expect, PollError, PollSpec, PollState, Predicate,
    Probe, READY_BANNER,
};
pub use provision::{InstanceStatus, ProvisionRequest, ProvisioningBackend};
pub use result::ExecutionResult;
pub use transport::{SshTransport, SshTransportFactory, SshTransportSettings, Transport, TransportFactory};
pub use vm::{InstanceId, VmAddress, VmHandle, VmState};
