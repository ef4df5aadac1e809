//! Backend implementations for different execution contexts
//!
//! [`LocalLauncher`] runs processes on this machine; [`SshLauncher`] wraps
//! another launcher and runs the command on a remote host through the
//! OpenSSH client. Custom contexts implement [`Launcher`](crate::Launcher).

pub mod local;
pub use local::LocalLauncher;

#[cfg(feature = "ssh")]
pub mod ssh;
#[cfg(feature = "ssh")]
pub use ssh::{SshConfig, SshLauncher};
