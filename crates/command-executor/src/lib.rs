//! Runtime-agnostic command execution library
//!
//! This crate provides a unified interface for executing commands locally or
//! on remote SSH hosts, capturing their exit status and output.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod event;
pub mod launcher;
pub mod process;

pub use command::{shell_quote, Command};
pub use error::{Error, Result};
pub use event::{ProcessEvent, ProcessEventType};
pub use launcher::Launcher;
pub use process::{ExitResult, ExitStatus, ProcessHandle};
