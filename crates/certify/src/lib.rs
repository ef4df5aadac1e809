//! Declarative appliance certification
//!
//! Loads a YAML [`Suite`](suite::Suite), provisions one instance through
//! `appliance-harness`, runs the suite's checks on it in order and always
//! releases the instance afterwards.

#![warn(missing_docs)]

pub mod report;
pub mod runner;
pub mod suite;

pub use runner::{CheckOutcome, RunOptions, SuiteReport, Verdict, run_suite};
pub use suite::{Check, PollConfig, Suite};
