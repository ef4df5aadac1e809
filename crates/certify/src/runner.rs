//! Runs a suite's checks against one provisioned instance

use crate::suite::{Check, Suite};
use appliance_harness::{CancellationToken, HarnessError, PollError, VmHandle, VmManager};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How a single check ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The expectation held
    Passed,
    /// The expectation did not hold or the command could not run
    Failed(String),
    /// Not run because the run was cancelled or stopped early
    Skipped(String),
}

impl Verdict {
    /// Whether the check passed
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Check name
    pub name: String,
    /// Outcome
    pub verdict: Verdict,
    /// Time spent on the check
    pub elapsed: Duration,
}

/// Result of a whole suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    /// Suite name
    pub suite: String,
    /// One entry per check, in suite order
    pub outcomes: Vec<CheckOutcome>,
    /// Provisioning or release failure, if any
    pub error: Option<String>,
}

impl SuiteReport {
    /// Whether provisioning, every check and the release succeeded
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.outcomes.iter().all(|o| o.verdict.is_passed())
    }

    /// Number of checks that did not pass
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.verdict.is_passed())
            .count()
    }
}

/// Knobs for a run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip the remaining checks after the first failure
    pub fail_fast: bool,
}

/// Provision an instance, run every check of `suite` on it and release it
///
/// Checks run in order. Cancelling `cancel` stops provisioning or the
/// running poll, marks the remaining checks as skipped and still releases
/// the instance.
pub async fn run_suite(
    manager: &VmManager,
    suite: &Suite,
    context: BTreeMap<String, String>,
    options: RunOptions,
    cancel: &CancellationToken,
) -> SuiteReport {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let checks = suite.checks.clone();
    let token = cancel.clone();

    info!(suite = %suite.name, "Running {} checks", checks.len());
    let run = manager
        .with_vm_cancellable(
            context,
            suite.harness.acquire_timeout(),
            cancel,
            move |vm| {
                Box::pin(async move {
                    run_checks(vm, &checks, options, &token, &sink).await;
                    Ok::<(), HarnessError>(())
                })
            },
        )
        .await;

    let error = run.err().map(|e| {
        error!(suite = %suite.name, "Suite aborted: {}", e);
        e.to_string()
    });

    let mut outcomes =
        std::mem::take(&mut *outcomes.lock().unwrap_or_else(PoisonError::into_inner));
    if outcomes.is_empty() && error.is_some() {
        outcomes = suite
            .checks
            .iter()
            .map(|check| CheckOutcome {
                name: check.name.clone(),
                verdict: Verdict::Skipped("no instance".to_string()),
                elapsed: Duration::ZERO,
            })
            .collect();
    }

    SuiteReport {
        suite: suite.name.clone(),
        outcomes,
        error,
    }
}

async fn run_checks(
    vm: &mut VmHandle,
    checks: &[Check],
    options: RunOptions,
    cancel: &CancellationToken,
    sink: &Mutex<Vec<CheckOutcome>>,
) {
    let mut stop: Option<String> = None;

    for check in checks {
        let outcome = match &stop {
            Some(reason) => CheckOutcome {
                name: check.name.clone(),
                verdict: Verdict::Skipped(reason.clone()),
                elapsed: Duration::ZERO,
            },
            None => run_check(vm, check, cancel).await,
        };

        match &outcome.verdict {
            Verdict::Passed => info!(check = %check.name, "Check passed"),
            Verdict::Failed(reason) => {
                warn!(check = %check.name, "Check failed: {}", reason);
                if options.fail_fast {
                    stop = Some("an earlier check failed".to_string());
                }
            }
            Verdict::Skipped(reason) => {
                info!(check = %check.name, "Check skipped: {}", reason);
            }
        }

        if stop.is_none() {
            if cancel.is_cancelled() {
                stop = Some("cancelled".to_string());
            } else if !vm.is_ready() {
                stop = Some(format!("instance is {}", vm.state()));
            }
        }

        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
    }
}

async fn run_check(vm: &mut VmHandle, check: &Check, cancel: &CancellationToken) -> CheckOutcome {
    let start = Instant::now();

    let verdict = match check.to_command() {
        Err(e) => Verdict::Failed(e.to_string()),
        Ok(command) => {
            let outcome = vm
                .poll(&command, &check.expect, &check.poll_spec(), cancel)
                .await;
            match outcome {
                Ok(_) => Verdict::Passed,
                Err(PollError::Cancelled(_)) => Verdict::Skipped("cancelled".to_string()),
                Err(e) => Verdict::Failed(e.to_string()),
            }
        }
    };

    CheckOutcome {
        name: check.name.clone(),
        verdict,
        elapsed: start.elapsed(),
    }
}
