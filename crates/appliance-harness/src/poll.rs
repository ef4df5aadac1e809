//! Retry-until-predicate-or-timeout polling
//!
//! Appliances come up asynchronously after boot, so most readiness checks
//! run a command repeatedly until its result satisfies a predicate. This
//! module provides the one implementation of that loop.
//!
//! # Semantics
//!
//! - Attempts run strictly one after another.
//! - The first attempt whose result satisfies the predicate is returned and
//!   no further attempts are made.
//! - Transport errors count as failed attempts; any other error aborts.
//! - The timeout is checked only after an attempt completes and the last
//!   sleep is never shortened, so a poll may overrun its timeout by at most
//!   one delay plus one command duration.
//! - A timeout of zero performs exactly one attempt.
//! - Cancellation is observed before each attempt and while sleeping, never
//!   in the middle of a command.

use crate::error::{HarnessError, TransportError};
use crate::result::ExecutionResult;
use async_io::Timer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Marker appliances print in their MOTD once fully configured
pub const READY_BANNER: &str = "All set and ready to serve";

/// A condition over an [`ExecutionResult`]
pub trait Predicate: Send + Sync {
    /// Whether the result satisfies the condition
    fn matches(&self, result: &ExecutionResult) -> bool;

    /// Human readable description used in failure reports
    fn describe(&self) -> String {
        "custom predicate".to_string()
    }
}

impl<F> Predicate for F
where
    F: Fn(&ExecutionResult) -> bool + Send + Sync,
{
    fn matches(&self, result: &ExecutionResult) -> bool {
        self(result)
    }
}

/// Built-in predicates covering the usual certification checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// Exit status is 0
    Success,
    /// Exit status is 0 and stdout contains the text
    SuccessContaining(String),
    /// Trimmed stdout equals the text exactly
    StdoutEquals(String),
    /// Exit status is 0 and stdout contains [`READY_BANNER`]
    ReadyBanner,
}

impl Predicate for Expect {
    fn matches(&self, result: &ExecutionResult) -> bool {
        match self {
            Expect::Success => result.success(),
            Expect::SuccessContaining(needle) => {
                result.success() && result.stdout().contains(needle.as_str())
            }
            Expect::StdoutEquals(literal) => result.stdout_trimmed() == literal,
            Expect::ReadyBanner => result.success() && result.stdout().contains(READY_BANNER),
        }
    }

    fn describe(&self) -> String {
        match self {
            Expect::Success => "exit status 0".to_string(),
            Expect::SuccessContaining(needle) => {
                format!("exit status 0 and stdout containing {:?}", needle)
            }
            Expect::StdoutEquals(literal) => format!("stdout equal to {:?}", literal),
            Expect::ReadyBanner => format!("exit status 0 and stdout containing {:?}", READY_BANNER),
        }
    }
}

/// Wait between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// The same delay after every attempt
    Fixed(Duration),
    /// Delay multiplied by `factor` after every attempt, capped at `max`
    Backoff {
        /// Delay after the first attempt
        initial: Duration,
        /// Growth factor per attempt
        factor: u32,
        /// Upper bound for a single delay
        max: Duration,
    },
}

impl Delay {
    /// Delay to apply after attempt number `attempt` (1-based)
    pub fn after_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Delay::Fixed(delay) => delay,
            Delay::Backoff {
                initial,
                factor,
                max,
            } => {
                let exponent = attempt.saturating_sub(1);
                let multiplier = factor.max(1).saturating_pow(exponent);
                initial.saturating_mul(multiplier).min(max.max(initial))
            }
        }
    }

    /// The smallest delay this schedule produces
    pub fn shortest(&self) -> Duration {
        match *self {
            Delay::Fixed(delay) => delay,
            Delay::Backoff { initial, .. } => initial,
        }
    }
}

/// Budget and pacing of a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSpec {
    timeout: Duration,
    delay: Delay,
    message: Option<String>,
}

impl PollSpec {
    /// Poll for up to `timeout`, waiting `delay` between attempts
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        Self {
            timeout,
            delay: Delay::Fixed(delay),
            message: None,
        }
    }

    /// A spec that performs exactly one attempt
    pub fn once() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Replace the fixed delay by an exponential backoff starting at the current delay
    pub fn with_backoff(mut self, factor: u32, max: Duration) -> Self {
        self.delay = Delay::Backoff {
            initial: self.delay.shortest(),
            factor,
            max,
        };
        self
    }

    /// Failure message template used when the poll times out
    ///
    /// `{elapsed}`, `{attempts}` and `{timeout}` are replaced with the actual
    /// values.
    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message = Some(template.into());
        self
    }

    /// The total time budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The delay schedule
    pub fn delay(&self) -> Delay {
        self.delay
    }

    /// Check the invariants: a non-zero timeout needs a non-zero delay
    pub fn validate(&self) -> Result<(), HarnessError> {
        if !self.timeout.is_zero() && self.delay.shortest().is_zero() {
            return Err(HarnessError::InvalidPollSpec(format!(
                "delay must be greater than zero when timeout is {:?}",
                self.timeout
            )));
        }
        Ok(())
    }
}

/// Phases of a single poll, reported in trace events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// An attempt is running
    Attempting,
    /// Waiting before the next attempt
    Sleeping,
    /// The predicate held
    Succeeded,
    /// The budget ran out
    TimedOut,
    /// Cancellation was observed
    Cancelled,
}

/// What the last attempt of a failed poll produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastAttempt {
    /// The command ran but did not satisfy the predicate
    Result(ExecutionResult),
    /// The command could not be run
    TransportError(TransportError),
}

impl fmt::Display for LastAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastAttempt::Result(result) => write!(f, "{}", result),
            LastAttempt::TransportError(err) => write!(f, "{}", err),
        }
    }
}

/// Diagnostics of a poll whose predicate never held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTimeout {
    /// Wall clock time spent
    pub elapsed: Duration,
    /// The configured budget
    pub timeout: Duration,
    /// Number of attempts made
    pub attempts: u32,
    /// Description of the predicate
    pub expectation: String,
    /// What the final attempt observed
    pub last: LastAttempt,
    /// Caller supplied message template
    pub message: Option<String>,
}

impl PollTimeout {
    /// The last execution result, if the final attempt produced one
    pub fn last_result(&self) -> Option<&ExecutionResult> {
        match &self.last {
            LastAttempt::Result(result) => Some(result),
            LastAttempt::TransportError(_) => None,
        }
    }
}

impl fmt::Display for PollTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(template) => {
                let rendered = template
                    .replace("{elapsed}", &format!("{:?}", self.elapsed))
                    .replace("{attempts}", &self.attempts.to_string())
                    .replace("{timeout}", &format!("{:?}", self.timeout));
                write!(f, "{} (last attempt: {})", rendered, self.last)
            }
            None => write!(
                f,
                "expected {} within {:?}, gave up after {} attempts in {:?} (last attempt: {})",
                self.expectation, self.timeout, self.attempts, self.elapsed, self.last
            ),
        }
    }
}

impl std::error::Error for PollTimeout {}

/// Diagnostics of a cancelled poll
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("poll cancelled after {attempts} attempts in {elapsed:?}")]
pub struct PollCancelled {
    /// Wall clock time spent
    pub elapsed: Duration,
    /// Number of attempts made before cancellation was observed
    pub attempts: u32,
}

/// A poll that did not end in success
#[derive(Debug, Error)]
pub enum PollError {
    /// The predicate never held within the budget
    #[error("{0}")]
    TimedOut(PollTimeout),

    /// Cancellation was observed between attempts
    #[error("{0}")]
    Cancelled(PollCancelled),

    /// An attempt failed with a non-retryable error
    #[error("poll aborted: {0}")]
    Aborted(Box<HarnessError>),
}

/// Cooperative cancellation signal shared between a suite and its polls
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    // Nothing is ever sent; closing the channel wakes every waiter
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                tx,
                rx,
            }),
        }
    }

    /// Raise the signal; idempotent
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.tx.close();
        }
    }

    /// Whether the signal has been raised
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the signal is raised
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // recv fails as soon as the sender side is closed
        let _ = self.inner.rx.recv().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `delay` unless cancelled first; returns false on cancellation
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    futures_lite::future::or(
        async {
            Timer::after(delay).await;
            true
        },
        async {
            cancel.cancelled().await;
            false
        },
    )
    .await
}

/// One attempt of a poll
#[async_trait]
pub trait Probe: Send {
    /// Run the attempt
    async fn attempt(&mut self) -> Result<ExecutionResult, HarnessError>;
}

/// Adapter turning a closure into a [`Probe`]
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F, Fut> Probe for FnProbe<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<ExecutionResult, HarnessError>> + Send + 'static,
{
    async fn attempt(&mut self) -> Result<ExecutionResult, HarnessError> {
        (self.0)().await
    }
}

/// Run `probe` until `predicate` holds, the budget is spent or `cancel` fires
pub async fn poll_until<P, Q>(
    probe: &mut P,
    predicate: &Q,
    spec: &PollSpec,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, PollError>
where
    P: Probe + ?Sized,
    Q: Predicate + ?Sized,
{
    spec.validate()
        .map_err(|e| PollError::Aborted(Box::new(e)))?;

    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            debug!(attempts, state = ?PollState::Cancelled, "Poll cancelled");
            return Err(PollError::Cancelled(PollCancelled {
                elapsed: start.elapsed(),
                attempts,
            }));
        }

        attempts += 1;
        trace!(attempt = attempts, state = ?PollState::Attempting, "Poll attempt");

        let last = match probe.attempt().await {
            Ok(result) if predicate.matches(&result) => {
                debug!(
                    attempts,
                    elapsed = ?start.elapsed(),
                    state = ?PollState::Succeeded,
                    "Poll succeeded"
                );
                return Ok(result);
            }
            Ok(result) => LastAttempt::Result(result),
            Err(HarnessError::Transport(err)) => {
                debug!(attempt = attempts, "Transport error during poll: {}", err);
                LastAttempt::TransportError(err)
            }
            Err(other) => return Err(PollError::Aborted(Box::new(other))),
        };

        let elapsed = start.elapsed();
        if elapsed >= spec.timeout {
            debug!(attempts, ?elapsed, state = ?PollState::TimedOut, "Poll timed out");
            return Err(PollError::TimedOut(PollTimeout {
                elapsed,
                timeout: spec.timeout,
                attempts,
                expectation: predicate.describe(),
                last,
                message: spec.message.clone(),
            }));
        }

        let delay = spec.delay.after_attempt(attempts);
        trace!(?delay, state = ?PollState::Sleeping, "Waiting before next attempt");
        if !sleep_or_cancel(delay, cancel).await {
            debug!(attempts, state = ?PollState::Cancelled, "Poll cancelled while sleeping");
            return Err(PollError::Cancelled(PollCancelled {
                elapsed: start.elapsed(),
                attempts,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_predicates() {
        let banner = ExecutionResult::new(0, format!(" {} 8)\n", READY_BANNER), None);
        let failed_banner = ExecutionResult::new(1, READY_BANNER, None);
        let active = ExecutionResult::new(0, "active\n", None);

        assert!(Expect::Success.matches(&active));
        assert!(!Expect::Success.matches(&failed_banner));
        assert!(Expect::ReadyBanner.matches(&banner));
        assert!(!Expect::ReadyBanner.matches(&failed_banner));
        assert!(Expect::SuccessContaining("act".into()).matches(&active));
        assert!(Expect::StdoutEquals("active".into()).matches(&active));
        assert!(!Expect::StdoutEquals("activ".into()).matches(&active));
    }

    #[test]
    fn test_stdout_equals_ignores_exit_status() {
        let result = ExecutionResult::new(3, "inactive\n", None);
        assert!(Expect::StdoutEquals("inactive".into()).matches(&result));
    }

    #[test]
    fn test_closure_predicate() {
        let count_is_one = |r: &ExecutionResult| r.stdout_trimmed().parse::<u32>() == Ok(1);
        assert!(count_is_one.matches(&ExecutionResult::new(0, "1\n", None)));
        assert_eq!(count_is_one.describe(), "custom predicate");
    }

    #[test]
    fn test_backoff_schedule() {
        let delay = Delay::Backoff {
            initial: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(5),
        };
        assert_eq!(delay.after_attempt(1), Duration::from_secs(1));
        assert_eq!(delay.after_attempt(2), Duration::from_secs(2));
        assert_eq!(delay.after_attempt(3), Duration::from_secs(4));
        assert_eq!(delay.after_attempt(4), Duration::from_secs(5));
        assert_eq!(delay.after_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn test_spec_validation() {
        assert!(PollSpec::once().validate().is_ok());
        assert!(PollSpec::new(Duration::from_secs(1), Duration::ZERO)
            .validate()
            .is_err());
        assert!(PollSpec::new(Duration::from_secs(1), Duration::from_millis(10))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_timeout_message_template() {
        let timeout = PollTimeout {
            elapsed: Duration::from_secs(12),
            timeout: Duration::from_secs(10),
            attempts: 6,
            expectation: "exit status 0".into(),
            last: LastAttempt::Result(ExecutionResult::new(1, "", None)),
            message: Some("zabbix-server not active after {attempts} tries".into()),
        };
        assert_eq!(
            timeout.to_string(),
            "zabbix-server not active after 6 tries (last attempt: exit status 1)"
        );
        assert_eq!(timeout.last_result().map(|r| r.exit_status()), Some(1));
    }

    #[test]
    fn test_cancellation_token_wakes_waiters() {
        smol::block_on(async {
            let token = CancellationToken::new();
            let clone = token.clone();
            assert!(!clone.is_cancelled());

            token.cancel();
            token.cancel();
            clone.cancelled().await;
            assert!(clone.is_cancelled());
            assert!(!sleep_or_cancel(Duration::from_secs(60), &clone).await);
        });
    }
}
