//! Launcher trait for executing commands in different contexts

use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{ProcessEvent, ProcessEventType};
use crate::process::{ExitResult, ProcessHandle};
use async_io::Timer;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::time::Duration;
use tracing::warn;

/// A launcher that can execute commands in a specific context
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// The event stream type this launcher produces
    type EventStream: Stream<Item = ProcessEvent> + Send + Unpin;

    /// The process handle type this launcher produces
    type Handle: ProcessHandle;

    /// Launch a command, returning event stream and control handle
    async fn launch(&self, command: Command) -> Result<(Self::EventStream, Self::Handle)>;

    /// Execute a command and wait for it to complete, capturing output
    async fn execute(&self, command: Command) -> Result<ExitResult> {
        let (events, mut handle) = self.launch(command).await?;
        let (stdout, stderr) = collect_output(events).await;
        let status = handle.wait().await?;
        Ok(ExitResult {
            status,
            stdout,
            stderr,
        })
    }

    /// Execute a command, killing it if it has not finished within `timeout`
    async fn execute_with_timeout(&self, command: Command, timeout: Duration) -> Result<ExitResult> {
        let (events, mut handle) = self.launch(command).await?;

        let run = async {
            let (stdout, stderr) = collect_output(events).await;
            let status = handle.wait().await?;
            Ok::<_, Error>(Some(ExitResult {
                status,
                stdout,
                stderr,
            }))
        };
        let deadline = async {
            Timer::after(timeout).await;
            Ok(None)
        };

        let outcome = futures_lite::future::or(run, deadline).await?;
        match outcome {
            Some(result) => Ok(result),
            None => {
                if let Err(e) = handle.kill().await {
                    warn!("Failed to kill timed out process: {}", e);
                }
                Err(Error::TimedOut { after: timeout })
            }
        }
    }
}

/// Drain an event stream, concatenating output events into stdout and stderr
///
/// Event data is appended verbatim; terminators are whatever the process wrote.
pub async fn collect_output<S>(mut events: S) -> (String, String)
where
    S: Stream<Item = ProcessEvent> + Unpin,
{
    let mut stdout = String::new();
    let mut stderr = String::new();

    while let Some(event) = events.next().await {
        let sink = match event.event_type {
            ProcessEventType::Stdout => &mut stdout,
            ProcessEventType::Stderr => &mut stderr,
            ProcessEventType::Started { .. } => continue,
        };
        if let Some(data) = &event.data {
            sink.push_str(data);
        }
    }

    (stdout, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_output_splits_streams() {
        let events = futures::stream::iter(vec![
            ProcessEvent::new(ProcessEventType::Started { pid: 7 }),
            ProcessEvent::new_with_data(ProcessEventType::Stdout, "one\r\n".into()),
            ProcessEvent::new_with_data(ProcessEventType::Stderr, "warn\n".into()),
            ProcessEvent::new_with_data(ProcessEventType::Stdout, "two".into()),
        ]);

        let (stdout, stderr) = smol::block_on(collect_output(events));
        assert_eq!(stdout, "one\r\ntwo");
        assert_eq!(stderr, "warn\n");
    }
}
