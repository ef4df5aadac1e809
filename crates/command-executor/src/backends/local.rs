//! Local process execution backend

use async_process::{Child, Stdio};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{ProcessEvent, ProcessEventType};
use crate::launcher::Launcher;
use crate::process::{ExitStatus, ProcessHandle};

/// Launcher for executing processes locally
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

/// A handle to control a local process
pub struct LocalProcessHandle {
    /// The underlying child process
    child: Child,
    /// Whether to kill the process on drop
    kill_on_drop: bool,
}

/// Stream of process events
///
/// Output events carry the raw bytes of one line including its terminator,
/// so concatenating them reproduces the output exactly. Bytes that are not
/// valid UTF-8 are replaced, never treated as the end of the pipe.
pub struct ProcessEventStream {
    stdout: Option<BoxStream<'static, String>>,
    stderr: Option<BoxStream<'static, String>>,
    started_sent: bool,
    child_id: u32,
}

/// Read `pipe` to EOF in newline-terminated chunks
fn raw_lines<R>(pipe: R) -> BoxStream<'static, String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(BufReader::new(pipe), |mut reader| async move {
        let mut chunk = Vec::new();
        match reader.read_until(b'\n', &mut chunk).await {
            Ok(0) => None,
            Ok(_) => Some((String::from_utf8_lossy(&chunk).into_owned(), reader)),
            Err(e) => {
                tracing::debug!("Output pipe read failed: {}", e);
                None
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Launcher for LocalLauncher {
    type EventStream = ProcessEventStream;
    type Handle = LocalProcessHandle;

    async fn launch(&self, command: Command) -> Result<(Self::EventStream, Self::Handle)> {
        let mut async_cmd = command.prepare();

        // Configure stdio for streaming
        async_cmd.stdin(Stdio::null());
        async_cmd.stdout(Stdio::piped());
        async_cmd.stderr(Stdio::piped());

        let mut child = async_cmd.spawn().map_err(|e| {
            Error::spawn_failed(format!(
                "Failed to spawn {}: {}",
                command.get_program().to_string_lossy(),
                e
            ))
        })?;

        let child_id = child.id();

        let stdout = child.stdout.take().map(raw_lines);
        let stderr = child.stderr.take().map(raw_lines);

        let events = ProcessEventStream {
            stdout,
            stderr,
            started_sent: false,
            child_id,
        };

        let handle = LocalProcessHandle {
            child,
            kill_on_drop: true,
        };

        Ok((events, handle))
    }
}

impl LocalProcessHandle {
    fn signal(&mut self, sig: nix::sys::signal::Signal) -> Result<()> {
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.child.id() as i32);
        nix::sys::signal::kill(pid, sig).map_err(|e| Error::signal_failed(sig as i32, e.to_string()))
    }
}

#[async_trait]
impl ProcessHandle for LocalProcessHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .status()
            .await
            .map_err(|e| Error::spawn_failed(format!("Failed to wait for process: {}", e)))?;

        Ok(ExitStatus {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
        })
    }

    async fn kill(&mut self) -> Result<()> {
        self.signal(nix::sys::signal::Signal::SIGKILL)
    }
}

impl Drop for LocalProcessHandle {
    fn drop(&mut self) {
        if self.kill_on_drop {
            // Synchronous kill; a process that already exited yields an error we ignore
            let _ = self.child.kill();
        }
    }
}

impl Stream for ProcessEventStream {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Send Started event first
        if !self.started_sent {
            self.started_sent = true;
            let event = ProcessEvent::new(ProcessEventType::Started { pid: self.child_id });
            return Poll::Ready(Some(event));
        }

        let mut closed = false;

        if let Some(stdout) = &mut self.stdout {
            match stdout.poll_next_unpin(cx) {
                Poll::Ready(Some(line)) => {
                    return Poll::Ready(Some(ProcessEvent::new_with_data(
                        ProcessEventType::Stdout,
                        line,
                    )));
                }
                Poll::Ready(None) => {
                    self.stdout = None;
                    closed = true;
                }
                Poll::Pending => {}
            }
        }

        if let Some(stderr) = &mut self.stderr {
            match stderr.poll_next_unpin(cx) {
                Poll::Ready(Some(line)) => {
                    return Poll::Ready(Some(ProcessEvent::new_with_data(
                        ProcessEventType::Stderr,
                        line,
                    )));
                }
                Poll::Ready(None) => {
                    self.stderr = None;
                    closed = true;
                }
                Poll::Pending => {}
            }
        }

        if self.stdout.is_none() && self.stderr.is_none() {
            Poll::Ready(None)
        } else if closed {
            // A side closed during this poll; make sure the other one registered a waker
            self.poll_next(cx)
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_captures_both_streams() {
        smol::block_on(async {
            let cmd = Command::shell("echo out; echo err >&2; exit 3");
            let result = LocalLauncher.execute(cmd).await.unwrap();

            assert_eq!(result.status.code, Some(3));
            assert_eq!(result.stdout, "out\n");
            assert_eq!(result.stderr, "err\n");
        });
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        smol::block_on(async {
            let cmd = Command::new("this_command_does_not_exist_12345");
            let err = LocalLauncher.execute(cmd).await.unwrap_err();
            assert!(matches!(err, Error::SpawnFailed { .. }));
        });
    }
}
