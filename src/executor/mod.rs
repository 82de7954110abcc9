//! Command executor.
//!
//! Runs one command on its own channel of a pooled connection and turns the
//! channel's raw events into an ordered [`ExecEvent`] stream:
//!
//! ```text
//! Started -> Output* -> Finished
//! ```
//!
//! Cancellation is cooperative with a hard deadline: an interrupt is sent
//! first, and the channel is force-closed if the remote side has not exited
//! when the grace period runs out.

pub mod classify;

use std::future::pending;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

pub use classify::{Classification, classify};

use crate::error::{BlockError, ErrorKind};
use crate::pool::{PoolError, PooledConnection};
use crate::ssh::{ChannelCommand, ChannelEvent, ChannelIo, ChannelRequest};

/// Default interrupt-to-teardown grace period.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Which output stream bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The remote process exited.
    Completed,
    /// Cancelled by the caller.
    Cancelled,
    /// Timed out, aborted, or the channel failed.
    Failed(BlockError),
}

/// Progress of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// The channel is open and the command is running.
    Started,
    /// Output as it arrived.
    Output {
        /// Source stream.
        stream: OutputStream,
        /// Raw bytes.
        bytes: Vec<u8>,
    },
    /// Terminal event; nothing follows it.
    Finished {
        /// Outcome.
        completion: Completion,
        /// Remote exit status, if one was reported.
        exit_code: Option<i32>,
    },
}

/// Per-execution settings.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Request a pseudo terminal for the channel.
    pub pty: bool,
    /// Interrupt-to-teardown grace period.
    pub cancel_grace: Duration,
    /// Deadline for one-shot commands.
    pub command_timeout: Option<Duration>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            pty: false,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            command_timeout: None,
        }
    }
}

#[derive(Debug)]
enum Control {
    Stdin(Vec<u8>),
    CloseStdin,
    Cancel,
    Abort(BlockError),
}

/// Handle for steering a running execution. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    tx: mpsc::UnboundedSender<Control>,
}

impl ExecutionControl {
    /// Interrupts the command, force-closing after the grace period.
    pub fn cancel(&self) {
        let _ = self.tx.send(Control::Cancel);
    }

    /// Writes to the command's stdin.
    pub fn write_stdin(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.tx.send(Control::Stdin(bytes.into()));
    }

    /// Sends EOF on stdin.
    pub fn close_stdin(&self) {
        let _ = self.tx.send(Control::CloseStdin);
    }

    /// Tears the channel down now and finishes with `error`.
    pub fn abort(&self, error: BlockError) {
        let _ = self.tx.send(Control::Abort(error));
    }

    /// Returns true once the execution has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running command.
#[derive(Debug)]
pub struct Execution {
    /// Ordered progress events, ending with [`ExecEvent::Finished`].
    pub events: mpsc::UnboundedReceiver<ExecEvent>,
    /// Control handle.
    pub control: ExecutionControl,
}

/// Starts `command` on a fresh channel of `connection`.
///
/// # Errors
/// Returns an error if the connection is not Ready or the channel cannot be
/// opened.
pub async fn execute(
    connection: &PooledConnection,
    command: &str,
    classification: Classification,
    options: &ExecOptions,
) -> Result<Execution, PoolError> {
    assert!(!options.cancel_grace.is_zero(), "cancel grace must be positive");

    let channel = connection
        .open_channel(ChannelRequest::Exec {
            command: command.to_string(),
            pty: options.pty,
        })
        .await?;
    debug!(connection = connection.id(), command, %classification, "Command started");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        channel,
        control: control_rx,
        events: event_tx,
        classification,
        options: options.clone(),
    };
    tokio::spawn(driver.run());

    Ok(Execution {
        events: event_rx,
        control: ExecutionControl { tx: control_tx },
    })
}

/// Why teardown was scheduled.
#[derive(Debug, Clone, Copy)]
enum Stop {
    Cancel,
    Timeout,
}

struct Driver {
    channel: ChannelIo,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<ExecEvent>,
    classification: Classification,
    options: ExecOptions,
}

impl Driver {
    async fn run(mut self) {
        self.emit(ExecEvent::Started);
        if self.classification != Classification::Interactive {
            self.command(ChannelCommand::CloseStdin);
        }

        let mut timeout_at = match self.classification {
            Classification::OneShot => self.options.command_timeout.map(|t| Instant::now() + t),
            _ => None,
        };
        let mut stopping: Option<(Stop, Instant)> = None;
        let mut exit_code = None;
        let mut control_open = true;

        let completion = loop {
            let force_at = stopping.map(|(_, at)| at);
            tokio::select! {
                event = self.channel.events.recv() => match event {
                    Some(ChannelEvent::Stdout(bytes)) => self.output(OutputStream::Stdout, bytes),
                    Some(ChannelEvent::Stderr(bytes)) => self.output(OutputStream::Stderr, bytes),
                    Some(ChannelEvent::Exit(code)) => exit_code = Some(code),
                    Some(ChannelEvent::Closed) | None => {
                        break match (stopping, exit_code) {
                            (Some((stop, _)), _) => stopped(stop),
                            (None, Some(_)) => Completion::Completed,
                            (None, None) => Completion::Failed(BlockError::new(
                                ErrorKind::Network,
                                "channel closed without exit status",
                            )),
                        };
                    }
                    Some(ChannelEvent::Error(e)) => match stopping {
                        // Teardown already requested; the channel going away is the expected end.
                        Some((stop, _)) => {
                            debug!(error = %e, "Channel failed during teardown");
                            break stopped(stop);
                        }
                        None => break Completion::Failed(BlockError::new(e.kind(), e.to_string())),
                    },
                },
                message = self.control.recv(), if control_open => match message {
                    Some(Control::Stdin(bytes)) => self.command(ChannelCommand::Stdin(bytes)),
                    Some(Control::CloseStdin) => self.command(ChannelCommand::CloseStdin),
                    Some(Control::Cancel) => {
                        if stopping.is_none() {
                            stopping = Some((Stop::Cancel, self.interrupt()));
                        }
                    }
                    Some(Control::Abort(error)) => {
                        self.command(ChannelCommand::Close);
                        break Completion::Failed(error);
                    }
                    None => control_open = false,
                },
                () = deadline(force_at) => {
                    warn!(grace_ms = self.options.cancel_grace.as_millis() as u64, "Interrupt ignored, closing channel");
                    self.command(ChannelCommand::Close);
                    let stop = stopping.map_or(Stop::Cancel, |(stop, _)| stop);
                    break stopped(stop);
                }
                () = deadline(timeout_at), if stopping.is_none() => {
                    timeout_at = None;
                    stopping = Some((Stop::Timeout, self.interrupt()));
                }
            }
        };

        debug!(?completion, ?exit_code, "Command finished");
        self.emit(ExecEvent::Finished { completion, exit_code });
    }

    fn emit(&self, event: ExecEvent) {
        let _ = self.events.send(event);
    }

    fn output(&self, stream: OutputStream, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.emit(ExecEvent::Output { stream, bytes });
        }
    }

    fn command(&self, command: ChannelCommand) {
        let _ = self.channel.control.send(command);
    }

    /// Sends an interrupt and returns the teardown deadline.
    fn interrupt(&self) -> Instant {
        self.command(ChannelCommand::Interrupt);
        Instant::now() + self.options.cancel_grace
    }
}

fn stopped(stop: Stop) -> Completion {
    match stop {
        Stop::Cancel => Completion::Cancelled,
        Stop::Timeout => Completion::Failed(BlockError::new(ErrorKind::Timeout, "command timed out")),
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spawn(classification: Classification, options: ExecOptions) -> (Execution, crate::ssh::ChannelEnd) {
        let (channel, end) = ChannelIo::pair();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Driver {
                channel,
                control: control_rx,
                events: event_tx,
                classification,
                options,
            }
            .run(),
        );
        (
            Execution {
                events: event_rx,
                control: ExecutionControl { tx: control_tx },
            },
            end,
        )
    }

    async fn finished(execution: &mut Execution) -> (Completion, Option<i32>) {
        while let Some(event) = execution.events.recv().await {
            if let ExecEvent::Finished { completion, exit_code } = event {
                return (completion, exit_code);
            }
        }
        panic!("execution ended without Finished");
    }

    #[tokio::test]
    async fn test_exit_completes_with_code() {
        let (mut exec, mut end) = spawn(Classification::OneShot, ExecOptions::default());
        assert_eq!(exec.events.recv().await, Some(ExecEvent::Started));
        assert_eq!(end.control.recv().await, Some(ChannelCommand::CloseStdin));

        end.events.send(ChannelEvent::Stderr(b"bad\n".to_vec())).unwrap();
        end.events.send(ChannelEvent::Exit(2)).unwrap();
        end.events.send(ChannelEvent::Closed).unwrap();

        assert_eq!(
            exec.events.recv().await,
            Some(ExecEvent::Output {
                stream: OutputStream::Stderr,
                bytes: b"bad\n".to_vec()
            })
        );
        assert_eq!(finished(&mut exec).await, (Completion::Completed, Some(2)));
    }

    #[tokio::test]
    async fn test_interactive_keeps_stdin_open() {
        let (exec, mut end) = spawn(Classification::Interactive, ExecOptions::default());
        exec.control.write_stdin(b"hi".to_vec());
        assert_eq!(end.control.recv().await, Some(ChannelCommand::Stdin(b"hi".to_vec())));
        exec.control.close_stdin();
        assert_eq!(end.control.recv().await, Some(ChannelCommand::CloseStdin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_escalates_to_close() {
        let (mut exec, mut end) = spawn(Classification::Continuous, ExecOptions::default());
        assert_eq!(end.control.recv().await, Some(ChannelCommand::CloseStdin));

        let started = Instant::now();
        exec.control.cancel();
        assert_eq!(end.control.recv().await, Some(ChannelCommand::Interrupt));
        // Remote ignores the interrupt.
        assert_eq!(end.control.recv().await, Some(ChannelCommand::Close));
        assert_eq!(finished(&mut exec).await, (Completion::Cancelled, None));
        assert!(started.elapsed() >= DEFAULT_CANCEL_GRACE);
        assert!(started.elapsed() < DEFAULT_CANCEL_GRACE + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_timeout_fails() {
        let options = ExecOptions {
            command_timeout: Some(Duration::from_secs(5)),
            ..ExecOptions::default()
        };
        let (mut exec, mut end) = spawn(Classification::OneShot, options);
        assert_eq!(end.control.recv().await, Some(ChannelCommand::CloseStdin));
        assert_eq!(end.control.recv().await, Some(ChannelCommand::Interrupt));
        end.events.send(ChannelEvent::Exit(130)).unwrap();
        end.events.send(ChannelEvent::Closed).unwrap();

        let (completion, code) = finished(&mut exec).await;
        assert!(matches!(completion, Completion::Failed(ref e) if e.kind == ErrorKind::Timeout));
        assert_eq!(code, Some(130));
    }

    #[tokio::test]
    async fn test_abort_reports_error() {
        let (mut exec, mut end) = spawn(Classification::Continuous, ExecOptions::default());
        exec.control.abort(BlockError::connection_lost("gone"));
        let (completion, _) = finished(&mut exec).await;
        assert_eq!(completion, Completion::Failed(BlockError::connection_lost("gone")));
        assert_eq!(end.control.recv().await, Some(ChannelCommand::CloseStdin));
        assert_eq!(end.control.recv().await, Some(ChannelCommand::Close));
    }

    #[tokio::test]
    async fn test_channel_error_fails_with_network_kind() {
        let (mut exec, end) = spawn(Classification::OneShot, ExecOptions::default());
        end.events
            .send(ChannelEvent::Error(crate::ssh::TransportError::Network("reset".into())))
            .unwrap();
        let (completion, _) = finished(&mut exec).await;
        assert!(matches!(completion, Completion::Failed(ref e) if e.kind == ErrorKind::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_after_cancel_is_still_cancelled() {
        let (mut exec, mut end) = spawn(Classification::Continuous, ExecOptions::default());
        assert_eq!(end.control.recv().await, Some(ChannelCommand::CloseStdin));

        exec.control.cancel();
        assert_eq!(end.control.recv().await, Some(ChannelCommand::Interrupt));
        // Server refuses the ^C because stdin is already at EOF.
        end.events
            .send(ChannelEvent::Error(crate::ssh::TransportError::Network(
                "channel write failed: EOF already sent".into(),
            )))
            .unwrap();

        assert_eq!(finished(&mut exec).await, (Completion::Cancelled, None));
    }
}
