// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operator console
//!
//! Reads lines from stdin on a dedicated thread and forwards them over a
//! bounded channel. The async side waits on the channel with a timeout so
//! the run flag is re-checked at least once per poll interval.
//!
//! The reader thread ends on EOF, or on the first line read after the
//! console has been dropped. A thread blocked in `read_line` cannot be
//! interrupted, so for stdin it is released when the process exits.

use crate::lifecycle::{RunFlag, StopHandle, StopTrigger, UnitExit};
use std::io::BufRead;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lines buffered between the reader thread and the console unit.
const LINE_CAPACITY: usize = 16;

/// Operator stop command.
pub const STOP_COMMAND: &str = "q";

/// Line-based operator input.
///
/// Owns the reader thread, if any. Dropping the console releases the
/// channel once; the thread notices on its next line or at EOF.
pub struct OperatorConsole {
    lines: mpsc::Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl OperatorConsole {
    /// Start reading stdin on a background thread.
    ///
    /// The thread stays blocked on stdin after the console is dropped and
    /// is reclaimed at process exit.
    pub fn stdin() -> std::io::Result<Self> {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Start reading lines from `reader` on a background thread.
    pub fn from_reader<R>(reader: R) -> std::io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, lines) = mpsc::channel(LINE_CAPACITY);

        let handle = std::thread::Builder::new()
            .name("uwb-console".to_string())
            .spawn(move || {
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if tx.blocking_send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("console read failed: {}", e);
                            break;
                        }
                    }
                }
                tracing::debug!("console reader finished");
            })?;

        Ok(Self {
            lines,
            reader: Some(handle),
        })
    }

    /// Console fed from an existing channel.
    pub fn from_receiver(lines: mpsc::Receiver<String>) -> Self {
        Self {
            lines,
            reader: None,
        }
    }

    /// Console plus the sender that feeds it.
    pub fn channel() -> (mpsc::Sender<String>, Self) {
        let (tx, lines) = mpsc::channel(LINE_CAPACITY);
        (tx, Self::from_receiver(lines))
    }

    /// `true` once the reader thread has exited, or when there is none.
    pub fn reader_finished(&self) -> bool {
        self.reader.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for OperatorConsole {
    fn drop(&mut self) {
        match self.reader.take() {
            Some(handle) if handle.is_finished() => {
                if handle.join().is_err() {
                    tracing::warn!("console reader panicked");
                }
            }
            Some(_) => tracing::debug!("console reader still blocked on input, detached"),
            None => {}
        }
    }
}

/// `true` for `q`, ignoring case and surrounding whitespace.
pub fn is_stop_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(STOP_COMMAND)
}

/// Console unit: wait for the stop command while collection is running.
///
/// Each wait is bounded by `poll`; an expired wait only re-checks the run
/// flag. Closed input leaves the unit idle until it is cancelled, since the
/// signal and the broker can still end the run.
pub async fn watch_for_stop(
    mut console: OperatorConsole,
    run_flag: RunFlag,
    stop: StopHandle,
    cancel: CancellationToken,
    poll: Duration,
) -> UnitExit {
    while run_flag.is_collecting() {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return UnitExit::Cancelled,
            waited = tokio::time::timeout(poll, console.lines.recv()) => match waited {
                Ok(line) => line,
                Err(_) => continue,
            },
        };

        match line {
            Some(line) if is_stop_command(&line) => {
                tracing::info!("Stop command received");
                stop.request(StopTrigger::Operator);
                return UnitExit::Completed;
            }
            Some(line) => {
                if !line.trim().is_empty() {
                    tracing::info!("Unknown command {:?}, type q + Enter to stop", line.trim());
                }
            }
            None => {
                tracing::info!("Console input closed, stop with Ctrl+C");
                cancel.cancelled().await;
                return UnitExit::Cancelled;
            }
        }
    }

    UnitExit::Completed
}
